//! A small users API served by the bundled engine.
//!
//! ```text
//! RUST_LOG=info cargo run --example users
//! curl -H 'Authorization: Bearer secret' localhost:8080/users/1
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use blaze::middleware::AccessLogMiddleware;
use blaze::router::{Endpoint, Kind, Router};
use blaze::security::{CorsMiddleware, RateLimitMiddleware, SlidingWindowLimiter, bearer_token};
use blaze::{App, AppConfig, Context, Dependency, Depends, Error, HttpError, Json, Scoped, Server, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct User {
    id: i64,
    name: String,
}

type Store = Arc<Mutex<HashMap<i64, User>>>;

struct Session {
    user: String,
}

async fn get_user(ctx: Context) -> Result<Json<User>, Error> {
    let id: i64 = ctx.arg("id")?;
    let store = ctx.state::<Store>()?;
    let user = store
        .lock()
        .map_err(|_| Error::msg("user store poisoned"))?
        .get(&id)
        .cloned()
        .ok_or_else(|| HttpError::not_found(format!("user {id} not found")))?;
    Ok(Json(user))
}

async fn create_user(ctx: Context) -> Result<(Json<User>, StatusCode), Error> {
    let user: User = ctx.arg("user")?;
    let session = ctx.dep::<Session>("session")?;
    info!(by = %session.user, id = user.id, "creating user");

    ctx.state::<Store>()?
        .lock()
        .map_err(|_| Error::msg("user store poisoned"))?
        .insert(user.id, user.clone());

    let name = user.name.clone();
    ctx.background().add(move || async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!(%name, "welcome email sent");
    });
    Ok((Json(user), StatusCode::Created))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let token = bearer_token();
    let session = Dependency::scoped("session", |ctx| async move {
        let token = ctx.get::<String>("token")?.clone();
        info!("session opened");
        Ok::<_, Error>(Scoped::new(Session { user: token }, || async {
            info!("session closed");
        }))
    })
    .param("token", Depends::new(&token));

    let mut users = Router::new("/users").tag("users");
    users
        .get("/{id}", Endpoint::new(get_user).path("id", Kind::Int))
        .post(
            "/",
            Endpoint::new(create_user)
                .body("user")
                .depends("session", Depends::new(&session)),
        );

    let config = AppConfig::default().title("Users API").with_env()?;
    let mut app = App::with_config(config);
    app.add_middleware(AccessLogMiddleware)
        .add_middleware(CorsMiddleware::new())
        .add_middleware(RateLimitMiddleware::new(Arc::new(SlidingWindowLimiter::new(
            100,
            Duration::from_secs(60),
        ))));
    app.state(Store::default());
    app.include(users)?;
    app.on_startup_sync(|| info!("users API starting"));

    let server = Server::bind("127.0.0.1:8080").await?;
    server.serve(Arc::new(app)).await?;
    Ok(())
}
