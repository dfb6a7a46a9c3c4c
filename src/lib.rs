//! # blaze
//!
//! The request-orchestration core of an async HTTP API framework: route
//! registration, dependency injection with caching and scoped teardown, an
//! onion-model middleware chain, exception translation, and background tasks
//! that run after the response is sent.
//!
//! A bundled HTTP/1.1 engine ([`Server`]) drives an [`App`], but any engine can
//! call the per-route [`DispatchFn`]s returned by [`App::register`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blaze::{App, Context, Error, HttpError, Json, Server};
//! use blaze::middleware::AccessLogMiddleware;
//! use blaze::router::{Endpoint, Kind};
//!
//! async fn get_item(ctx: Context) -> Result<Json<serde_json::Value>, Error> {
//!     let id: i64 = ctx.arg("id")?;
//!     if id > 100 {
//!         return Err(HttpError::not_found("item not found").into());
//!     }
//!     Ok(Json(serde_json::json!({ "id": id })))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut app = App::new();
//!     app.add_middleware(AccessLogMiddleware);
//!     app.get("/items/{id}", Endpoint::new(get_item).path("id", Kind::Int))?;
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.serve(Arc::new(app)).await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod app;
pub mod background;
pub mod config;
pub mod context;
pub mod dependency;
pub mod dispatch;
pub mod error;
pub mod exception;
pub mod http;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use app::{App, RouteInfo};
pub use config::AppConfig;
pub use context::Context;
pub use dependency::{Dependency, Depends, Scoped};
pub use dispatch::DispatchFn;
pub use error::{Error, HttpError, RegistryError};
pub use http::{Headers, Html, IntoResponse, Json, Method, Redirect, Request, Response, StatusCode};
pub use server::{Server, ServerError};
