//! The application: route registry, lifecycle hooks, and public surface.
//!
//! [`App`] owns the route table and produces one [`DispatchFn`] per route. Engines
//! either call those callables directly (from [`App::register`]) or hand whole
//! requests to [`App::handle`], which matches the path and falls back to the
//! not-found pipeline.
//!
//! # Examples
//!
//! ```rust,no_run
//! use blaze::{App, Context, Error, HttpError, Json};
//! use blaze::router::{Endpoint, Kind};
//!
//! async fn get_user(ctx: Context) -> Result<Json<serde_json::Value>, Error> {
//!     let id: i64 = ctx.arg("id")?;
//!     if id == 0 {
//!         return Err(HttpError::not_found("no such user").into());
//!     }
//!     Ok(Json(serde_json::json!({ "id": id })))
//! }
//!
//! # fn main() -> Result<(), blaze::RegistryError> {
//! let mut app = App::new();
//! app.get("/users/{id}", Endpoint::new(get_user).path("id", Kind::Int))?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::{
    BoxFuture,
    background::TaskOutcome,
    config::AppConfig,
    context::Context,
    dependency::{Dependency, DependencyOverrides, Value},
    dispatch::{self, Core, DispatchFn},
    error::{Error, RegistryError},
    exception::ExceptionHandlers,
    http::{IntoResponse, Method, Request, Response, StatusCode},
    middleware::{Middleware, MiddlewareChain},
    router::{Endpoint, IntoEndpoint, RouteTable, Router},
};

type Hook = Box<dyn Fn() -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Metadata for one registered route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub method: Method,
    pub path: String,
    pub name: String,
    pub tags: Vec<String>,
    /// `true` for the `OPTIONS` route added automatically next to another route.
    pub implicit: bool,
}

struct RouteEntry {
    info: RouteInfo,
    dispatch: DispatchFn,
}

/// The route registry and everything shared by its routes.
pub struct App {
    config: AppConfig,
    core: Arc<Core>,
    table: RouteTable,
    routes: Vec<RouteEntry>,
    index: HashMap<(Method, String), usize>,
    startup: Vec<Hook>,
    shutdown: Vec<Hook>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    /// An application with the default (production) configuration.
    pub fn new() -> Self {
        Self::with_config(AppConfig::default())
    }

    pub fn with_config(config: AppConfig) -> Self {
        Self {
            core: Arc::new(Core::new(config.debug)),
            config,
            table: RouteTable::new(),
            routes: Vec::new(),
            index: HashMap::new(),
            startup: Vec::new(),
            shutdown: Vec::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Registers `endpoint` for `method` and `path` and returns its dispatch callable.
    ///
    /// An `OPTIONS` route answering `200` with an empty body is added for `path`
    /// unless one exists; an explicit `OPTIONS` registration later replaces it.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Duplicate`] if `(method, path)` is already registered, and
    /// [`RegistryError::InvalidPath`] if the pattern is malformed or conflicts
    /// with another pattern for the same method.
    pub fn register(
        &mut self,
        method: Method,
        path: &str,
        endpoint: impl IntoEndpoint,
        tags: Vec<String>,
    ) -> Result<DispatchFn, RegistryError> {
        let dispatch = self.insert(method.clone(), path, endpoint.into_endpoint(), tags, false)?;
        info!(method = %method, path, "route registered");

        let options = (Method::Options, path.to_owned());
        if method != Method::Options && !self.index.contains_key(&options) {
            let implicit = Endpoint::new(implicit_options).name("options");
            if let Err(e) = self.insert(Method::Options, path, implicit, Vec::new(), true) {
                debug!(path, error = %e, "implicit OPTIONS route skipped");
            }
        }
        Ok(dispatch)
    }

    fn insert(
        &mut self,
        method: Method,
        path: &str,
        endpoint: Endpoint,
        tags: Vec<String>,
        implicit: bool,
    ) -> Result<DispatchFn, RegistryError> {
        let key = (method.clone(), path.to_owned());
        let existing = self.index.get(&key).copied();
        if let Some(index) = existing {
            if implicit || !self.routes[index].info.implicit {
                return Err(RegistryError::Duplicate {
                    method,
                    path: path.to_owned(),
                });
            }
        }

        let info = RouteInfo {
            method: method.clone(),
            path: path.to_owned(),
            name: endpoint.handler_name().to_owned(),
            tags,
            implicit,
        };
        let dispatch = dispatch::wrap(Arc::clone(&self.core), Arc::new(endpoint));
        let entry = RouteEntry {
            info,
            dispatch: Arc::clone(&dispatch),
        };

        match existing {
            // An explicit OPTIONS route takes over the implicit one's slot.
            Some(index) => self.routes[index] = entry,
            None => {
                let index = self.routes.len();
                self.table
                    .insert(&method, path, index)
                    .map_err(|e| RegistryError::InvalidPath {
                        method,
                        path: path.to_owned(),
                        reason: e.to_string(),
                    })?;
                self.routes.push(entry);
                self.index.insert(key, index);
            }
        }
        Ok(dispatch)
    }

    /// Register a handler for `GET` requests matching `path`.
    pub fn get(&mut self, path: &str, endpoint: impl IntoEndpoint) -> Result<&mut Self, RegistryError> {
        self.register(Method::Get, path, endpoint, Vec::new())?;
        Ok(self)
    }

    /// Register a handler for `POST` requests matching `path`.
    pub fn post(&mut self, path: &str, endpoint: impl IntoEndpoint) -> Result<&mut Self, RegistryError> {
        self.register(Method::Post, path, endpoint, Vec::new())?;
        Ok(self)
    }

    /// Register a handler for `PUT` requests matching `path`.
    pub fn put(&mut self, path: &str, endpoint: impl IntoEndpoint) -> Result<&mut Self, RegistryError> {
        self.register(Method::Put, path, endpoint, Vec::new())?;
        Ok(self)
    }

    /// Register a handler for `DELETE` requests matching `path`.
    pub fn delete(&mut self, path: &str, endpoint: impl IntoEndpoint) -> Result<&mut Self, RegistryError> {
        self.register(Method::Delete, path, endpoint, Vec::new())?;
        Ok(self)
    }

    /// Register a handler for `PATCH` requests matching `path`.
    pub fn patch(&mut self, path: &str, endpoint: impl IntoEndpoint) -> Result<&mut Self, RegistryError> {
        self.register(Method::Patch, path, endpoint, Vec::new())?;
        Ok(self)
    }

    /// Register a handler for `OPTIONS` requests matching `path`.
    pub fn options(&mut self, path: &str, endpoint: impl IntoEndpoint) -> Result<&mut Self, RegistryError> {
        self.register(Method::Options, path, endpoint, Vec::new())?;
        Ok(self)
    }

    /// Registers every route of `router`, exactly as if each was added directly.
    pub fn include(&mut self, router: Router) -> Result<&mut Self, RegistryError> {
        for route in router.into_routes() {
            let (method, path, endpoint, tags) = route.into_parts();
            self.register(method, &path, endpoint, tags)?;
        }
        Ok(self)
    }

    /// Metadata for every route, in registration order.
    pub fn routes(&self) -> Vec<RouteInfo> {
        self.routes.iter().map(|entry| entry.info.clone()).collect()
    }

    /// The dispatch callable registered for `(method, path)`.
    pub fn dispatcher(&self, method: &Method, path: &str) -> Option<DispatchFn> {
        let index = *self.index.get(&(method.clone(), path.to_owned()))?;
        Some(Arc::clone(&self.routes[index].dispatch))
    }

    /// Adds `middleware` inside every middleware added before it.
    pub fn add_middleware(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        let mut chain = MiddlewareChain::clone(&self.core.middleware.load());
        chain.push(Arc::new(middleware));
        info!(middleware = chain.names().last().copied().unwrap_or_default(), "middleware added");
        self.core.middleware.store(Arc::new(chain));
        self
    }

    /// Handles every error (raised or returned) whose status is `status`.
    pub fn exception_handler_status<F, R>(&mut self, status: StatusCode, handler: F) -> &mut Self
    where
        F: Fn(&Request, &Error) -> R + Send + Sync + 'static,
        R: IntoResponse,
    {
        self.update_handlers(|handlers| handlers.on_status(status, handler));
        self
    }

    /// Handles every raised error whose concrete type is `E`.
    pub fn exception_handler_type<E, F, R>(&mut self, handler: F) -> &mut Self
    where
        E: StdError + 'static,
        F: Fn(&Request, &Error) -> R + Send + Sync + 'static,
        R: IntoResponse,
    {
        self.update_handlers(|handlers| handlers.on_type::<E, F, R>(handler));
        self
    }

    fn update_handlers(&self, update: impl FnOnce(&mut ExceptionHandlers)) {
        let mut handlers = ExceptionHandlers::clone(&self.core.exception_handlers.load());
        update(&mut handlers);
        self.core.exception_handlers.store(Arc::new(handlers));
    }

    /// Makes `dependency` resolve to `value` for every request from now on.
    pub fn override_dependency<T: Send + Sync + 'static>(&self, dependency: &Dependency, value: T) {
        let id = dependency.id();
        let value: Value = Arc::new(value);
        self.core.overrides.rcu(|current| {
            let mut next = (**current).clone();
            next.insert_value(id, Arc::clone(&value));
            next
        });
    }

    pub fn remove_override(&self, dependency: &Dependency) {
        self.core.overrides.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(dependency);
            next
        });
    }

    pub fn clear_overrides(&self) {
        self.core.overrides.store(Arc::new(DependencyOverrides::new()));
    }

    /// Shares `value` with every handler through [`Context::state`].
    pub fn state<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        let mut state = (**self.core.state.load()).clone();
        state.insert(value);
        self.core.state.store(Arc::new(state));
        self
    }

    /// Registers an async hook run by [`startup`](Self::startup).
    pub fn on_startup<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: TaskOutcome,
    {
        self.startup.push(async_hook(hook));
        self
    }

    pub fn on_startup_sync<F, O>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: TaskOutcome,
    {
        self.startup.push(sync_hook(hook));
        self
    }

    /// Registers an async hook run by [`shutdown`](Self::shutdown).
    pub fn on_shutdown<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: TaskOutcome,
    {
        self.shutdown.push(async_hook(hook));
        self
    }

    pub fn on_shutdown_sync<F, O>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: TaskOutcome,
    {
        self.shutdown.push(sync_hook(hook));
        self
    }

    /// Runs the startup hooks in registration order, stopping at the first failure.
    pub async fn startup(&self) -> Result<(), Error> {
        for (index, hook) in self.startup.iter().enumerate() {
            if let Err(e) = hook().await {
                error!(hook = index, error = %e.message(), "startup hook failed");
                return Err(e);
            }
        }
        info!(hooks = self.startup.len(), "application started");
        Ok(())
    }

    /// Runs every shutdown hook; failures are logged and do not stop the rest.
    pub async fn shutdown(&self) {
        for (index, hook) in self.shutdown.iter().enumerate() {
            if let Err(e) = hook().await {
                error!(hook = index, error = %e.message(), "shutdown hook failed");
            }
        }
        info!(hooks = self.shutdown.len(), "application stopped");
    }

    /// Matches `request` against the route table and dispatches it.
    pub async fn handle(&self, mut request: Request) -> Response {
        match self.table.at(request.method(), request.path()) {
            Some((index, params)) => {
                request.set_path_params(params);
                let dispatch = Arc::clone(&self.routes[index].dispatch);
                dispatch(request).await
            }
            None => self.not_found(request).await,
        }
    }

    /// The 404 fallback, run through the same middleware and exception handlers.
    pub async fn not_found(&self, request: Request) -> Response {
        dispatch::dispatch(&self.core, None, request).await
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("config", &self.config)
            .field("routes", &self.routes.len())
            .field("middleware", &self.core.middleware.load().names())
            .finish()
    }
}

async fn implicit_options(_ctx: Context) -> Result<Response, Error> {
    Ok(Response::new(StatusCode::Ok))
}

fn async_hook<F, Fut>(hook: F) -> Hook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: TaskOutcome,
{
    Box::new(move || -> BoxFuture<'static, Result<(), Error>> {
        let fut = hook();
        Box::pin(async move { fut.await.into_result() })
    })
}

fn sync_hook<F, O>(hook: F) -> Hook
where
    F: Fn() -> O + Send + Sync + 'static,
    O: TaskOutcome,
{
    Box::new(move || -> BoxFuture<'static, Result<(), Error>> {
        Box::pin(std::future::ready(hook().into_result()))
    })
}
