//! Middleware pipeline: ordered hooks around every dispatched request.
//!
//! This module defines the types that make up the onion around a handler.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware; every hook is optional.
//! - [`MiddlewareChain`]: the ordered stack. The first middleware added is the
//!   outermost layer: its `before_request` runs first and its `after_request`
//!   runs last.
//! - [`AccessLogMiddleware`]: one structured log line per request.
//! - [`ErrorHandlerMiddleware`]: renders unexpected errors in debug or
//!   production form. Every [`App`](crate::App) installs one as its outermost layer.
//!
//! ## Hook failures
//!
//! A declared [`HttpError`](crate::HttpError) returned from `before_request` is a
//! rejection: the handler is skipped, the error is translated like any handler
//! error, and the layers that had already run `before_request` still see the
//! response on the way out. Every other hook failure is fatal for the request and
//! yields a bare `500` without running further hooks.

use std::{fmt, sync::Arc};

use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info};

use crate::{
    error::Error,
    http::{Request, Response, StatusCode},
};

/// The core trait for all blaze middleware.
///
/// Hooks are synchronous and default to pass-through. Middleware is shared by
/// every in-flight request, so state it mutates must be synchronized.
///
/// # Examples
///
/// ```rust
/// use blaze::{Error, Request, Response, middleware::Middleware};
///
/// struct Trace(&'static str);
///
/// impl Middleware for Trace {
///     fn before_request(&self, request: &mut Request) -> Result<(), Error> {
///         let seen = request.headers().get("x-trace").unwrap_or("").to_owned();
///         request.headers_mut().set("x-trace", format!("{seen}{}", self.0));
///         Ok(())
///     }
///
///     fn after_request(&self, _request: &Request, response: &mut Response) -> Result<(), Error> {
///         let seen = response.headers().get("x-trace").unwrap_or("").to_owned();
///         response.headers_mut().set("x-trace", format!("{seen}{}", self.0));
///         Ok(())
///     }
/// }
/// ```
pub trait Middleware: Send + Sync {
    /// Inspects or rewrites the request before the handler runs.
    ///
    /// Returning a declared error rejects the request with that error.
    fn before_request(&self, request: &mut Request) -> Result<(), Error> {
        let _ = request;
        Ok(())
    }

    /// Decorates the response on its way out.
    fn after_request(&self, request: &Request, response: &mut Response) -> Result<(), Error> {
        let _ = (request, response);
        Ok(())
    }

    /// Offers a replacement response for a handler or dependency error.
    ///
    /// The first middleware returning `Some` decides the response.
    fn on_error(&self, request: &Request, error: &Error) -> Result<Option<Response>, Error> {
        let _ = (request, error);
        Ok(None)
    }

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A middleware hook failed with something other than a rejection.
#[derive(Debug, Error)]
#[error("middleware `{middleware}` failed in {hook}: {message}")]
pub struct HookError {
    middleware: &'static str,
    hook: &'static str,
    message: String,
}

impl HookError {
    fn log(middleware: &'static str, hook: &'static str, error: &Error) -> Self {
        let failure = Self {
            middleware,
            hook,
            message: error.message(),
        };
        error!(
            middleware,
            hook,
            error = %failure.message,
            type_name = error.type_name(),
            "middleware hook failed"
        );
        failure
    }
}

/// How the `before_request` phase ended early.
#[derive(Debug)]
pub enum BeforeError {
    /// A layer rejected the request with a declared error.
    ///
    /// `completed` counts the outer layers whose `before_request` succeeded.
    Rejected { completed: usize, error: Error },
    Fatal(HookError),
}

/// The ordered middleware stack.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `middleware` inside every layer added before it.
    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.layers.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }

    /// Runs every `before_request` hook, outermost first.
    pub fn run_before(&self, request: &mut Request) -> Result<(), BeforeError> {
        for (index, layer) in self.layers.iter().enumerate() {
            if let Err(error) = layer.before_request(request) {
                if error.is_declared() {
                    return Err(BeforeError::Rejected {
                        completed: index,
                        error,
                    });
                }
                return Err(BeforeError::Fatal(HookError::log(
                    layer.name(),
                    "before_request",
                    &error,
                )));
            }
        }
        Ok(())
    }

    /// Runs `after_request` for the outermost `depth` layers, innermost first.
    pub fn run_after(
        &self,
        request: &Request,
        response: &mut Response,
        depth: usize,
    ) -> Result<(), HookError> {
        for layer in self.layers.iter().take(depth).rev() {
            layer
                .after_request(request, response)
                .map_err(|e| HookError::log(layer.name(), "after_request", &e))?;
        }
        Ok(())
    }

    /// Asks each layer, outermost first, for a replacement error response.
    pub fn run_on_error(&self, request: &Request, error: &Error) -> Result<Option<Response>, HookError> {
        for layer in &self.layers {
            let replacement = layer
                .on_error(request, error)
                .map_err(|e| HookError::log(layer.name(), "on_error", &e))?;
            if replacement.is_some() {
                return Ok(replacement);
            }
        }
        Ok(None)
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Start time stored in the request extensions by [`AccessLogMiddleware`].
#[derive(Debug, Clone, Copy)]
pub struct RequestStart(pub Instant);

/// Built-in middleware that logs each request's method, path, status, and duration.
///
/// Records the start time in `before_request` and emits a single `tracing::info!`
/// event with `method`, `path`, `status` and `duration_ms` fields in
/// `after_request`.
///
/// # Examples
///
/// ```rust,no_run
/// use blaze::{App, middleware::AccessLogMiddleware};
///
/// let mut app = App::new();
/// app.add_middleware(AccessLogMiddleware);
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct AccessLogMiddleware;

impl Middleware for AccessLogMiddleware {
    fn before_request(&self, request: &mut Request) -> Result<(), Error> {
        request.extensions_mut().insert(RequestStart(Instant::now()));
        Ok(())
    }

    fn after_request(&self, request: &Request, response: &mut Response) -> Result<(), Error> {
        let duration_ms = request
            .extensions()
            .get::<RequestStart>()
            .map(|start| start.0.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or_default();

        info!(
            method = %request.method(),
            path = request.path(),
            status = response.status().as_u16(),
            duration_ms,
            "request completed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "access_log"
    }
}

/// Renders unexpected errors; declared errors are left to the exception handlers.
///
/// In debug mode the body carries the error's type name, message, and backtrace:
///
/// ```text
/// {"error": "std::io::error::Error", "detail": "socket closed", "traceback": [...]}
/// ```
///
/// In production mode it is always
/// `{"error": "Internal Server Error", "detail": "An unexpected error occurred"}`.
#[derive(Debug, Clone, Copy)]
pub struct ErrorHandlerMiddleware {
    debug: bool,
}

impl ErrorHandlerMiddleware {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    pub fn debug(&self) -> bool {
        self.debug
    }
}

impl Middleware for ErrorHandlerMiddleware {
    fn on_error(&self, request: &Request, error: &Error) -> Result<Option<Response>, Error> {
        if error.is_declared() {
            return Ok(None);
        }

        error!(
            method = %request.method(),
            path = request.path(),
            error = %error.message(),
            type_name = error.type_name(),
            "unhandled error"
        );

        let body = if self.debug {
            json!({
                "error": error.type_name(),
                "detail": error.message(),
                "traceback": error.trace(),
            })
        } else {
            json!({
                "error": "Internal Server Error",
                "detail": "An unexpected error occurred",
            })
        };
        Ok(Some(Response::with_json(StatusCode::InternalServerError, &body)))
    }

    fn name(&self) -> &'static str {
        "error_handler"
    }
}
