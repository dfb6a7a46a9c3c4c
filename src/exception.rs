//! Exception translation: turning an [`Error`] into a [`Response`].
//!
//! Applications register handlers keyed by the concrete error type or by status
//! code. Lookup tries the type first, then the status; when neither matches the
//! error gets its default rendering:
//!
//! - declared [`HttpError`]: its own status, `{"detail": ...}`, and its headers;
//! - anything else: `500` with a generic body that never reveals the error.

use std::any::TypeId;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde_json::json;

use crate::error::{Error, HttpError};
use crate::http::{IntoResponse, Request, Response, StatusCode};

/// Detail carried by the error raised for a path no route matches.
pub const NO_ROUTE: &str = "No route found";

/// A registered exception handler.
pub type ExceptionHandler = Arc<dyn Fn(&Request, &Error) -> Response + Send + Sync>;

/// Exception handlers keyed by error type and by status code.
#[derive(Default, Clone)]
pub struct ExceptionHandlers {
    by_type: HashMap<TypeId, (&'static str, ExceptionHandler)>,
    by_status: HashMap<StatusCode, ExceptionHandler>,
}

impl ExceptionHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles every error whose status is `status`, declared or not.
    ///
    /// A status handler also applies to successful handler responses that carry
    /// an error status (`>= 400`).
    pub fn on_status<F, R>(&mut self, status: StatusCode, handler: F)
    where
        F: Fn(&Request, &Error) -> R + Send + Sync + 'static,
        R: IntoResponse,
    {
        self.by_status.insert(status, erase(handler));
    }

    /// Handles every error whose concrete type is `E`.
    ///
    /// Registering for [`HttpError`] catches all declared errors.
    pub fn on_type<E, F, R>(&mut self, handler: F)
    where
        E: StdError + 'static,
        F: Fn(&Request, &Error) -> R + Send + Sync + 'static,
        R: IntoResponse,
    {
        self.by_type.insert(
            TypeId::of::<E>(),
            (std::any::type_name::<E>(), erase(handler)),
        );
    }

    /// The handler for `error`: exact type match first, then status match.
    pub fn find(&self, error: &Error) -> Option<&ExceptionHandler> {
        self.by_type
            .get(&error.inner_type_id())
            .map(|(_, handler)| handler)
            .or_else(|| self.by_status.get(&error.status()))
    }

    pub fn for_status(&self, status: StatusCode) -> Option<&ExceptionHandler> {
        self.by_status.get(&status)
    }

    /// Renders `error` with its registered handler, or the default rendering.
    pub fn translate(&self, request: &Request, error: &Error) -> Response {
        match self.find(error) {
            Some(handler) => handler(request, error),
            None => default_response(error),
        }
    }

    pub fn len(&self) -> usize {
        self.by_type.len() + self.by_status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ExceptionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<_> = self.by_type.values().map(|(name, _)| *name).collect();
        let statuses: Vec<_> = self.by_status.keys().map(|s| s.as_u16()).collect();
        f.debug_struct("ExceptionHandlers")
            .field("types", &types)
            .field("statuses", &statuses)
            .finish()
    }
}

fn erase<F, R>(handler: F) -> ExceptionHandler
where
    F: Fn(&Request, &Error) -> R + Send + Sync + 'static,
    R: IntoResponse,
{
    Arc::new(move |request, error| handler(request, error).into_response())
}

/// Default rendering of an error no handler claimed.
pub fn default_response(error: &Error) -> Response {
    match error.as_http() {
        Some(declared) => declared_response(declared),
        None => internal_error(),
    }
}

/// `{"detail": ...}` with the declared status and headers.
pub fn declared_response(error: &HttpError) -> Response {
    let mut response = Response::with_json(error.status(), &json!({ "detail": error.detail() }));
    response.headers_mut().merge(error.headers());
    response
}

/// The unmatched-path `404`: `{"error": "Not Found", "detail": "No route found"}`.
pub fn not_found() -> Response {
    Response::with_json(
        StatusCode::NotFound,
        &json!({ "error": "Not Found", "detail": NO_ROUTE }),
    )
}

/// The bare `500` used when nothing more specific may be said.
pub fn internal_error() -> Response {
    Response::with_json(
        StatusCode::InternalServerError,
        &json!({ "detail": "Internal Server Error" }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;
    use serde_json::Value;

    #[derive(Debug, thiserror::Error)]
    #[error("quota exceeded for {0}")]
    struct QuotaError(String);

    fn request() -> Request {
        Request::new(Method::Get, "/")
    }

    #[test]
    fn not_found_body_names_the_status() {
        let response = not_found();
        assert_eq!(response.status(), StatusCode::NotFound);
        assert_eq!(
            response.json::<Value>().unwrap(),
            json!({"error": "Not Found", "detail": "No route found"})
        );
    }

    #[test]
    fn declared_error_renders_detail_and_headers() {
        let err: Error = HttpError::unauthorized("Not authenticated")
            .with_header("WWW-Authenticate", "Bearer")
            .into();
        let response = ExceptionHandlers::new().translate(&request(), &err);

        assert_eq!(response.status(), StatusCode::Unauthorized);
        assert_eq!(response.headers().get("www-authenticate"), Some("Bearer"));
        assert_eq!(
            response.json::<Value>().unwrap(),
            json!({"detail": "Not authenticated"})
        );
    }

    #[test]
    fn unexpected_error_never_leaks() {
        let err = Error::new(QuotaError("secret-tenant".into()));
        let response = ExceptionHandlers::new().translate(&request(), &err);

        assert_eq!(response.status(), StatusCode::InternalServerError);
        let body = response.text();
        assert!(!body.contains("secret-tenant"));
        assert!(!body.contains("QuotaError"));
    }

    #[test]
    fn type_match_beats_status_match() {
        let mut handlers = ExceptionHandlers::new();
        handlers.on_status(StatusCode::InternalServerError, |_, _| "by status");
        handlers.on_type::<QuotaError, _, _>(|_, err| {
            (format!("by type: {}", err.message()), StatusCode::TooManyRequests)
        });

        let response = handlers.translate(&request(), &Error::new(QuotaError("a".into())));
        assert_eq!(response.status(), StatusCode::TooManyRequests);
        assert_eq!(response.text(), "by type: quota exceeded for a");

        let response = handlers.translate(&request(), &Error::msg("other"));
        assert_eq!(response.text(), "by status");
    }

    #[test]
    fn status_handler_sees_declared_error() {
        let mut handlers = ExceptionHandlers::new();
        handlers.on_status(StatusCode::NotFound, |req: &Request, err: &Error| {
            Response::with_json(
                StatusCode::NotFound,
                &json!({"missing": req.path(), "why": err.message()}),
            )
        });

        let err: Error = HttpError::not_found("gone").into();
        let body: Value = handlers.translate(&request(), &err).json().unwrap();
        assert_eq!(body, json!({"missing": "/", "why": "gone"}));
        assert_eq!(handlers.len(), 1);
    }
}
