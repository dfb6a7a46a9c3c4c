//! Error taxonomy for handlers, dependencies, and middleware.
//!
//! Two kinds of failure flow through the dispatch pipeline:
//!
//! - **Declared**: an [`HttpError`] carrying an explicit status, a client-facing
//!   `detail` message, and optional headers. Always rendered as
//!   `{"detail": ...}` with its own status.
//! - **Unexpected**: any other error. Always rendered as `500`; the body only
//!   carries diagnostics when the application runs in debug mode.
//!
//! Both travel inside [`Error`], which any `std::error::Error` converts into with
//! `?`. An `HttpError` passed through `?` stays declared.

use std::any::TypeId;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::http::{Headers, Method, StatusCode};

/// A declared HTTP error: explicit status, message, and extra headers.
///
/// # Examples
///
/// ```
/// use blaze::{HttpError, StatusCode};
///
/// let err = HttpError::new(StatusCode::TooManyRequests, "Too Many Requests")
///     .with_header("Retry-After", "60");
/// assert_eq!(err.status(), StatusCode::TooManyRequests);
/// assert_eq!(err.headers().get("retry-after"), Some("60"));
/// ```
#[derive(Debug, Clone, Error)]
#[error("{status}: {detail}")]
pub struct HttpError {
    status: StatusCode,
    detail: String,
    headers: Headers,
}

impl HttpError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
            headers: Headers::new(),
        }
    }

    /// A declared error whose detail is the status's canonical reason phrase.
    pub fn from_status(status: StatusCode) -> Self {
        Self::new(status, status.canonical_reason())
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BadRequest, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::Unauthorized, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::Forbidden, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, detail)
    }

    pub fn unprocessable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UnprocessableEntity, detail)
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// The error type handlers, dependencies, and middleware hooks return.
///
/// Converting from any `std::error::Error` keeps a declared [`HttpError`]
/// declared and records everything else as unexpected, together with the
/// concrete type name and a backtrace for debug-mode rendering. The backtrace
/// is only captured when `RUST_BACKTRACE` or `RUST_LIB_BACKTRACE` enables it.
///
/// `Error` deliberately does not implement `std::error::Error` itself, which is
/// what allows the blanket `From` conversion.
pub struct Error {
    repr: Repr,
}

enum Repr {
    Declared(HttpError),
    Unexpected {
        source: Box<dyn StdError + Send + Sync + 'static>,
        type_id: TypeId,
        type_name: &'static str,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Wraps an arbitrary error as unexpected (or declared, if it is an `HttpError`).
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let boxed: Box<dyn StdError + Send + Sync + 'static> = Box::new(error);
        match boxed.downcast::<HttpError>() {
            Ok(declared) => Self {
                repr: Repr::Declared(*declared),
            },
            Err(source) => Self {
                repr: Repr::Unexpected {
                    source,
                    type_id: TypeId::of::<E>(),
                    type_name: std::any::type_name::<E>(),
                    backtrace: Backtrace::capture(),
                },
            },
        }
    }

    /// An unexpected error carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Returns the declared error, if this is one.
    pub fn as_http(&self) -> Option<&HttpError> {
        match &self.repr {
            Repr::Declared(declared) => Some(declared),
            Repr::Unexpected { .. } => None,
        }
    }

    pub fn is_declared(&self) -> bool {
        matches!(self.repr, Repr::Declared(_))
    }

    /// The status this error maps to: the declared status, or `500`.
    pub fn status(&self) -> StatusCode {
        match &self.repr {
            Repr::Declared(declared) => declared.status(),
            Repr::Unexpected { .. } => StatusCode::InternalServerError,
        }
    }

    /// `true` when the wrapped error's concrete type is `E`.
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.inner_type_id() == TypeId::of::<E>()
    }

    /// Borrows the wrapped error as `E`.
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match &self.repr {
            Repr::Declared(declared) => (declared as &(dyn StdError + 'static)).downcast_ref::<E>(),
            Repr::Unexpected { source, .. } => source.downcast_ref::<E>(),
        }
    }

    pub(crate) fn inner_type_id(&self) -> TypeId {
        match &self.repr {
            Repr::Declared(_) => TypeId::of::<HttpError>(),
            Repr::Unexpected { type_id, .. } => *type_id,
        }
    }

    /// The Rust type name of the wrapped error.
    pub fn type_name(&self) -> &'static str {
        match &self.repr {
            Repr::Declared(_) => std::any::type_name::<HttpError>(),
            Repr::Unexpected { type_name, .. } => type_name,
        }
    }

    /// The error message, plus every `source()` in the chain.
    pub fn message(&self) -> String {
        match &self.repr {
            Repr::Declared(declared) => declared.detail().to_owned(),
            Repr::Unexpected { source, .. } => {
                let mut message = source.to_string();
                let mut cause = source.source();
                while let Some(inner) = cause {
                    message.push_str(": ");
                    message.push_str(&inner.to_string());
                    cause = inner.source();
                }
                message
            }
        }
    }

    /// The captured backtrace, one frame description per line; empty when
    /// capture is disabled.
    pub fn trace(&self) -> Vec<String> {
        match &self.repr {
            Repr::Unexpected { backtrace, .. } if backtrace.status() == BacktraceStatus::Captured => backtrace
                .to_string()
                .lines()
                .map(|line| line.trim_end().to_owned())
                .filter(|line| !line.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl<E> From<E> for Error
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Declared(declared) => f.debug_tuple("Declared").field(declared).finish(),
            Repr::Unexpected {
                source, type_name, ..
            } => f
                .debug_struct("Unexpected")
                .field("type_name", type_name)
                .field("source", source)
                .finish(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Declared(declared) => fmt::Display::fmt(declared, f),
            Repr::Unexpected { source, .. } => fmt::Display::fmt(source, f),
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

/// Route registration failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("route {method} {path} is already registered")]
    Duplicate { method: Method, path: String },

    #[error("invalid route {method} {path}: {reason}")]
    InvalidPath {
        method: Method,
        path: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct DiskError;

    fn fails_with_io() -> Result<(), Error> {
        Err(std::io::Error::other("socket closed"))?;
        Ok(())
    }

    #[test]
    fn http_error_stays_declared_through_question_mark() {
        let err: Error = HttpError::not_found("nope").into();
        assert!(err.is_declared());
        assert_eq!(err.status(), StatusCode::NotFound);
        assert_eq!(err.as_http().map(HttpError::detail), Some("nope"));
        assert!(err.is::<HttpError>());
    }

    #[test]
    fn foreign_error_becomes_unexpected() {
        let err = fails_with_io().unwrap_err();
        assert!(!err.is_declared());
        assert_eq!(err.status(), StatusCode::InternalServerError);
        assert!(err.is::<std::io::Error>());
        assert!(err.type_name().contains("io::error::Error"));
        assert_eq!(err.message(), "socket closed");
    }

    #[test]
    fn downcast_reaches_the_concrete_type() {
        let err = Error::new(DiskError);
        assert!(err.downcast_ref::<DiskError>().is_some());
        assert!(err.downcast_ref::<std::io::Error>().is_none());
        let captured = Backtrace::capture().status() == BacktraceStatus::Captured;
        assert_eq!(err.trace().is_empty(), !captured);
    }

    #[test]
    fn msg_is_unexpected() {
        let err = Error::msg("boom");
        assert!(!err.is_declared());
        assert_eq!(err.to_string(), "boom");
    }
}
