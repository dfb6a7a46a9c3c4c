//! Credential extraction dependencies.
//!
//! Each function builds a [`Dependency`] that reads credentials from the
//! request headers and rejects the request with a declared error when they are
//! missing or malformed. Build them once and share them between endpoints so
//! that overrides and per-request caching apply.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::dependency::Dependency;
use crate::error::HttpError;
use crate::http::Request;

/// Username and password from an `Authorization: Basic` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

fn authorization<'r>(request: &'r Request, scheme: &str) -> Option<&'r str> {
    let (found, credentials) = request.headers().get("authorization")?.split_once(' ')?;
    found
        .eq_ignore_ascii_case(scheme)
        .then(|| credentials.trim())
}

fn not_authenticated(scheme: &str) -> HttpError {
    HttpError::unauthorized("Not authenticated").with_header("WWW-Authenticate", scheme)
}

/// The token of an `Authorization: Bearer <token>` header, as a `String`.
///
/// Missing or non-bearer credentials are rejected with `401` and
/// `WWW-Authenticate: Bearer`.
pub fn bearer_token() -> Dependency {
    Dependency::sync("bearer_token", |ctx| {
        authorization(ctx.request(), "Bearer")
            .filter(|token| !token.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| not_authenticated("Bearer"))
    })
}

/// The value of the `name` header, as a `String`; `403` when absent.
pub fn api_key_header(name: impl Into<String>) -> Dependency {
    let name = name.into();
    Dependency::sync(format!("api_key:{name}"), move |ctx| {
        ctx.request()
            .headers()
            .get(&name)
            .filter(|key| !key.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| HttpError::forbidden("API key required"))
    })
}

/// The value of the `name` header as an `Option<String>`; never rejects.
pub fn optional_api_key_header(name: impl Into<String>) -> Dependency {
    let name = name.into();
    Dependency::sync(format!("optional_api_key:{name}"), move |ctx| {
        Ok::<_, HttpError>(ctx.request().headers().get(&name).map(str::to_owned))
    })
}

/// Decoded [`BasicCredentials`] from `Authorization: Basic <base64>`.
///
/// Missing credentials are rejected with `401` and `WWW-Authenticate: Basic`;
/// undecodable ones with `401 Invalid authentication credentials`.
pub fn http_basic() -> Dependency {
    Dependency::sync("http_basic", |ctx| {
        let encoded =
            authorization(ctx.request(), "Basic").ok_or_else(|| not_authenticated("Basic"))?;
        decode_basic(encoded)
    })
}

fn decode_basic(encoded: &str) -> Result<BasicCredentials, HttpError> {
    let invalid = || HttpError::unauthorized("Invalid authentication credentials");
    let bytes = STANDARD.decode(encoded).map_err(|_| invalid())?;
    let decoded = String::from_utf8(bytes).map_err(|_| invalid())?;
    let (username, password) = decoded.split_once(':').unwrap_or((decoded.as_str(), ""));
    Ok(BasicCredentials {
        username: username.to_owned(),
        password: password.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{
        Depends, DependencyOverrides, ResolutionCache, Resolved, Resolver, TeardownScope,
    };
    use crate::error::Error;
    use crate::http::{Method, StatusCode};
    use std::sync::Arc;

    async fn resolve(dep: &Dependency, request: Request) -> Result<Resolved, Error> {
        let request = Arc::new(request);
        let overrides = DependencyOverrides::new();
        let mut cache = ResolutionCache::new();
        let mut scope = TeardownScope::new();
        Resolver::new(&request, &overrides, &mut cache, &mut scope)
            .resolve(&[("v".to_owned(), Depends::new(dep))])
            .await
    }

    #[tokio::test]
    async fn bearer_token_extracts_or_challenges() {
        let dep = bearer_token();
        let ok = resolve(&dep, Request::new(Method::Get, "/").header("Authorization", "Bearer abc"))
            .await
            .unwrap();
        assert_eq!(ok.get::<String>("v").unwrap(), "abc");

        let err = resolve(&dep, Request::new(Method::Get, "/")).await.unwrap_err();
        let declared = err.as_http().unwrap();
        assert_eq!(declared.status(), StatusCode::Unauthorized);
        assert_eq!(declared.headers().get("www-authenticate"), Some("Bearer"));
    }

    #[tokio::test]
    async fn api_key_is_case_insensitive_and_required() {
        let dep = api_key_header("X-API-Key");
        let ok = resolve(&dep, Request::new(Method::Get, "/").header("x-api-key", "k1"))
            .await
            .unwrap();
        assert_eq!(ok.get::<String>("v").unwrap(), "k1");

        let err = resolve(&dep, Request::new(Method::Get, "/")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::Forbidden);
        assert_eq!(err.message(), "API key required");

        let optional = resolve(&optional_api_key_header("X-API-Key"), Request::new(Method::Get, "/"))
            .await
            .unwrap();
        assert_eq!(optional.get::<Option<String>>("v").unwrap(), &None);
    }

    #[tokio::test]
    async fn http_basic_decodes_credentials() {
        let header = format!("Basic {}", STANDARD.encode("alice:s3cret:x"));
        let ok = resolve(&http_basic(), Request::new(Method::Get, "/").header("Authorization", header))
            .await
            .unwrap();
        assert_eq!(
            ok.get::<BasicCredentials>("v").unwrap(),
            &BasicCredentials {
                username: "alice".into(),
                password: "s3cret:x".into()
            }
        );

        let err = resolve(
            &http_basic(),
            Request::new(Method::Get, "/").header("Authorization", "Basic !!!"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.message(), "Invalid authentication credentials");

        let err = resolve(&http_basic(), Request::new(Method::Get, "/")).await.unwrap_err();
        assert_eq!(
            err.as_http().unwrap().headers().get("www-authenticate"),
            Some("Basic")
        );
    }
}
