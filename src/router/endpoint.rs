//! Handlers and their parameter descriptors.
//!
//! A handler is any `Fn(Context) -> impl Future<Output = Result<R, E>>` (or a
//! synchronous closure wrapped with [`sync_handler`]) where `R` converts into a
//! response and `E` into an [`Error`]. An [`Endpoint`] pairs a handler with the
//! declared list of its inputs (path, query and body arguments plus
//! dependencies), recorded once when the route is built.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::{
    BoxFuture,
    context::{Arguments, Context},
    dependency::Depends,
    error::{Error, HttpError},
    http::{IntoResponse, Request, Response},
};

/// Type-erased, heap-allocated async handler.
pub type Handler =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<Response, Error>> + Send + Sync + 'static>;

/// Conversion trait for handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Result<R, E>> + Send` that is also
/// `Send + Sync + 'static` implements this trait through the blanket impl below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> BoxFuture<'static, Result<Response, Error>>;
}

impl<T, F, R, E> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Result<R, E>> + Send + 'static,
    R: IntoResponse,
    E: Into<Error>,
{
    fn call(&self, ctx: Context) -> BoxFuture<'static, Result<Response, Error>> {
        let fut = (self)(ctx);
        Box::pin(async move { fut.await.map(IntoResponse::into_response).map_err(Into::into) })
    }
}

/// A synchronous handler, see [`sync_handler`].
pub struct SyncHandler<F>(F);

/// Adapts a synchronous `Fn(Context) -> Result<R, E>` into a handler.
///
/// The closure runs inline on the request's task, so it should not block.
///
/// # Examples
///
/// ```rust
/// use blaze::{Context, Error, router::sync_handler};
///
/// let health = sync_handler(|_ctx: Context| Ok::<_, Error>("ok"));
/// ```
pub fn sync_handler<F, R, E>(handler: F) -> SyncHandler<F>
where
    F: Fn(Context) -> Result<R, E> + Send + Sync + 'static,
    R: IntoResponse,
    E: Into<Error>,
{
    SyncHandler(handler)
}

impl<F, R, E> IntoHandler for SyncHandler<F>
where
    F: Fn(Context) -> Result<R, E> + Send + Sync + 'static,
    R: IntoResponse,
    E: Into<Error>,
{
    fn call(&self, ctx: Context) -> BoxFuture<'static, Result<Response, Error>> {
        let outcome = (self.0)(ctx)
            .map(IntoResponse::into_response)
            .map_err(Into::into);
        Box::pin(std::future::ready(outcome))
    }
}

/// How a raw path or query value is coerced before it reaches the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Str,
    Int,
    Float,
    Bool,
    /// The raw value parsed as a JSON document.
    Json,
}

impl Kind {
    fn coerce(self, raw: &str) -> Result<Value, String> {
        match self {
            Kind::Str => Ok(Value::String(raw.to_owned())),
            Kind::Int => raw
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("expected an integer, got {raw:?}")),
            Kind::Float => raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("expected a number, got {raw:?}")),
            Kind::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
                _ => Err(format!("expected a boolean, got {raw:?}")),
            },
            Kind::Json => serde_json::from_str(raw).map_err(|e| format!("invalid JSON: {e}")),
        }
    }
}

/// Where one handler input comes from.
#[derive(Debug, Clone)]
pub enum Source {
    Path(Kind),
    Query { kind: Kind, default: Option<Value> },
    /// The whole request body, parsed as JSON.
    Body,
}

/// A handler input filled from the request.
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    source: Source,
}

impl Param {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    fn bind(&self, request: &Request) -> Result<Value, String> {
        match &self.source {
            Source::Path(kind) => match request.path_param(&self.name) {
                Some(raw) => kind.coerce(raw),
                None => Err("missing path parameter".to_owned()),
            },
            Source::Query { kind, default } => match (request.query_param(&self.name), default) {
                (Some(raw), _) => kind.coerce(raw),
                (None, Some(default)) => Ok(default.clone()),
                (None, None) => Err("missing query parameter".to_owned()),
            },
            Source::Body => {
                if request.body().is_empty() {
                    return Err("missing request body".to_owned());
                }
                request.json::<Value>().map_err(|e| format!("invalid JSON body: {e}"))
            }
        }
    }
}

/// A handler plus the declared description of its inputs.
///
/// # Examples
///
/// ```rust
/// use blaze::{Context, Error, Json};
/// use blaze::router::{Endpoint, Kind};
///
/// async fn list_items(ctx: Context) -> Result<Json<serde_json::Value>, Error> {
///     let page: i64 = ctx.arg("page")?;
///     Ok(Json(serde_json::json!({ "page": page })))
/// }
///
/// let endpoint = Endpoint::new(list_items)
///     .query_or("page", Kind::Int, 1)
///     .name("list_items");
/// assert_eq!(endpoint.params().len(), 1);
/// ```
#[derive(Clone)]
pub struct Endpoint {
    handler: Handler,
    name: String,
    params: Vec<Param>,
    dependencies: Vec<(String, Depends)>,
}

impl Endpoint {
    pub fn new<H: IntoHandler>(handler: H) -> Self {
        let name = std::any::type_name::<H>()
            .rsplit("::")
            .next()
            .unwrap_or("handler")
            .to_owned();
        let handler = Arc::new(handler);
        Self {
            handler: Arc::new(move |ctx| handler.call(ctx)),
            name,
            params: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    /// A path capture, e.g. `id` in `/users/{id}`.
    #[must_use]
    pub fn path(self, name: impl Into<String>, kind: Kind) -> Self {
        self.param(name, Source::Path(kind))
    }

    /// A required query parameter.
    #[must_use]
    pub fn query(self, name: impl Into<String>, kind: Kind) -> Self {
        self.param(name, Source::Query { kind, default: None })
    }

    /// A query parameter that falls back to `default` when absent.
    #[must_use]
    pub fn query_or(self, name: impl Into<String>, kind: Kind, default: impl Into<Value>) -> Self {
        self.param(
            name,
            Source::Query {
                kind,
                default: Some(default.into()),
            },
        )
    }

    /// The request body as JSON.
    #[must_use]
    pub fn body(self, name: impl Into<String>) -> Self {
        self.param(name, Source::Body)
    }

    /// A dependency, readable in the handler with [`Context::dep`].
    #[must_use]
    pub fn depends(mut self, name: impl Into<String>, depends: Depends) -> Self {
        self.dependencies.push((name.into(), depends));
        self
    }

    /// Overrides the name reported in route metadata.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn param(mut self, name: impl Into<String>, source: Source) -> Self {
        self.params.push(Param {
            name: name.into(),
            source,
        });
        self
    }

    pub fn handler_name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn dependencies(&self) -> &[(String, Depends)] {
        &self.dependencies
    }

    /// Binds every declared path, query, and body input.
    ///
    /// # Errors
    ///
    /// `422` listing every input that was missing or failed coercion.
    pub fn bind(&self, request: &Request) -> Result<Arguments, HttpError> {
        let mut arguments = Arguments::new();
        let mut failures = Vec::new();

        for param in &self.params {
            match param.bind(request) {
                Ok(value) => arguments.insert(param.name.clone(), value),
                Err(reason) => failures.push(format!("{}: {reason}", param.name)),
            }
        }

        if failures.is_empty() {
            Ok(arguments)
        } else {
            Err(HttpError::unprocessable(format!(
                "validation failed: {}",
                failures.join("; ")
            )))
        }
    }

    pub(crate) fn handler(&self) -> Handler {
        Arc::clone(&self.handler)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dependencies: Vec<_> = self.dependencies.iter().map(|(name, _)| name).collect();
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("dependencies", &dependencies)
            .finish()
    }
}

/// Anything that can be registered as a route: a bare handler or an [`Endpoint`].
pub trait IntoEndpoint {
    fn into_endpoint(self) -> Endpoint;
}

impl IntoEndpoint for Endpoint {
    fn into_endpoint(self) -> Endpoint {
        self
    }
}

impl<H: IntoHandler> IntoEndpoint for H {
    fn into_endpoint(self) -> Endpoint {
        Endpoint::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::BackgroundTasks;
    use crate::context::State;
    use crate::dependency::Resolved;
    use crate::http::{Method, StatusCode};
    use serde_json::json;

    fn ctx(arguments: Arguments) -> Context {
        Context::new(
            Arc::new(Request::new(Method::Get, "/")),
            arguments,
            Resolved::default(),
            BackgroundTasks::new(),
            Arc::new(State::new()),
        )
    }

    async fn echo_id(ctx: Context) -> Result<Value, Error> {
        Ok(json!({ "id": ctx.arg::<i64>("id")? }))
    }

    #[test]
    fn binds_path_query_and_body() {
        let endpoint = Endpoint::new(echo_id)
            .path("id", Kind::Int)
            .query("verbose", Kind::Bool)
            .query_or("limit", Kind::Int, 10)
            .query("ratio", Kind::Float)
            .body("payload");
        assert_eq!(endpoint.handler_name(), "echo_id");

        let request = Request::new(Method::Post, "/users/42?verbose=yes&ratio=0.5")
            .with_path_params([("id", "42")])
            .json_body(&json!({"name": "ada"}));

        let args = endpoint.bind(&request).unwrap();
        assert_eq!(args.get("id"), Some(&json!(42)));
        assert_eq!(args.get("verbose"), Some(&json!(true)));
        assert_eq!(args.get("limit"), Some(&json!(10)));
        assert_eq!(args.get("ratio"), Some(&json!(0.5)));
        assert_eq!(args.get("payload"), Some(&json!({"name": "ada"})));
    }

    #[test]
    fn binding_failures_are_422() {
        let endpoint = Endpoint::new(echo_id)
            .path("id", Kind::Int)
            .query("q", Kind::Str);
        let request = Request::new(Method::Get, "/users/abc").with_path_params([("id", "abc")]);

        let err = endpoint.bind(&request).unwrap_err();
        assert_eq!(err.status(), StatusCode::UnprocessableEntity);
        assert!(err.detail().starts_with("validation failed"));
        assert!(err.detail().contains("id: expected an integer"));
        assert!(err.detail().contains("q: missing query parameter"));
    }

    #[tokio::test]
    async fn async_and_sync_handlers_share_a_contract() {
        let mut args = Arguments::new();
        args.insert("id", json!(7));

        let response = Endpoint::new(echo_id).handler()(ctx(args.clone())).await.unwrap();
        assert_eq!(response.json::<Value>().unwrap(), json!({"id": 7}));

        let sync = Endpoint::new(sync_handler(|ctx: Context| {
            let id: i64 = ctx.arg("id")?;
            Ok::<_, Error>((format!("{id}"), StatusCode::Created))
        }));
        let response = sync.handler()(ctx(args)).await.unwrap();
        assert_eq!(response.status(), StatusCode::Created);
        assert_eq!(response.text(), "7");
    }

    #[tokio::test]
    async fn handler_errors_convert() {
        let failing = sync_handler(|_ctx: Context| Err::<(), _>(HttpError::not_found("nope")));
        let err = failing.into_endpoint().handler()(ctx(Arguments::new())).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NotFound);
    }
}
