//! Per-request context handed to handlers.
//!
//! A [`Context`] bundles everything the dispatch pipeline prepared for one handler
//! call: the request itself, the arguments bound from the path, query string and
//! body, the resolved dependencies, the background task queue, and the shared
//! application state.
//!
//! Two type maps live here as well: [`Extensions`] (per-request, owned by
//! [`Request`]) and [`State`] (per-application, shared by every request).

use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{
    background::BackgroundTasks,
    dependency::Resolved,
    error::{Error, HttpError},
    http::Request,
};

/// Type-erased request extensions map, used to inject per-request state
/// into handlers without requiring handlers to know about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create a new empty extensions map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
            .map(|previous| *previous)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T>(&mut self) -> Option<&mut T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.map.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.map.len())
            .finish()
    }
}

/// Typed application state shared by every request.
///
/// Values are reference counted so a snapshot can be cloned cheaply when new
/// state is registered on a running application.
#[derive(Default, Clone)]
pub struct State {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State").field("len", &self.map.len()).finish()
    }
}

/// Misuse of the argument accessors on [`Context`].
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("handler argument `{0}` was not declared on its endpoint")]
    UnknownArgument(String),

    #[error("handler argument `{name}` cannot be read as `{expected}`: {source}")]
    ArgumentType {
        name: String,
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("no application state of type `{0}` was registered")]
    MissingState(&'static str),
}

/// Arguments bound from the path, query string, and body for one handler call.
#[derive(Debug, Default, Clone)]
pub struct Arguments {
    values: HashMap<String, serde_json::Value>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.values.get(name)
    }

    /// Deserializes the bound value for `name` into `T`.
    pub fn parse<T: DeserializeOwned>(&self, name: &str) -> Result<T, ContextError> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| ContextError::UnknownArgument(name.to_owned()))?;
        T::deserialize(value).map_err(|source| ContextError::ArgumentType {
            name: name.to_owned(),
            expected: type_name::<T>(),
            source,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Everything a handler receives for one request.
///
/// # Examples
///
/// ```rust,no_run
/// use blaze::{Context, Error, Json};
///
/// async fn show_user(ctx: Context) -> Result<Json<serde_json::Value>, Error> {
///     let id: i64 = ctx.arg("id")?;
///     let caller = ctx.dep::<String>("caller")?;
///     Ok(Json(serde_json::json!({ "id": id, "caller": caller })))
/// }
/// ```
pub struct Context {
    request: Arc<Request>,
    arguments: Arguments,
    dependencies: Resolved,
    background: BackgroundTasks,
    state: Arc<State>,
}

impl Context {
    pub(crate) fn new(
        request: Arc<Request>,
        arguments: Arguments,
        dependencies: Resolved,
        background: BackgroundTasks,
        state: Arc<State>,
    ) -> Self {
        Self {
            request,
            arguments,
            dependencies,
            background,
            state,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Reads a bound path, query, or body argument as `T`.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Result<T, Error> {
        Ok(self.arguments.parse(name)?)
    }

    pub fn args(&self) -> &Arguments {
        &self.arguments
    }

    /// Borrows a resolved dependency declared on the endpoint as `name`.
    pub fn dep<T: Send + Sync + 'static>(&self, name: &str) -> Result<&T, Error> {
        self.dependencies.get(name)
    }

    /// Shares a resolved dependency, for moving it into a background task.
    pub fn dep_arc<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.dependencies.get_arc(name)
    }

    pub fn dependencies(&self) -> &Resolved {
        &self.dependencies
    }

    /// The queue of work to run once the response has been produced.
    pub fn background(&self) -> &BackgroundTasks {
        &self.background
    }

    /// Application state registered with [`App::state`](crate::App::state).
    pub fn state<T: Send + Sync + 'static>(&self) -> Result<&T, Error> {
        self.state
            .get::<T>()
            .ok_or_else(|| ContextError::MissingState(type_name::<T>()).into())
    }

    /// Deserializes the request body as JSON, rejecting malformed input with `422`.
    pub fn json<T>(&self) -> Result<T, HttpError>
    where
        T: DeserializeOwned,
    {
        self.request
            .json()
            .map_err(|e| HttpError::unprocessable(format!("invalid JSON body: {e}")))
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", self.request.method())
            .field("path", &self.request.path())
            .field("arguments", &self.arguments)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}
