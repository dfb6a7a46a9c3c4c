//! Dependency injection: declared, cacheable, overridable handler inputs.
//!
//! A [`Dependency`] wraps a provider function together with the dependencies
//! that provider itself needs. Handlers (through their
//! [`Endpoint`](crate::router::Endpoint) descriptor) and other dependencies
//! reference it with a [`Depends`] marker. For every request the
//! [`Resolver`] walks that graph:
//!
//! 1. a value registered in [`DependencyOverrides`] for the dependency wins;
//! 2. otherwise a cacheable dependency already resolved for this request is
//!    reused from the [`ResolutionCache`];
//! 3. otherwise the dependency's own parameters are resolved first, then its
//!    provider runs with them and the ambient request.
//!
//! Scoped providers ([`Dependency::scoped`]) hand the handler a value and
//! register a teardown on the request's [`TeardownScope`]; the dispatch pipeline
//! closes that scope once the handler has finished, whatever its outcome.
//!
//! ```rust,no_run
//! use blaze::dependency::{Dependency, Depends, Scoped};
//!
//! struct Db;
//!
//! let db = Dependency::scoped("db", |_ctx| async {
//!     let db = std::sync::Arc::new(Db);
//!     Ok::<_, std::io::Error>(Scoped::new(db, || async { /* close pool */ }))
//! });
//!
//! let current_user = Dependency::new("current_user", |ctx| async move {
//!     let _db = ctx.get::<std::sync::Arc<Db>>("db")?;
//!     Ok::<_, blaze::Error>("alice".to_owned())
//! })
//! .param("db", Depends::new(&db));
//! ```

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::BoxFuture;
use crate::error::Error;
use crate::http::Request;

/// A resolved dependency value, shared between every parameter that asked for it.
pub type Value = Arc<dyn Any + Send + Sync>;

type Provider =
    Arc<dyn Fn(DependencyContext) -> BoxFuture<'static, Result<Provided, Error>> + Send + Sync>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a dependency provider; the key for caching and overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DependencyId(u64);

impl DependencyId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Misconfigurations surfaced while resolving or reading dependencies.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("dependency `{name}` was not resolved for this call")]
    Missing { name: String },

    #[error("dependency `{name}` does not hold a value of type `{expected}`")]
    TypeMismatch {
        name: String,
        expected: &'static str,
    },

    #[error("dependency `{name}` depends on itself")]
    Cycle { name: String },
}

/// Cleanup half of a scoped dependency.
pub struct Teardown(Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>);

impl Teardown {
    pub fn new<F, Fut>(teardown: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Box::new(move || Box::pin(teardown())))
    }

    fn run(self) -> BoxFuture<'static, ()> {
        (self.0)()
    }
}

/// A value produced by a scoped provider plus the teardown that releases it.
pub struct Scoped<T> {
    value: T,
    teardown: Teardown,
}

impl<T> Scoped<T> {
    pub fn new<F, Fut>(value: T, teardown: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            value,
            teardown: Teardown::new(teardown),
        }
    }
}

pub(crate) enum Provided {
    Value(Value),
    Scoped(Value, Teardown),
}

/// What a provider receives: the ambient request and its own resolved parameters.
pub struct DependencyContext {
    request: Arc<Request>,
    resolved: Resolved,
}

impl DependencyContext {
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Borrows the value of one of this provider's declared parameters.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<&T, Error> {
        self.resolved.get(name)
    }

    pub fn resolved(&self) -> &Resolved {
        &self.resolved
    }
}

/// A dependency provider and the dependencies it declares for itself.
///
/// Cloning keeps the identity, so clones share cache entries and overrides.
#[derive(Clone)]
pub struct Dependency {
    id: DependencyId,
    name: String,
    params: Vec<(String, Depends)>,
    provider: Provider,
}

impl Dependency {
    /// A provider that may suspend.
    pub fn new<F, Fut, T, E>(name: impl Into<String>, provider: F) -> Self
    where
        F: Fn(DependencyContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + Sync + 'static,
        E: Into<Error>,
    {
        Self::from_provider(
            name.into(),
            Arc::new(move |ctx| {
                let fut = provider(ctx);
                Box::pin(async move {
                    let value = fut.await.map_err(Into::into)?;
                    Ok(Provided::Value(Arc::new(value)))
                })
            }),
        )
    }

    /// A provider that runs to completion inline.
    pub fn sync<F, T, E>(name: impl Into<String>, provider: F) -> Self
    where
        F: Fn(DependencyContext) -> Result<T, E> + Send + Sync + 'static,
        T: Send + Sync + 'static,
        E: Into<Error>,
    {
        Self::from_provider(
            name.into(),
            Arc::new(move |ctx| {
                let provided = provider(ctx)
                    .map(|value| Provided::Value(Arc::new(value)))
                    .map_err(Into::into);
                Box::pin(std::future::ready(provided))
            }),
        )
    }

    /// A provider whose value must be released once the handler is done.
    pub fn scoped<F, Fut, T, E>(name: impl Into<String>, provider: F) -> Self
    where
        F: Fn(DependencyContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Scoped<T>, E>> + Send + 'static,
        T: Send + Sync + 'static,
        E: Into<Error>,
    {
        Self::from_provider(
            name.into(),
            Arc::new(move |ctx| {
                let fut = provider(ctx);
                Box::pin(async move {
                    let scoped = fut.await.map_err(Into::into)?;
                    Ok(Provided::Scoped(Arc::new(scoped.value), scoped.teardown))
                })
            }),
        )
    }

    /// A provider that always yields a clone of `value`.
    pub fn constant<T>(name: impl Into<String>, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        Self::sync(name, move |_| Ok::<_, Error>(value.clone()))
    }

    fn from_provider(name: String, provider: Provider) -> Self {
        Self {
            id: DependencyId::next(),
            name,
            params: Vec::new(),
            provider,
        }
    }

    /// Declares one of this provider's own dependencies.
    ///
    /// The returned dependency gets a fresh identity: it is a different provider
    /// from any clone taken before the call.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, depends: Depends) -> Self {
        self.params.push((name.into(), depends));
        self.id = DependencyId::next();
        self
    }

    pub fn id(&self) -> DependencyId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[(String, Depends)] {
        &self.params
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Marker attached to a parameter: "fill me from this dependency".
#[derive(Clone, Debug)]
pub struct Depends {
    dependency: Dependency,
    use_cache: bool,
}

impl Depends {
    /// A cached reference: resolved at most once per request.
    pub fn new(dependency: &Dependency) -> Self {
        Self {
            dependency: dependency.clone(),
            use_cache: true,
        }
    }

    /// A reference that invokes the provider every time it is resolved.
    pub fn uncached(dependency: &Dependency) -> Self {
        Self {
            dependency: dependency.clone(),
            use_cache: false,
        }
    }

    pub fn dependency(&self) -> &Dependency {
        &self.dependency
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache
    }
}

impl From<&Dependency> for Depends {
    fn from(dependency: &Dependency) -> Self {
        Depends::new(dependency)
    }
}

/// Parameter name → resolved value for one handler or provider call.
#[derive(Default, Clone)]
pub struct Resolved {
    values: HashMap<String, Value>,
}

impl Resolved {
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Borrows the value bound to `name` as `T`.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<&T, Error> {
        let value = self.values.get(name).ok_or_else(|| DependencyError::Missing {
            name: name.to_owned(),
        })?;
        value.downcast_ref::<T>().ok_or_else(|| {
            DependencyError::TypeMismatch {
                name: name.to_owned(),
                expected: type_name::<T>(),
            }
            .into()
        })
    }

    /// Shares the value bound to `name` as `Arc<T>`.
    pub fn get_arc<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.values.get(name).cloned()?.downcast::<T>().ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// Values resolved so far for one request, keyed by provider identity.
///
/// Created fresh for every request and dropped with it; never shared.
#[derive(Default)]
pub struct ResolutionCache {
    values: HashMap<DependencyId, Value>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: DependencyId) -> Option<&Value> {
        self.values.get(&id)
    }

    pub fn insert(&mut self, id: DependencyId, value: Value) {
        self.values.insert(id, value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Substitute values for dependencies, typically installed by tests.
#[derive(Default, Clone)]
pub struct DependencyOverrides {
    values: HashMap<DependencyId, Value>,
}

impl DependencyOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every reference to `dependency` resolve to `value` instead.
    pub fn insert<T: Send + Sync + 'static>(&mut self, dependency: &Dependency, value: T) {
        self.values.insert(dependency.id(), Arc::new(value));
    }

    pub(crate) fn insert_value(&mut self, id: DependencyId, value: Value) {
        self.values.insert(id, value);
    }

    pub fn remove(&mut self, dependency: &Dependency) -> bool {
        self.values.remove(&dependency.id()).is_some()
    }

    pub fn get(&self, id: DependencyId) -> Option<&Value> {
        self.values.get(&id)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Teardowns registered by scoped dependencies during one request.
#[derive(Default)]
pub struct TeardownScope {
    teardowns: Vec<(String, Teardown)>,
}

impl TeardownScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, teardown: Teardown) {
        self.teardowns.push((name.into(), teardown));
    }

    pub fn len(&self) -> usize {
        self.teardowns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teardowns.is_empty()
    }

    /// Runs every teardown, last registered first, and waits for all of them.
    ///
    /// Each teardown runs in its own task so a panic is contained and logged.
    /// Teardowns still pending when the scope is dropped (including a `close`
    /// future dropped midway) are handed to a background task instead.
    pub async fn close(mut self) {
        while let Some((name, teardown)) = self.teardowns.pop() {
            run_teardown(name, teardown).await;
        }
    }
}

impl Drop for TeardownScope {
    fn drop(&mut self) {
        if self.teardowns.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.teardowns);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(pending = pending.len(), "teardown scope dropped before close");
                runtime.spawn(async move {
                    for (name, teardown) in pending.into_iter().rev() {
                        run_teardown(name, teardown).await;
                    }
                });
            }
            Err(_) => error!(
                pending = pending.len(),
                "teardown scope dropped outside a runtime, teardowns skipped"
            ),
        }
    }
}

async fn run_teardown(name: String, teardown: Teardown) {
    debug!(dependency = %name, "running dependency teardown");
    if let Err(e) = tokio::spawn(teardown.run()).await {
        error!(dependency = %name, error = %e, "dependency teardown panicked");
    }
}

/// Resolves dependency graphs for one request.
pub struct Resolver<'a> {
    request: &'a Arc<Request>,
    overrides: &'a DependencyOverrides,
    cache: &'a mut ResolutionCache,
    scope: &'a mut TeardownScope,
    resolving: Vec<DependencyId>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        request: &'a Arc<Request>,
        overrides: &'a DependencyOverrides,
        cache: &'a mut ResolutionCache,
        scope: &'a mut TeardownScope,
    ) -> Self {
        Self {
            request,
            overrides,
            cache,
            scope,
            resolving: Vec::new(),
        }
    }

    /// Resolves every `(name, Depends)` pair, in declaration order.
    ///
    /// Provider failures propagate unchanged.
    pub async fn resolve(&mut self, params: &[(String, Depends)]) -> Result<Resolved, Error> {
        let mut resolved = Resolved::default();
        for (name, depends) in params {
            let value = self.resolve_one(depends).await?;
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }

    fn resolve_one<'s>(&'s mut self, depends: &'s Depends) -> BoxFuture<'s, Result<Value, Error>> {
        Box::pin(async move {
            let dependency = depends.dependency();
            let id = dependency.id();

            if let Some(value) = self.overrides.get(id) {
                return Ok(Arc::clone(value));
            }
            if depends.use_cache() {
                if let Some(value) = self.cache.get(id) {
                    return Ok(Arc::clone(value));
                }
            }
            if self.resolving.contains(&id) {
                return Err(DependencyError::Cycle {
                    name: dependency.name().to_owned(),
                }
                .into());
            }

            self.resolving.push(id);
            let params = self.resolve(dependency.params()).await;
            self.resolving.pop();

            let ctx = DependencyContext {
                request: Arc::clone(self.request),
                resolved: params?,
            };
            let value = match (dependency.provider)(ctx).await? {
                Provided::Value(value) => value,
                Provided::Scoped(value, teardown) => {
                    self.scope.push(dependency.name(), teardown);
                    value
                }
            };

            if depends.use_cache() {
                self.cache.insert(id, Arc::clone(&value));
            }
            Ok(value)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpError;
    use crate::http::Method;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        request: Arc<Request>,
        overrides: DependencyOverrides,
        cache: ResolutionCache,
        scope: TeardownScope,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                request: Arc::new(Request::new(Method::Get, "/").header("Authorization", "Bearer t")),
                overrides: DependencyOverrides::new(),
                cache: ResolutionCache::new(),
                scope: TeardownScope::new(),
            }
        }

        async fn resolve(&mut self, params: &[(String, Depends)]) -> Result<Resolved, Error> {
            Resolver::new(&self.request, &self.overrides, &mut self.cache, &mut self.scope)
                .resolve(params)
                .await
        }
    }

    fn counting(calls: &Arc<AtomicUsize>) -> Dependency {
        let calls = Arc::clone(calls);
        Dependency::sync("counter", move |_| {
            Ok::<_, Error>(calls.fetch_add(1, Ordering::SeqCst) + 1)
        })
    }

    #[tokio::test]
    async fn cached_dependency_runs_once_per_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dep = counting(&calls);
        let params = vec![
            ("v1".to_owned(), Depends::new(&dep)),
            ("v2".to_owned(), Depends::new(&dep)),
        ];

        let resolved = Harness::new().resolve(&params).await.unwrap();
        assert_eq!(*resolved.get::<usize>("v1").unwrap(), 1);
        assert_eq!(*resolved.get::<usize>("v2").unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A new request starts with an empty cache.
        Harness::new().resolve(&params).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn uncached_dependency_runs_every_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dep = counting(&calls);
        let params = vec![
            ("v1".to_owned(), Depends::uncached(&dep)),
            ("v2".to_owned(), Depends::uncached(&dep)),
        ];

        let resolved = Harness::new().resolve(&params).await.unwrap();
        assert_eq!(*resolved.get::<usize>("v1").unwrap(), 1);
        assert_eq!(*resolved.get::<usize>("v2").unwrap(), 2);
    }

    #[tokio::test]
    async fn override_replaces_provider() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dep = counting(&calls);
        let mut harness = Harness::new();
        harness.overrides.insert(&dep, 99_usize);

        let resolved = harness
            .resolve(&[("v".to_owned(), Depends::new(&dep))])
            .await
            .unwrap();
        assert_eq!(*resolved.get::<usize>("v").unwrap(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn nested_dependencies_see_request_and_parents() {
        let token = Dependency::sync("token", |ctx| {
            let header = ctx.request().headers().get("authorization").unwrap_or("");
            Ok::<_, Error>(header.trim_start_matches("Bearer ").to_owned())
        });
        let user = Dependency::new("user", |ctx| async move {
            let token = ctx.get::<String>("token")?;
            Ok::<_, Error>(format!("user-for-{token}"))
        })
        .param("token", Depends::new(&token));

        let resolved = Harness::new()
            .resolve(&[("user".to_owned(), Depends::new(&user))])
            .await
            .unwrap();
        assert_eq!(resolved.get::<String>("user").unwrap(), "user-for-t");
    }

    #[tokio::test]
    async fn provider_error_propagates_unchanged() {
        let deny = Dependency::sync("deny", |_| {
            Err::<(), _>(HttpError::unauthorized("unauthorized"))
        });
        let err = Harness::new()
            .resolve(&[("d".to_owned(), Depends::new(&deny))])
            .await
            .unwrap_err();
        assert_eq!(err.as_http().map(HttpError::detail), Some("unauthorized"));
    }

    #[tokio::test]
    async fn scoped_teardown_runs_lifo_on_close() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scoped = |name: &'static str| {
            let log = Arc::clone(&log);
            Dependency::scoped(name, move |_| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(format!("open {name}"));
                    Ok::<_, Error>(Scoped::new(name, move || async move {
                        log.lock().unwrap().push(format!("close {name}"));
                    }))
                }
            })
        };
        let a = scoped("a");
        let b = scoped("b");

        let mut harness = Harness::new();
        let resolved = harness
            .resolve(&[
                ("a".to_owned(), Depends::new(&a)),
                ("b".to_owned(), Depends::new(&b)),
            ])
            .await
            .unwrap();
        assert_eq!(*resolved.get::<&str>("a").unwrap(), "a");
        assert_eq!(harness.scope.len(), 2);

        let scope = std::mem::take(&mut harness.scope);
        scope.close().await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["open a", "open b", "close b", "close a"]
        );
    }

    #[tokio::test]
    async fn dropped_scope_still_tears_down_lifo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scope = TeardownScope::new();
        for name in ["a", "b"] {
            let log = Arc::clone(&log);
            scope.push(
                name,
                Teardown::new(move || async move {
                    log.lock().unwrap().push(name);
                }),
            );
        }

        drop(scope);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), ["b", "a"]);
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let dep = Dependency::constant("n", 5_u32);
        let resolved = Harness::new()
            .resolve(&[("n".to_owned(), Depends::new(&dep))])
            .await
            .unwrap();
        let err = resolved.get::<String>("n").unwrap_err();
        assert!(err.is::<DependencyError>());
        assert!(resolved.get::<String>("missing").is_err());
    }
}
