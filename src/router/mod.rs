//! Request routing: handlers, endpoint descriptors, sub-routers, path matching.
//!
//! - [`IntoHandler`] / [`sync_handler`]: what can be registered as a handler.
//! - [`Endpoint`]: a handler plus its declared path, query, body, and
//!   dependency inputs.
//! - [`Router`]: a group of routes under a shared prefix and tags, merged into
//!   an application with [`App::include`](crate::App::include).
//! - [`RouteTable`]: the radix-tree matcher the bundled engine uses.

mod endpoint;
mod table;

pub use endpoint::{
    Endpoint, Handler, IntoEndpoint, IntoHandler, Kind, Param, Source, SyncHandler, sync_handler,
};
pub use table::RouteTable;

use crate::http::Method;

/// A route collected by a [`Router`], with the prefix already applied.
#[derive(Debug)]
pub struct RouteDef {
    method: Method,
    path: String,
    endpoint: Endpoint,
    tags: Vec<String>,
}

impl RouteDef {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub(crate) fn into_parts(self) -> (Method, String, Endpoint, Vec<String>) {
        (self.method, self.path, self.endpoint, self.tags)
    }
}

/// A group of routes sharing a path prefix and tags.
///
/// Routes collected here are registered by [`App::include`](crate::App::include)
/// through the same path as routes added to the application directly.
///
/// # Examples
///
/// ```rust
/// use blaze::{Context, Error, router::Router};
///
/// async fn list(_ctx: Context) -> Result<&'static str, Error> {
///     Ok("[]")
/// }
///
/// let mut users = Router::new("/users").tag("users");
/// users.get("/", list).get("/{id}", list);
/// assert_eq!(users.routes()[1].path(), "/users/{id}");
/// ```
#[derive(Debug, Default)]
pub struct Router {
    prefix: String,
    tags: Vec<String>,
    routes: Vec<RouteDef>,
}

impl Router {
    /// Create a new, empty `Router` whose routes live under `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_owned(),
            tags: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Adds a tag to every route of this router.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Register `endpoint` for `method` requests matching `path`.
    pub fn route(&mut self, method: Method, path: &str, endpoint: impl IntoEndpoint) -> &mut Self {
        self.route_tagged(method, path, endpoint, Vec::new())
    }

    /// Like [`route`](Self::route), with tags for this route only.
    pub fn route_tagged(
        &mut self,
        method: Method,
        path: &str,
        endpoint: impl IntoEndpoint,
        tags: Vec<String>,
    ) -> &mut Self {
        let mut all_tags = self.tags.clone();
        all_tags.extend(tags);
        self.routes.push(RouteDef {
            method,
            path: join(&self.prefix, path),
            endpoint: endpoint.into_endpoint(),
            tags: all_tags,
        });
        self
    }

    /// Register a handler for `GET` requests matching `path`.
    pub fn get(&mut self, path: &str, endpoint: impl IntoEndpoint) -> &mut Self {
        self.route(Method::Get, path, endpoint)
    }

    /// Register a handler for `POST` requests matching `path`.
    pub fn post(&mut self, path: &str, endpoint: impl IntoEndpoint) -> &mut Self {
        self.route(Method::Post, path, endpoint)
    }

    /// Register a handler for `PUT` requests matching `path`.
    pub fn put(&mut self, path: &str, endpoint: impl IntoEndpoint) -> &mut Self {
        self.route(Method::Put, path, endpoint)
    }

    /// Register a handler for `DELETE` requests matching `path`.
    pub fn delete(&mut self, path: &str, endpoint: impl IntoEndpoint) -> &mut Self {
        self.route(Method::Delete, path, endpoint)
    }

    /// Register a handler for `PATCH` requests matching `path`.
    pub fn patch(&mut self, path: &str, endpoint: impl IntoEndpoint) -> &mut Self {
        self.route(Method::Patch, path, endpoint)
    }

    /// Register a handler for `OPTIONS` requests matching `path`.
    pub fn options(&mut self, path: &str, endpoint: impl IntoEndpoint) -> &mut Self {
        self.route(Method::Options, path, endpoint)
    }

    /// Moves every route of `other` into this router under this router's prefix.
    pub fn nest(&mut self, other: Router) -> &mut Self {
        for route in other.routes {
            let mut tags = self.tags.clone();
            tags.extend(route.tags);
            self.routes.push(RouteDef {
                path: join(&self.prefix, &route.path),
                tags,
                ..route
            });
        }
        self
    }

    pub fn routes(&self) -> &[RouteDef] {
        &self.routes
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub(crate) fn into_routes(self) -> Vec<RouteDef> {
        self.routes
    }
}

fn join(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        return path.to_owned();
    }
    if path.is_empty() || path == "/" {
        return prefix.to_owned();
    }
    if path.starts_with('/') {
        format!("{prefix}{path}")
    } else {
        format!("{prefix}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Context, Error};

    async fn ok(_ctx: Context) -> Result<(), Error> {
        Ok(())
    }

    #[test]
    fn router_starts_empty() {
        let router = Router::new("/api");
        assert!(router.is_empty());
        assert_eq!(router.len(), 0);
    }

    #[test]
    fn prefix_is_joined() {
        let mut router = Router::new("/api/");
        router
            .get("/", ok)
            .get("/users/{id}", ok)
            .post("items", ok);
        let paths: Vec<_> = router.routes().iter().map(RouteDef::path).collect();
        assert_eq!(paths, ["/api", "/api/users/{id}", "/api/items"]);
        assert_eq!(router.routes()[2].method(), &Method::Post);
    }

    #[test]
    fn tags_accumulate() {
        let mut inner = Router::new("/users").tag("users");
        inner.route_tagged(Method::Get, "/{id}", ok, vec!["read".into()]);

        let mut outer = Router::new("/v1").tag("v1");
        outer.nest(inner);

        let route = &outer.routes()[0];
        assert_eq!(route.path(), "/v1/users/{id}");
        assert_eq!(route.tags(), ["v1", "users", "read"]);
    }

    #[test]
    fn method_variants_registered() {
        let mut router = Router::default();
        router
            .put("/r", ok)
            .delete("/r", ok)
            .patch("/r", ok)
            .options("/r", ok);
        assert_eq!(router.len(), 4);
        assert_eq!(router.routes()[0].path(), "/r");
    }
}
