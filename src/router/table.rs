//! Path matching for the bundled engine.
//!
//! One [`matchit`] radix tree per method maps a path pattern to the index of a
//! registered route. Patterns use `{name}` for a single segment and `{*name}`
//! for the rest of the path:
//!
//! | Pattern              | Example match              | Captured params              |
//! |----------------------|----------------------------|------------------------------|
//! | `/users`             | `/users`                   | *(none)*                     |
//! | `/users/{id}`        | `/users/42`                | `id → "42"`                  |
//! | `/files/{*path}`     | `/files/docs/readme.txt`   | `path → "docs/readme.txt"`   |

use std::collections::HashMap;

use crate::http::Method;

/// Method + path → route index.
#[derive(Default)]
pub struct RouteTable {
    trees: HashMap<Method, matchit::Router<usize>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `pattern` for `method`.
    ///
    /// # Errors
    ///
    /// Fails when the pattern is malformed or overlaps an existing pattern for the
    /// same method (e.g. `/users/{id}` next to `/users/{name}`).
    pub fn insert(
        &mut self,
        method: &Method,
        pattern: &str,
        index: usize,
    ) -> Result<(), matchit::InsertError> {
        self.trees
            .entry(method.clone())
            .or_insert_with(matchit::Router::new)
            .insert(pattern, index)
    }

    /// Finds the route for `method` and `path`, with its captured parameters.
    pub fn at(&self, method: &Method, path: &str) -> Option<(usize, HashMap<String, String>)> {
        let matched = self.trees.get(method)?.at(path).ok()?;
        let params = matched
            .params
            .iter()
            .map(|(name, value)| (name.to_owned(), value.to_owned()))
            .collect();
        Some((*matched.value, params))
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("methods", &self.trees.keys().collect::<Vec<_>>())
            .finish()
    }
}
