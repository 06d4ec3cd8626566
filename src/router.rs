//! Radix-tree request router.
//!
//! One tree per HTTP method. O(path-length) lookup. Each route is an
//! [`Endpoint`] bound to the application state, checked for missing
//! capabilities when it is registered rather than when it is first hit.

use std::collections::HashMap;
use std::sync::Arc;

use matchit::Router as MatchitRouter;

use crate::dispatcher::{AppState, Dispatcher, Endpoint};
use crate::error::Error;
use crate::method::Method;

/// Result of matching a method and path against the routing table.
pub(crate) enum Lookup {
    Found(Arc<Dispatcher>, HashMap<String, String>),
    /// The path exists, under another method.
    MethodNotAllowed,
    NotFound,
}

/// The application router. Build it once at startup; pass it to
/// [`Server::serve`](crate::Server::serve).
pub struct Router {
    state: AppState,
    routes: HashMap<Method, MatchitRouter<Arc<Dispatcher>>>,
}

impl Router {
    pub fn new(state: AppState) -> Self {
        Self { state, routes: HashMap::new() }
    }

    /// Registers `endpoint` for a method + path pair.
    ///
    /// Path parameters use `{name}` syntax and feed the endpoint's path
    /// fields:
    ///
    /// ```rust
    /// # use sluice::{AppState, Ctx, Endpoint, HandlerError, Method, Router, schema};
    /// # async fn get_user(_: Ctx) -> Result<(), HandlerError> { Ok(()) }
    /// # fn main() -> Result<(), sluice::Error> {
    /// let get_user = Endpoint::builder("getUser").path("id", schema::integer()).handler(get_user)?;
    /// let router = Router::new(AppState::new()).route(Method::Get, "/users/{id}", get_user)?;
    /// # let _ = router;
    /// # Ok(())
    /// # }
    /// ```
    pub fn route(mut self, method: Method, path: &str, endpoint: Endpoint) -> Result<Self, Error> {
        let dispatcher = Dispatcher::new(endpoint, &self.state)?;
        self.routes
            .entry(method)
            .or_default()
            .insert(path, Arc::new(dispatcher))
            .map_err(|e| Error::InvalidRoute { path: path.to_owned(), reason: e.to_string() })?;
        Ok(self)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub(crate) fn lookup(&self, method: Method, path: &str) -> Lookup {
        if let Some(matched) = self.routes.get(&method).and_then(|tree| tree.at(path).ok()) {
            let params = matched.params.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();
            return Lookup::Found(Arc::clone(matched.value), params);
        }
        if self.routes.values().any(|tree| tree.at(path).is_ok()) {
            Lookup::MethodNotAllowed
        } else {
            Lookup::NotFound
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::HandlerError;
    use crate::context::Ctx;
    use crate::schema;

    async fn noop(_ctx: Ctx) -> Result<(), HandlerError> {
        Ok(())
    }

    fn endpoint(name: &str) -> Endpoint {
        Endpoint::builder(name).path("id", schema::integer()).handler(noop).unwrap()
    }

    #[test]
    fn lookup_outcomes() {
        let router = Router::new(AppState::new()).route(Method::Get, "/users/{id}", endpoint("getUser")).unwrap();

        match router.lookup(Method::Get, "/users/7") {
            Lookup::Found(d, params) => {
                assert_eq!(d.name(), "getUser");
                assert_eq!(params.get("id").map(String::as_str), Some("7"));
            }
            _ => panic!("expected a match"),
        }
        assert!(matches!(router.lookup(Method::Delete, "/users/7"), Lookup::MethodNotAllowed));
        assert!(matches!(router.lookup(Method::Get, "/nope"), Lookup::NotFound));
    }

    #[test]
    fn conflicting_routes_are_rejected() {
        let err = Router::new(AppState::new())
            .route(Method::Get, "/users/{id}", endpoint("a"))
            .and_then(|r| r.route(Method::Get, "/users/{id}", endpoint("b")))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidRoute { .. }));
    }
}
