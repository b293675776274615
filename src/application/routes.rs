use crate::domain::request::Method;
use crate::domain::route::Route;

/// Ordered route registry. Installed once before serving, read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        let mut table = Self::default();
        table.install(routes);
        table
    }

    /// Replaces the whole route list.
    pub fn install(&mut self, routes: Vec<Route>) {
        for (idx, route) in routes.iter().enumerate() {
            let shadowed = routes[..idx].iter().any(|earlier| {
                !earlier.is_prefix()
                    && !route.is_prefix()
                    && earlier.method() == route.method()
                    && earlier.path() == route.path()
            });
            if shadowed {
                tracing::warn!(
                    method = %route.method(),
                    path = route.path(),
                    "duplicate exact route will never be matched"
                );
            }
        }
        self.routes = routes;
    }

    /// First route, in registration order, whose method and path are equal.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|route| route.method() == method && route.path() == path)
    }

    /// First prefix route, in registration order, whose path starts `path`.
    pub fn resolve_prefix(&self, method: &Method, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| {
            route.is_prefix() && route.method() == method && path.starts_with(route.path())
        })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }
}
