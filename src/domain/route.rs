use crate::domain::request::{Method, Request};
use crate::infrastructure::server_impl::response::ResponseWriter;
use crate::AnyResult;
use compact_str::{CompactString, ToCompactString};
use std::fmt;
use std::sync::Arc;

/// Application code bound to a route. Must produce exactly one response.
pub type Handler = Arc<dyn Fn(&Request, &mut ResponseWriter) -> AnyResult<()> + Send + Sync>;

/// A registered (method, path-or-prefix, auth flag, handler) binding.
///
/// Paths are stored lower-cased because incoming request paths are.
#[derive(Clone)]
pub struct Route {
    path: CompactString,
    method: Method,
    auth: bool,
    prefix: bool,
    handler: Handler,
    description: Option<String>,
}

impl Route {
    pub fn new<F>(method: Method, path: &str, handler: F) -> Self
    where
        F: Fn(&Request, &mut ResponseWriter) -> AnyResult<()> + Send + Sync + 'static,
    {
        Self {
            path: path.to_lowercase().to_compact_string(),
            method,
            auth: false,
            prefix: false,
            handler: Arc::new(handler),
            description: None,
        }
    }

    pub fn get<F>(path: &str, handler: F) -> Self
    where
        F: Fn(&Request, &mut ResponseWriter) -> AnyResult<()> + Send + Sync + 'static,
    {
        Self::new(Method::Get, path, handler)
    }

    pub fn post<F>(path: &str, handler: F) -> Self
    where
        F: Fn(&Request, &mut ResponseWriter) -> AnyResult<()> + Send + Sync + 'static,
    {
        Self::new(Method::Post, path, handler)
    }

    pub fn put<F>(path: &str, handler: F) -> Self
    where
        F: Fn(&Request, &mut ResponseWriter) -> AnyResult<()> + Send + Sync + 'static,
    {
        Self::new(Method::Put, path, handler)
    }

    pub fn delete<F>(path: &str, handler: F) -> Self
    where
        F: Fn(&Request, &mut ResponseWriter) -> AnyResult<()> + Send + Sync + 'static,
    {
        Self::new(Method::Delete, path, handler)
    }

    /// Requires an `authorization` header (API paths) or a `token` cookie (everything else).
    pub fn with_auth(mut self) -> Self {
        self.auth = true;
        self
    }

    /// Matches every path starting with this route's path, after exact routes missed.
    pub fn as_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn requires_auth(&self) -> bool {
        self.auth
    }

    pub fn is_prefix(&self) -> bool {
        self.prefix
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn invoke(&self, request: &Request, writer: &mut ResponseWriter) -> AnyResult<()> {
        (self.handler)(request, writer)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("auth", &self.auth)
            .field("prefix", &self.prefix)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}
