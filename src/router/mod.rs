//! Request routing: map request paths to handler functions.
//!
//! Matching is exact and ASCII case-insensitive on the request path (the URL
//! without its query string). Routes are tested in registration order and
//! the first match wins. Prefix, parameter and wildcard patterns are not
//! supported: lookup stays a straight comparison per route, which keeps
//! per-request latency predictable on small hosts.
//!
//! | Registered | Matches              | Does not match       |
//! |------------|----------------------|----------------------|
//! | `/Echo`    | `/echo`, `/ECHO`     | `/echo/`, `/ech`     |
//!
//! Requests matching no route receive `404 Not Found`.

use tracing::debug;

use crate::buffer::BufferError;
use crate::context::Context;

/// Result returned by handlers. An error means the response could not be
/// queued and the connection is torn down.
pub type HandlerResult = Result<(), BufferError>;

/// Type-erased handler stored by the router.
///
/// In practice you never construct this type directly; use
/// [`Router::register`] instead.
pub type Handler = Box<dyn Fn(&mut Context<'_>) -> HandlerResult + Send + Sync + 'static>;

// A single registered route binding a path to a handler.
struct Route {
    path: String,
    handler: Handler,
}

impl Route {
    fn matches(&self, path: &str) -> bool {
        self.path.eq_ignore_ascii_case(path)
    }
}

/// Ordered registry of exact-path routes.
///
/// # Examples
///
/// ```rust
/// use embhttp::Router;
///
/// let mut router = Router::new();
/// router.register("/ping", |ctx| {
///     ctx.respond(200, "text/plain", b"pong")?;
///     Ok(())
/// });
///
/// assert!(router.find("/PING").is_some());
/// assert!(router.find("/ping/").is_none());
/// ```
pub struct Router {
    routes: Vec<Route>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register `handler` for requests whose path equals `path` (case-insensitive).
    ///
    /// Registering the same path twice keeps both entries; the earlier one wins.
    pub fn register<H>(&mut self, path: impl Into<String>, handler: H) -> &mut Self
    where
        H: Fn(&mut Context<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        let path = path.into();
        debug!(path = %path, "route registered");
        self.routes.push(Route {
            path,
            handler: Box::new(handler),
        });
        self
    }

    /// Return the handler of the first route matching `path`.
    pub fn find(&self, path: &str) -> Option<&Handler> {
        self.routes
            .iter()
            .find(|route| route.matches(path))
            .map(|route| &route.handler)
    }

    /// Registered paths in registration order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|route| route.path.as_str())
    }

    /// Return the number of routes registered in this router.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Run the handler matching the request path, or queue a `404 Not Found`.
    ///
    /// # Errors
    ///
    /// Propagates the handler's error, or the write-buffer error of the 404.
    pub fn dispatch(&self, ctx: &mut Context<'_>) -> HandlerResult {
        let path = ctx.request().path();
        match self.find(path) {
            Some(handler) => handler(ctx),
            None => {
                debug!(path = %path, "no route matched");
                ctx.send_error(404, None)?;
                Ok(())
            }
        }
    }
}
