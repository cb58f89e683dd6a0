//! Gemini request multiplexer.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::handler::{Handler, NotFoundHandler, RedirectHandler, ResponseWriter, StripPrefix};
use crate::protocol::{clean_path, split_host_port, status, Request};

/// Matches the URL of each incoming request against the registered patterns
/// and serves the handler for the pattern that most closely matches.
///
/// Patterns are non-empty strings and come in two shapes: paths starting
/// with `/`, and host-qualified `host/path` patterns that only match
/// requests carrying that SNI hostname. A pattern ending in `/` matches
/// every path it prefixes, longest prefix first; any other pattern matches
/// exactly. Requests for a path whose only registration is `path + "/"`
/// are answered with a permanent redirect to the canonical form.
pub struct ServeMux {
    inner: RwLock<MuxInner>,
}

struct MuxInner {
    exact: HashMap<String, MuxEntry>,
    // every pattern ending in '/', longest first
    prefixes: Vec<MuxEntry>,
    hosts: bool,
    not_found: Arc<dyn Handler>,
}

#[derive(Clone)]
struct MuxEntry {
    pattern: String,
    handler: Arc<dyn Handler>,
}

impl Default for ServeMux {
    fn default() -> ServeMux {
        ServeMux::new()
    }
}

impl ServeMux {
    pub fn new() -> ServeMux {
        ServeMux {
            inner: RwLock::new(MuxInner {
                exact: HashMap::new(),
                prefixes: Vec::new(),
                hosts: false,
                not_found: Arc::new(NotFoundHandler),
            }),
        }
    }

    /// Registers the handler for the given pattern.
    ///
    /// # Panics
    ///
    /// Panics on an empty pattern or a pattern registered twice; both are
    /// programmer errors.
    pub fn handle(&self, pattern: &str, handler: impl Handler + 'static) {
        self.handle_arc(pattern, Arc::new(handler));
    }

    /// Registers an already shared handler for the given pattern.
    pub fn handle_arc(&self, pattern: &str, handler: Arc<dyn Handler>) {
        if pattern.is_empty() {
            panic!("gemnet: empty pattern");
        }

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if inner.exact.contains_key(pattern) {
            panic!("gemnet: multiple registrations for {pattern}");
        }

        let entry = MuxEntry { pattern: pattern.to_string(), handler };
        inner.exact.insert(entry.pattern.clone(), entry.clone());

        if pattern.ends_with('/') {
            let at = inner.prefixes.partition_point(|e| e.pattern.len() >= entry.pattern.len());
            inner.prefixes.insert(at, entry);
        }

        inner.hosts = inner.hosts || !pattern.starts_with('/');
    }

    /// Replaces the handler used when no pattern matches.
    pub fn set_not_found(&self, handler: impl Handler + 'static) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).not_found = Arc::new(handler);
    }

    /// Attaches a handler as a subrouter along a routing path; the pattern
    /// prefix is stripped from the routed request.
    pub fn mount(&self, pattern: &str, handler: impl Handler + 'static) {
        if pattern.starts_with('/') {
            let prefix = pattern.strip_suffix('/').unwrap_or(pattern);
            self.handle(pattern, StripPrefix::new(prefix, handler));
        } else {
            self.handle(pattern, handler);
        }
    }

    /// Creates a fresh mux, passes it to `f` for registration and mounts it
    /// along the routing path.
    pub fn route(&self, pattern: &str, f: impl FnOnce(&ServeMux)) {
        let sub = ServeMux::new();
        f(&sub);
        self.mount(pattern, sub);
    }

    /// Returns the handler to use for the request together with the
    /// registered pattern that matched.
    ///
    /// Always returns a handler: non-canonical paths yield an internally
    /// generated redirect handler and unmatched requests yield the
    /// not-found handler. A port in the request host is ignored.
    pub fn handler(&self, r: &Request) -> (Arc<dyn Handler>, String) {
        if r.url.scheme() != "gemini" {
            return (self.not_found_handler(), String::new());
        }

        let (host, _) = split_host_port(&r.host);
        let path = clean_path(r.url.path());

        if self.should_redirect(&host, &path) {
            let pattern = format!("{path}/");
            let location = with_query(&pattern, r.url.query());
            return (
                Arc::new(RedirectHandler::new(location, status::PERMANENT_REDIRECT)),
                pattern,
            );
        }

        if path != r.url.path() {
            let (_, pattern) = self.lookup(&host, &path);
            let location = with_query(&path, r.url.query());
            return (
                Arc::new(RedirectHandler::new(location, status::PERMANENT_REDIRECT)),
                pattern,
            );
        }

        self.lookup(&host, &path)
    }

    fn not_found_handler(&self) -> Arc<dyn Handler> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).not_found.clone()
    }

    fn lookup(&self, host: &str, path: &str) -> (Arc<dyn Handler>, String) {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        // host-specific patterns take precedence over generic ones
        if inner.hosts {
            if let Some(found) = inner.match_path(&format!("{host}{path}")) {
                return found;
            }
        }
        if let Some(found) = inner.match_path(path) {
            return found;
        }
        (inner.not_found.clone(), String::new())
    }

    // A redirect from path to path + "/" is due when only the slashed form
    // is registered.
    fn should_redirect(&self, host: &str, path: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());

        if path.is_empty()
            || inner.exact.contains_key(path)
            || inner.exact.contains_key(&format!("{host}{path}"))
        {
            return false;
        }

        if inner.exact.contains_key(&format!("{path}/"))
            || inner.exact.contains_key(&format!("{host}{path}/"))
        {
            return !path.ends_with('/');
        }

        false
    }
}

impl MuxInner {
    fn match_path(&self, path: &str) -> Option<(Arc<dyn Handler>, String)> {
        if let Some(entry) = self.exact.get(path) {
            return Some((entry.handler.clone(), entry.pattern.clone()));
        }

        self.prefixes
            .iter()
            .find(|entry| path.starts_with(&entry.pattern))
            .map(|entry| (entry.handler.clone(), entry.pattern.clone()))
    }
}

#[async_trait]
impl Handler for ServeMux {
    async fn serve(&self, w: &mut dyn ResponseWriter, r: &Request) -> io::Result<()> {
        let (handler, _) = self.handler(r);
        handler.serve(w, r).await
    }
}

fn with_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_string(),
    }
}
