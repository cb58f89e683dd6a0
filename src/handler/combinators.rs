//! Stock handlers: redirects, not found, prefix stripping and the
//! interactive input gate.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use crate::handler::{Handler, ResponseWriter};
use crate::protocol::{absolute_url, status, Request};

/// Responds with a redirection to the given URL, made absolute against the
/// request URL.
pub fn redirect(w: &mut dyn ResponseWriter, r: &Request, url: &str, code: u8) {
    w.write_header(code, &absolute_url(r, url));
}

/// Responds with 51 Not Found.
pub fn not_found(w: &mut dyn ResponseWriter) {
    w.write_header(status::NOT_FOUND, "Not Found");
}

/// Handler that redirects every request to a fixed URL.
pub struct RedirectHandler {
    url: String,
    code: u8,
}

impl RedirectHandler {
    pub fn new(url: impl Into<String>, code: u8) -> RedirectHandler {
        RedirectHandler { url: url.into(), code }
    }
}

#[async_trait]
impl Handler for RedirectHandler {
    async fn serve(&self, w: &mut dyn ResponseWriter, r: &Request) -> io::Result<()> {
        redirect(w, r, &self.url, self.code);
        Ok(())
    }
}

/// Handler that responds with 51 Not Found.
#[derive(Clone, Copy, Default)]
pub struct NotFoundHandler;

#[async_trait]
impl Handler for NotFoundHandler {
    async fn serve(&self, w: &mut dyn ResponseWriter, _r: &Request) -> io::Result<()> {
        not_found(w);
        Ok(())
    }
}

/// Serves requests by removing the given prefix from the request path and
/// invoking the wrapped handler. Requests whose path does not start with the
/// prefix are answered with 51 Not Found.
pub struct StripPrefix {
    prefix: String,
    inner: Arc<dyn Handler>,
}

impl StripPrefix {
    pub fn new(prefix: impl Into<String>, handler: impl Handler + 'static) -> StripPrefix {
        StripPrefix { prefix: prefix.into(), inner: Arc::new(handler) }
    }
}

#[async_trait]
impl Handler for StripPrefix {
    async fn serve(&self, w: &mut dyn ResponseWriter, r: &Request) -> io::Result<()> {
        if self.prefix.is_empty() {
            return self.inner.serve(w, r).await;
        }

        match r.url.path().strip_prefix(&self.prefix) {
            Some(rest) => {
                let mut stripped = r.clone();
                let rest = rest.to_string();
                stripped.url.set_path(&rest);
                self.inner.serve(w, &stripped).await
            }
            None => {
                not_found(w);
                Ok(())
            }
        }
    }
}

/// Gates a handler behind Gemini's interactive input flow: requests without
/// a query string are answered with 10 and the prompt, requests carrying one
/// reach the wrapped handler, which can read it with [`Request::input`].
pub struct Input {
    prompt: String,
    next: Arc<dyn Handler>,
}

impl Input {
    pub fn new(prompt: impl Into<String>, next: impl Handler + 'static) -> Input {
        Input { prompt: prompt.into(), next: Arc::new(next) }
    }
}

#[async_trait]
impl Handler for Input {
    async fn serve(&self, w: &mut dyn ResponseWriter, r: &Request) -> io::Result<()> {
        if r.url.query().unwrap_or("").is_empty() {
            w.write_header(status::INPUT, &self.prompt);
            return Ok(());
        }
        self.next.serve(w, r).await
    }
}
