//! Utilities for writing tests: an ephemeral server with a throwaway
//! certificate and an in-memory response recorder.

use std::io;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cert::{self, Identity};
use crate::handler::{Handler, ResponseWriter};
use crate::protocol::{status, Request, GEMTEXT_MIME_TYPE};
use crate::server::Server;

/// A temporary server listening on an ephemeral localhost port.
///
/// The server presents a freshly generated `localhost` certificate and
/// requests (but does not require) client certificates. It stops when the
/// value is dropped.
pub struct TestServer {
    /// Base URL of the server, `gemini://localhost:<port>`.
    pub url: String,
    identity: Identity,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Starts a server for `handler`.
    ///
    /// # Panics
    ///
    /// Panics when the throwaway certificate or the listener cannot be
    /// created; both mean the test environment is broken.
    pub async fn start(handler: impl Handler + 'static) -> TestServer {
        let identity = Identity::self_signed(&["localhost"], 1).expect("test certificate");
        let config = cert::server_config(&identity).expect("test tls config");

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test listener");
        let port = listener.local_addr().expect("listener address").port();

        let server = Server::builder().handler(handler).tls_config(config).build();

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = server.serve(token, listener).await;
        });

        TestServer { url: format!("gemini://localhost:{port}"), identity, shutdown }
    }

    /// The identity the server presents.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// [`ResponseWriter`] that records the response in memory.
///
/// Unlike the wire writer, the first recorded header wins; this keeps
/// assertions on the intended response stable even when a handler keeps
/// writing afterwards.
pub struct ResponseRecorder {
    pub status: u8,
    pub meta: String,
    pub body: Vec<u8>,
    wrote_header: bool,
}

impl Default for ResponseRecorder {
    fn default() -> ResponseRecorder {
        ResponseRecorder::new()
    }
}

impl ResponseRecorder {
    pub fn new() -> ResponseRecorder {
        ResponseRecorder {
            status: status::OK,
            meta: GEMTEXT_MIME_TYPE.to_string(),
            body: Vec::new(),
            wrote_header: false,
        }
    }
}

#[async_trait]
impl ResponseWriter for ResponseRecorder {
    fn write_header(&mut self, status: u8, meta: &str) {
        if !self.wrote_header {
            self.wrote_header = true;
            self.status = status;
            self.meta = meta.to_string();
        }
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.wrote_header = true;
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Creates a request for tests.
///
/// # Panics
///
/// Panics when the URL does not parse.
pub fn new_request(raw_url: &str) -> Request {
    Request::new(raw_url).expect("request url")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorder_latches_the_first_header() {
        let mut w = ResponseRecorder::new();
        w.write_header(status::INPUT, "prompt");
        w.write_header(status::NOT_FOUND, "Not Found");
        assert_eq!(w.status, status::INPUT);
        assert_eq!(w.meta, "prompt");
    }

    #[tokio::test]
    async fn recorder_keeps_the_default_header_after_a_write() {
        let mut w = ResponseRecorder::new();
        w.write_all(b"body").await.unwrap();
        w.write_header(status::NOT_FOUND, "Not Found");
        assert_eq!(w.status, status::OK);
        assert_eq!(w.body, b"body");
    }
}
