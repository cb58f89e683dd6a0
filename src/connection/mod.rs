//! Server-side connection handling.
//!
//! A connection serves exactly one request: read the request line, dispatch
//! the handler, flush the deferred header, send close-notify, close.

use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::error::Elapsed;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::codec::{self, LineError, MAX_REQUEST_LINE};
use crate::handler::{Handler, NotFoundHandler};
use crate::protocol::{status, Request, TlsInfo};

mod writer;

pub use writer::DeferredWriter;

/// Runs `fut` against an optional absolute deadline.
pub(crate) async fn deadline_bound<F>(
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, Elapsed>
where
    F: Future,
{
    match deadline {
        Some(at) => timeout_at(at, fut).await,
        None => Ok(fut.await),
    }
}

/// One accepted connection, generic over plain and TLS streams.
pub(crate) struct Connection<S> {
    stream: S,
    remote_addr: String,
    tls: Option<TlsInfo>,
    cancel: CancellationToken,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub(crate) fn new(
        stream: S,
        remote_addr: String,
        tls: Option<TlsInfo>,
        cancel: CancellationToken,
    ) -> Connection<S> {
        Connection { stream, remote_addr, tls, cancel }
    }

    /// Serves one request, then shuts the stream down so the peer observes
    /// a clean end of stream.
    pub(crate) async fn respond(
        &mut self,
        handler: Option<&Arc<dyn Handler>>,
        read_deadline: Option<Instant>,
        write_deadline: Option<Instant>,
    ) -> io::Result<()> {
        let result = self.respond_inner(handler, read_deadline, write_deadline).await;
        let _ = self.stream.shutdown().await;
        result
    }

    async fn respond_inner(
        &mut self,
        handler: Option<&Arc<dyn Handler>>,
        read_deadline: Option<Instant>,
        write_deadline: Option<Instant>,
    ) -> io::Result<()> {
        let line_read = codec::read_header_line(&mut self.stream, MAX_REQUEST_LINE);
        let raw_url = match deadline_bound(read_deadline, line_read).await {
            Ok(Ok(line)) => line,
            Ok(Err(LineError::TooLong { .. })) => {
                return codec::reply(&mut self.stream, status::BAD_REQUEST, "request line too long")
                    .await;
            }
            Ok(Err(LineError::NotUtf8)) => {
                return codec::reply(&mut self.stream, status::BAD_REQUEST, "invalid url").await;
            }
            Ok(Err(LineError::Io { source })) => return Err(source),
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "request read timed out"));
            }
        };

        let server_name = self
            .tls
            .as_ref()
            .and_then(|tls| tls.server_name.clone())
            .unwrap_or_default();

        let url = match parse_request_url(&raw_url, &server_name) {
            Some(url) => url,
            None => {
                return codec::reply(&mut self.stream, status::BAD_REQUEST, "invalid url").await;
            }
        };

        let request = Request::from_server(
            url,
            raw_url,
            self.remote_addr.clone(),
            server_name,
            self.tls.clone(),
            self.cancel.clone(),
        );

        let serve = async {
            let mut w = DeferredWriter::new(&mut self.stream);
            let served = match handler {
                Some(handler) => handler.serve(&mut w, &request).await,
                None => NotFoundHandler.serve(&mut w, &request).await,
            };
            // handlers that never wrote still produce a header
            let flushed = w.flush_header().await;
            served.and(flushed)
        };

        match deadline_bound(write_deadline, serve).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "response write timed out")),
        }
    }
}

// Scheme-and-host-less request lines inherit the gemini scheme and the SNI
// server name.
fn parse_request_url(raw: &str, server_name: &str) -> Option<Url> {
    match Url::parse(raw) {
        Ok(url) => Some(url),
        Err(url::ParseError::RelativeUrlWithoutBase) if !raw.starts_with("//") => {
            let base = Url::parse(&format!("gemini://{server_name}")).ok()?;
            base.join(raw).ok()
        }
        Err(_) => None,
    }
}
