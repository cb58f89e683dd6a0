//! Gemini responses and the body stream that owns the connection.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use url::Url;

use crate::protocol::TlsInfo;

/// The response received from a server.
#[derive(Debug)]
pub struct Response {
    /// Two-digit response code.
    pub status: u8,
    /// Response metadata. Its interpretation depends on the status class:
    /// MIME type for success, prompt for input, target URL for redirects,
    /// error text otherwise.
    pub meta: String,
    /// URL the response was finally served from, after redirects.
    pub url: Url,
    /// Response body. Only successful responses carry data; dropping the
    /// body closes the connection.
    pub body: Body,
    /// TLS connection details.
    pub tls: Option<TlsInfo>,
}

/// Streaming response body.
///
/// For 2x responses the body owns the underlying TLS connection and yields
/// bytes until the server closes it. All other responses get an empty body.
pub struct Body {
    inner: BodyInner,
}

enum BodyInner {
    Empty,
    Stream(Box<TlsStream<TcpStream>>),
}

impl Body {
    pub(crate) fn empty() -> Body {
        Body { inner: BodyInner::Empty }
    }

    pub(crate) fn stream(stream: TlsStream<TcpStream>) -> Body {
        Body { inner: BodyInner::Stream(Box::new(stream)) }
    }

    /// Whether the body can never yield data.
    pub fn is_empty(&self) -> bool {
        matches!(self.inner, BodyInner::Empty)
    }
}

impl AsyncRead for Body {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.inner {
            BodyInner::Empty => Poll::Ready(Ok(())),
            BodyInner::Stream(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            BodyInner::Empty => f.write_str("Body(empty)"),
            BodyInner::Stream(_) => f.write_str("Body(stream)"),
        }
    }
}
