//! Gemini server: TLS termination, accept loop and connection dispatch.

use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Instant};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::connection::{deadline_bound, Connection};
use crate::handler::Handler;
use crate::protocol::TlsInfo;

mod backoff;

use backoff::Backoff;

/// Default listen address, port 1965.
pub const DEFAULT_ADDR: &str = "0.0.0.0:1965";

/// Errors from running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The accept loop stopped because the shutdown token fired.
    #[error("server closed")]
    Closed,

    /// A secure server was started without a TLS configuration.
    #[error("missing tls configuration")]
    MissingTlsConfig,

    /// I/O error from the listener.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// A Gemini server.
///
/// Each accepted connection is served on its own task; a panicking handler
/// only takes its own connection down. Cancelling the shutdown token stops
/// accepting new connections while in-flight requests finish on their own,
/// bounded by the configured deadlines.
pub struct Server {
    addr: String,
    handler: Option<Arc<dyn Handler>>,
    tls_config: Option<Arc<ServerConfig>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    insecure: bool,
}

/// Builder for [`Server`].
pub struct ServerBuilder {
    addr: String,
    handler: Option<Arc<dyn Handler>>,
    tls_config: Option<Arc<ServerConfig>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    insecure: bool,
}

impl ServerBuilder {
    fn new() -> ServerBuilder {
        ServerBuilder {
            addr: String::new(),
            handler: None,
            tls_config: None,
            read_timeout: None,
            write_timeout: None,
            insecure: false,
        }
    }

    /// Address to listen on. Defaults to [`DEFAULT_ADDR`].
    pub fn address(mut self, addr: impl Into<String>) -> ServerBuilder {
        self.addr = addr.into();
        self
    }

    /// Handler invoked for every request. Requests are answered with
    /// 51 Not Found when no handler is set.
    pub fn handler(mut self, handler: impl Handler + 'static) -> ServerBuilder {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Like [`handler`](ServerBuilder::handler) for an already shared one.
    pub fn handler_arc(mut self, handler: Arc<dyn Handler>) -> ServerBuilder {
        self.handler = Some(handler);
        self
    }

    /// TLS configuration presented to clients. Required unless the server
    /// is [`insecure`](ServerBuilder::insecure).
    pub fn tls_config(mut self, config: Arc<ServerConfig>) -> ServerBuilder {
        self.tls_config = Some(config);
        self
    }

    /// Maximum duration for reading an incoming request, covering the TLS
    /// handshake and the request line.
    pub fn read_timeout(mut self, timeout: Duration) -> ServerBuilder {
        self.read_timeout = Some(timeout);
        self
    }

    /// Maximum duration for producing and writing the response.
    pub fn write_timeout(mut self, timeout: Duration) -> ServerBuilder {
        self.write_timeout = Some(timeout);
        self
    }

    /// Disables TLS. Only sensible behind a reverse proxy; insecure servers
    /// never see SNI.
    pub fn insecure(mut self) -> ServerBuilder {
        self.insecure = true;
        self
    }

    pub fn build(self) -> Server {
        Server {
            addr: self.addr,
            handler: self.handler,
            tls_config: self.tls_config,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            insecure: self.insecure,
        }
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Binds the configured address and runs the accept loop until the
    /// shutdown token fires.
    pub async fn listen_and_serve(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let addr = if self.addr.is_empty() { DEFAULT_ADDR } else { &self.addr };

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(cause = %e, "bind server error");
                return Err(e.into());
            }
        };

        self.serve(shutdown, listener).await
    }

    /// Runs the accept loop on an existing listener until the shutdown token
    /// fires, then reports [`ServerError::Closed`].
    pub async fn serve(
        &self,
        shutdown: CancellationToken,
        listener: TcpListener,
    ) -> Result<(), ServerError> {
        let acceptor = if self.insecure {
            None
        } else {
            let config = self.tls_config.clone().ok_or(ServerError::MissingTlsConfig)?;
            Some(TlsAcceptor::from(config))
        };

        info!(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(), "listening");

        let mut backoff = Backoff::new();

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Err(ServerError::Closed),
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) if is_transient(&e) => {
                    let delay = backoff.next_delay();
                    warn!(cause = %e, ?delay, "accept timeout, retrying");
                    time::sleep(delay).await;
                    continue;
                }
                Err(e) => {
                    if shutdown.is_cancelled() {
                        return Err(ServerError::Closed);
                    }
                    error!(cause = %e, "server listen error");
                    return Err(e.into());
                }
            };

            backoff.reset();

            let worker = Worker {
                acceptor: acceptor.clone(),
                handler: self.handler.clone(),
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                shutdown: shutdown.clone(),
            };

            tokio::spawn(async move {
                // one misbehaving handler must not take the server down
                let serve = AssertUnwindSafe(worker.serve(stream, peer));
                if let Err(panic) = serve.catch_unwind().await {
                    error!(payload = panic_message(panic.as_ref()), "recovered panic while serving connection");
                }
            });
        }
    }
}

struct Worker {
    acceptor: Option<TlsAcceptor>,
    handler: Option<Arc<dyn Handler>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        let start = Instant::now();
        let read_deadline = self.read_timeout.map(|t| start + t);
        let write_deadline = self.write_timeout.map(|t| start + t);

        match &self.acceptor {
            Some(acceptor) => {
                let handshake = acceptor.accept(stream);
                let stream = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return,
                    done = deadline_bound(read_deadline, handshake) => match done {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            error!(cause = %e, "tls handshake failed");
                            return;
                        }
                        Err(_) => {
                            error!("tls handshake timed out");
                            return;
                        }
                    },
                };

                let tls = {
                    let (_, conn) = stream.get_ref();
                    TlsInfo::from_common(conn, conn.server_name())
                };

                self.respond(stream, peer, Some(tls), read_deadline, write_deadline).await;
            }
            None => self.respond(stream, peer, None, read_deadline, write_deadline).await,
        }
    }

    async fn respond<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        tls: Option<TlsInfo>,
        read_deadline: Option<Instant>,
        write_deadline: Option<Instant>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut conn = Connection::new(stream, peer.to_string(), tls, self.shutdown.clone());
        if let Err(e) = conn.respond(self.handler.as_ref(), read_deadline, write_deadline).await {
            error!(cause = %e, "connection error");
        }
    }
}

// The error kinds a listener can report without being fatally broken.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::io as stdio;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::client::Client;
    use crate::handler::ResponseWriter;
    use crate::protocol::{status, Request, GEMTEXT_MIME_TYPE};
    use crate::testing::TestServer;

    struct Hello;

    #[async_trait]
    impl Handler for Hello {
        async fn serve(&self, w: &mut dyn ResponseWriter, _r: &Request) -> stdio::Result<()> {
            w.write_all(b"hello world").await
        }
    }

    #[tokio::test]
    async fn serves_a_request_end_to_end() {
        let server = TestServer::start(Hello).await;
        let client = Client::builder().build();

        let mut res = client.get(&format!("{}/", server.url)).await.unwrap();
        assert_eq!(res.status, status::OK);
        assert_eq!(res.meta, GEMTEXT_MIME_TYPE);

        let mut body = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut res.body, &mut body).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn rejects_overlong_request_lines() {
        let server = TestServer::start(Hello).await;
        let client = Client::builder().build();

        let res = client.get(&format!("{}{}", server.url, "/".repeat(2000))).await.unwrap();
        assert_eq!(res.status, status::BAD_REQUEST);
        assert_eq!(res.meta, "request line too long");
        assert!(res.body.is_empty());
    }

    #[tokio::test]
    async fn insecure_server_speaks_plaintext() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Server::builder().handler(Hello).insecure().build();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = server.serve(token, listener).await;
        });

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"/\r\n").await.unwrap();

        let mut response = Vec::new();
        conn.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"20 text/gemini;charset=utf-8\r\nhello world");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn cancelling_the_token_closes_the_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::builder().handler(Hello).insecure().build();

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert!(matches!(
            server.serve(shutdown, listener).await,
            Err(ServerError::Closed)
        ));
    }

    #[tokio::test]
    async fn secure_server_requires_a_tls_config() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::builder().handler(Hello).build();

        assert!(matches!(
            server.serve(CancellationToken::new(), listener).await,
            Err(ServerError::MissingTlsConfig)
        ));
    }

    #[tokio::test]
    async fn survives_garbage_instead_of_a_handshake() {
        let server = TestServer::start(Hello).await;

        // not a TLS record; the handshake fails and only that connection dies
        let addr = server.url.strip_prefix("gemini://").unwrap().replace("localhost", "127.0.0.1");
        let mut conn = TcpStream::connect(&addr).await.unwrap();
        conn.write_all(b"/////////////////////////\r\n").await.unwrap();
        let mut sink = Vec::new();
        let _ = conn.read_to_end(&mut sink).await;

        let client = Client::builder().build();
        let res = client.get(&format!("{}/", server.url)).await.unwrap();
        assert_eq!(res.status, status::OK);
    }

    struct Boom;

    #[async_trait]
    impl Handler for Boom {
        async fn serve(&self, _w: &mut dyn ResponseWriter, _r: &Request) -> stdio::Result<()> {
            panic!("handler exploded");
        }
    }

    struct PanicOnPath;

    #[async_trait]
    impl Handler for PanicOnPath {
        async fn serve(&self, w: &mut dyn ResponseWriter, r: &Request) -> stdio::Result<()> {
            if r.url.path() == "/boom" {
                Boom.serve(w, r).await
            } else {
                w.write_all(b"still alive").await
            }
        }
    }

    #[tokio::test]
    async fn a_panicking_handler_only_kills_its_connection() {
        let server = TestServer::start(PanicOnPath).await;
        let client = Client::builder().build();

        assert!(client.get(&format!("{}/boom", server.url)).await.is_err());

        let mut res = client.get(&format!("{}/ok", server.url)).await.unwrap();
        let mut body = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut res.body, &mut body).await.unwrap();
        assert_eq!(body, b"still alive");
    }
}
