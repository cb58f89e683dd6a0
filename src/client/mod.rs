//! Gemini client with redirect following and TOFU verification.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::error::Elapsed;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig};
use tokio_rustls::TlsConnector;
use tracing::trace;

use crate::codec::{self, LineError, MAX_RESPONSE_HEADER};
use crate::protocol::{absolute_url, split_host_port, Body, Request, Response, TlsInfo};
use crate::tofu::HostsFile;

mod verify;

use verify::TofuVerifier;

/// Maximum number of redirects [`Client::execute`] follows.
pub const MAX_REDIRECTS: usize = 5;

const DEFAULT_PORT: &str = "1965";

/// A client certificate chain and the key it belongs to.
pub struct ClientIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for ClientIdentity {
    fn clone(&self) -> ClientIdentity {
        ClientIdentity { cert_chain: self.cert_chain.clone(), key: self.key.clone_key() }
    }
}

impl From<&crate::cert::Identity> for ClientIdentity {
    fn from(identity: &crate::cert::Identity) -> ClientIdentity {
        ClientIdentity {
            cert_chain: vec![identity.certificate().clone()],
            key: identity.private_key(),
        }
    }
}

/// Maps a hostname to the client certificate presented to it, or `None` to
/// present nothing.
pub type GetCertificate = Arc<dyn Fn(&str) -> Option<ClientIdentity> + Send + Sync>;

/// Returns the same certificate regardless of hostname.
pub fn single_client_certificate(identity: ClientIdentity) -> GetCertificate {
    Arc::new(move |_| Some(identity.clone()))
}

/// Errors from issuing requests.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server response carried no status field.
    #[error("invalid response")]
    InvalidResponse,

    /// The redirect budget was exhausted.
    #[error("too many redirects: {next_url}")]
    TooManyRedirects {
        /// URL the client was last redirected from.
        last_url: String,
        /// URL the client refused to follow.
        next_url: String,
    },

    /// The request URL scheme is not `gemini`.
    #[error("request url scheme is not gemini")]
    UnsupportedScheme,

    /// The request or a redirect target could not be parsed.
    #[error("invalid url: {source}")]
    InvalidUrl {
        #[from]
        source: url::ParseError,
    },

    /// The response header could not be read.
    #[error("malformed response header: {source}")]
    Header { source: LineError },

    /// The request's cancellation token fired.
    #[error("request cancelled")]
    Cancelled,

    /// A configured timeout elapsed.
    #[error("{phase} timed out")]
    TimedOut { phase: &'static str },

    /// The client TLS configuration was rejected.
    #[error("tls error: {source}")]
    Tls {
        #[from]
        source: rustls::Error,
    },

    /// Connection-level failure, including TLS handshake and TOFU failures.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ClientError {
    fn timed_out(phase: &'static str) -> ClientError {
        ClientError::TimedOut { phase }
    }
}

/// A Gemini protocol client.
///
/// The response body owns the connection; read it to completion or drop it
/// to close. Clients can verify and record host certificates through a
/// [`HostsFile`] and authenticate themselves with a client certificate:
///
/// ```no_run
/// use std::sync::Arc;
///
/// use gemnet::client::Client;
/// use gemnet::tofu::HostsFile;
/// use tokio::io::AsyncReadExt;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let hosts = Arc::new(HostsFile::open("./known_hosts")?);
/// let client = Client::builder().hosts_file(hosts).build();
///
/// let mut res = client.get("gemini://geminiprotocol.net/").await?;
/// let mut body = String::new();
/// res.body.read_to_string(&mut body).await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    hosts: Option<Arc<HostsFile>>,
    get_certificate: Option<GetCertificate>,
}

impl Default for Client {
    fn default() -> Client {
        Client::builder().build()
    }
}

/// Builder for [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    hosts: Option<Arc<HostsFile>>,
    get_certificate: Option<GetCertificate>,
}

impl ClientBuilder {
    /// Limit on establishing the connection, TLS handshake included.
    pub fn connect_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Limit on reading the response header. Body reads are paced by the
    /// caller and not deadline-bound.
    pub fn read_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.read_timeout = Some(timeout);
        self
    }

    /// Limit on writing the request line.
    pub fn write_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.write_timeout = Some(timeout);
        self
    }

    /// Verify and record host certificates in the given TOFU store.
    pub fn hosts_file(mut self, hosts: Arc<HostsFile>) -> ClientBuilder {
        self.hosts = Some(hosts);
        self
    }

    /// Select a client certificate per hostname.
    pub fn get_certificate(mut self, get_certificate: GetCertificate) -> ClientBuilder {
        self.get_certificate = Some(get_certificate);
        self
    }

    /// Present the same client certificate to every host.
    pub fn client_certificate(self, identity: ClientIdentity) -> ClientBuilder {
        self.get_certificate(single_client_certificate(identity))
    }

    pub fn build(self) -> Client {
        Client {
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            hosts: self.hosts,
            get_certificate: self.get_certificate,
        }
    }
}

enum Hop {
    Response(Response),
    Redirect(String),
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Issues a request to the given URL.
    pub async fn get(&self, raw_url: &str) -> Result<Response, ClientError> {
        let req = Request::new(raw_url)?;
        self.execute(req).await
    }

    /// Sends the request, following up to [`MAX_REDIRECTS`] redirects, and
    /// returns the response.
    pub async fn execute(&self, req: Request) -> Result<Response, ClientError> {
        if req.url.scheme() != "gemini" {
            return Err(ClientError::UnsupportedScheme);
        }

        let mut dialer = Dialer::new(self.hosts.clone(), self.get_certificate.clone());
        let mut req = req;
        let mut redirects = MAX_REDIRECTS;

        loop {
            match self.roundtrip(&mut dialer, &req).await? {
                Hop::Response(response) => return Ok(response),
                Hop::Redirect(meta) => {
                    if redirects == 0 {
                        return Err(ClientError::TooManyRedirects {
                            last_url: req.url.to_string(),
                            next_url: meta,
                        });
                    }
                    redirects -= 1;

                    let target = absolute_url(&req, &meta);
                    trace!(from = %req.url, to = %target, "following redirect");
                    req = Request::with_cancellation(&target, req.cancellation().clone())?;
                }
            }
        }
    }

    async fn roundtrip(&self, dialer: &mut Dialer, req: &Request) -> Result<Hop, ClientError> {
        let (mut host, mut port) = split_host_port(&req.host);
        if host.is_empty() {
            host = req.url.host_str().unwrap_or_default().to_string();
            port = req.url.port().map(|p| p.to_string()).unwrap_or_default();
        }
        if port.is_empty() {
            port = DEFAULT_PORT.to_string();
        }
        let addr = format!("{host}:{port}");

        dialer.prepare(&host, &addr)?;

        let cancel = req.cancellation().clone();
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            connected = bound(self.connect_timeout, dialer.connect(&host, &addr)) => match connected {
                Ok(done) => done?,
                Err(_) => return Err(ClientError::timed_out("connect")),
            },
        };

        let request_line = format!("{}\r\n", req.url);
        match bound(self.write_timeout, stream.write_all(request_line.as_bytes())).await {
            Ok(done) => done?,
            Err(_) => return Err(ClientError::timed_out("send request")),
        }

        let read = codec::read_header_line(&mut stream, MAX_RESPONSE_HEADER);
        let line = match bound(self.read_timeout, read).await {
            Ok(Ok(line)) => line,
            Ok(Err(LineError::Io { source })) => return Err(source.into()),
            Ok(Err(source)) => return Err(ClientError::Header { source }),
            Err(_) => return Err(ClientError::timed_out("read response header")),
        };

        // the status is required, the meta is optional
        let (status, meta) = match line.split_once(' ') {
            Some((status, meta)) => (status, meta),
            None => (line.as_str(), ""),
        };
        if status.is_empty() {
            return Err(ClientError::InvalidResponse);
        }

        // redirect responses carry no body, drop the connection
        if status.starts_with('3') {
            return Ok(Hop::Redirect(meta.to_string()));
        }

        let status_code = status.parse::<u8>().unwrap_or(0);
        let success = status.starts_with('2');
        let meta = meta.to_string();

        let tls = {
            let (_, conn) = stream.get_ref();
            TlsInfo::from_common(conn, None)
        };

        // only successful responses have a body; the stream moves into it
        let body = if success { Body::stream(stream) } else { Body::empty() };

        Ok(Hop::Response(Response {
            status: status_code,
            meta,
            url: req.url.clone(),
            body,
            tls: Some(tls),
        }))
    }
}

/// Per-call dial state: the TLS configuration, the verifier shared across
/// hops and the host the current certificate was selected for.
struct Dialer {
    verifier: Arc<TofuVerifier>,
    get_certificate: Option<GetCertificate>,
    connector: TlsConnector,
    last_host: Option<String>,
}

impl Dialer {
    fn new(hosts: Option<Arc<HostsFile>>, get_certificate: Option<GetCertificate>) -> Dialer {
        let verifier = Arc::new(TofuVerifier::new(hosts));
        let config = config_builder(&verifier).with_no_client_auth();
        Dialer {
            verifier,
            get_certificate,
            connector: TlsConnector::from(Arc::new(config)),
            last_host: None,
        }
    }

    /// Re-selects the client certificate when the hop host changed and
    /// points the TOFU verifier at the hop address.
    fn prepare(&mut self, host: &str, addr: &str) -> Result<(), ClientError> {
        if let Some(get_certificate) = &self.get_certificate {
            if self.last_host.as_deref() != Some(host) {
                let builder = config_builder(&self.verifier);
                let config = match get_certificate(host) {
                    Some(identity) => {
                        builder.with_client_auth_cert(identity.cert_chain, identity.key)?
                    }
                    None => builder.with_no_client_auth(),
                };
                self.connector = TlsConnector::from(Arc::new(config));
            }
        }

        self.last_host = Some(host.to_string());
        self.verifier.set_server_addr(addr);
        Ok(())
    }

    async fn connect(
        &self,
        host: &str,
        addr: &str,
    ) -> Result<TlsStream<TcpStream>, ClientError> {
        let server_name = match ServerName::try_from(host.to_string()) {
            Ok(name) => name,
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid server name").into());
            }
        };

        let tcp = TcpStream::connect(addr).await?;
        // the TOFU callback runs inside this handshake and aborts it on a
        // fingerprint mismatch
        let stream = self.connector.connect(server_name, tcp).await?;
        Ok(stream)
    }
}

fn config_builder(
    verifier: &Arc<TofuVerifier>,
) -> rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert> {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier.clone())
}

async fn bound<F: Future>(limit: Option<Duration>, fut: F) -> Result<F::Output, Elapsed> {
    match limit {
        Some(limit) => timeout(limit, fut).await,
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use std::io as stdio;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::cert::{self, Identity};
    use crate::handler::{redirect, Handler, ResponseWriter};
    use crate::protocol::status;
    use crate::testing::TestServer;

    struct Hello;

    #[async_trait]
    impl Handler for Hello {
        async fn serve(&self, w: &mut dyn ResponseWriter, _r: &Request) -> stdio::Result<()> {
            w.write_all(b"hello world").await
        }
    }

    #[tokio::test]
    async fn presents_the_client_certificate() {
        let identity = Identity::self_signed(&[], 1).unwrap();
        let expected = cert::fingerprint(identity.certificate()).unwrap();

        struct AssertPeer {
            fingerprint: String,
        }

        #[async_trait]
        impl Handler for AssertPeer {
            async fn serve(&self, w: &mut dyn ResponseWriter, r: &Request) -> stdio::Result<()> {
                let tls = r.tls.as_ref().expect("tls request");
                let peer = tls.peer_certificates.first().expect("peer certificate");
                assert_eq!(cert::fingerprint(peer).unwrap(), self.fingerprint);
                w.write_all(b"hello world").await
            }
        }

        let server = TestServer::start(AssertPeer { fingerprint: expected }).await;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .read_timeout(Duration::from_secs(1))
            .write_timeout(Duration::from_secs(1))
            .client_certificate(ClientIdentity::from(&identity))
            .build();

        let mut res = client.get(&server.url).await.unwrap();
        assert_eq!(res.status, status::OK);

        let mut body = Vec::new();
        res.body.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    struct RedirectOnce;

    #[async_trait]
    impl Handler for RedirectOnce {
        async fn serve(&self, w: &mut dyn ResponseWriter, r: &Request) -> stdio::Result<()> {
            if r.url.path() == "/index.gmi" {
                redirect(w, r, "/", status::PERMANENT_REDIRECT);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn follows_redirects() {
        let server = TestServer::start(RedirectOnce).await;
        let client = Client::builder().build();

        let res = client.get(&format!("{}/index.gmi", server.url)).await.unwrap();
        assert_eq!(res.url.to_string(), format!("{}/", server.url));
    }

    struct RedirectToParent;

    #[async_trait]
    impl Handler for RedirectToParent {
        async fn serve(&self, w: &mut dyn ResponseWriter, r: &Request) -> stdio::Result<()> {
            if r.url.path() != "/" {
                let path = r.url.path().to_string();
                let parent = &path[..path.rfind('/').unwrap_or(0)];
                redirect(w, r, parent, status::PERMANENT_REDIRECT);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn gives_up_after_five_redirects() {
        let server = TestServer::start(RedirectToParent).await;
        let client = Client::builder().build();

        match client.get(&format!("{}/a/b/c/d/e/f", server.url)).await {
            Err(ClientError::TooManyRedirects { last_url, next_url }) => {
                assert_eq!(last_url, format!("{}/a", server.url));
                assert_eq!(next_url, format!("{}/", server.url));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_non_gemini_schemes() {
        let client = Client::builder().build();
        assert!(matches!(
            client.get("https://example.com/").await,
            Err(ClientError::UnsupportedScheme)
        ));
    }

    #[tokio::test]
    async fn records_hosts_on_first_use() {
        let server = TestServer::start(Hello).await;
        let hosts = Arc::new(crate::tofu::HostsFile::new(stdio::sink()));
        let client = Client::builder().hosts_file(hosts.clone()).build();

        let res = client.get(&format!("{}/", server.url)).await.unwrap();
        assert_eq!(res.status, status::OK);

        let addr = server.url.strip_prefix("gemini://").unwrap();
        let pinned = hosts.host(addr).expect("host pinned after first contact");
        assert_eq!(pinned.fingerprint, cert::fingerprint(server.identity().certificate()).unwrap());
    }

    #[tokio::test]
    async fn refuses_a_changed_host_key() {
        let server = TestServer::start(Hello).await;
        let hosts = Arc::new(crate::tofu::HostsFile::new(stdio::sink()));

        // poison the pin with a different key that has not expired
        let other = Identity::self_signed(&["localhost"], 1).unwrap();
        let addr = server.url.strip_prefix("gemini://").unwrap();
        hosts.trust_certificate(other.certificate(), addr).unwrap();

        let client = Client::builder().hosts_file(hosts).build();
        let err = client.get(&format!("{}/", server.url)).await.unwrap_err();

        let chain = format!("{:?}", err);
        assert!(matches!(err, ClientError::Io { .. }), "tofu failure aborts the dial: {chain}");
    }

    struct Empty;

    #[async_trait]
    impl Handler for Empty {
        async fn serve(&self, _w: &mut dyn ResponseWriter, _r: &Request) -> stdio::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn silent_handlers_still_produce_a_header() {
        let server = TestServer::start(Empty).await;
        let client = Client::builder().build();

        let mut res = client.get(&format!("{}/", server.url)).await.unwrap();
        assert_eq!(res.status, status::OK);
        assert_eq!(res.meta, crate::protocol::GEMTEXT_MIME_TYPE);

        let mut body = Vec::new();
        res.body.read_to_end(&mut body).await.unwrap();
        assert!(body.is_empty());
    }
}
