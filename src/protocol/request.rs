//! Gemini requests and the TLS snapshot they carry.

use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::rustls::{CommonState, ProtocolVersion};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::protocol::url::authority;

/// Details of the TLS connection a request or response travelled over.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    /// Server Name Indication presented by the client, when known.
    pub server_name: Option<String>,
    /// Negotiated protocol version.
    pub protocol_version: Option<ProtocolVersion>,
    /// Peer certificate chain, leaf first. Empty when the peer presented
    /// no certificate.
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

impl TlsInfo {
    pub(crate) fn from_common(state: &CommonState, server_name: Option<&str>) -> TlsInfo {
        TlsInfo {
            server_name: server_name.map(str::to_string),
            protocol_version: state.protocol_version(),
            peer_certificates: state.peer_certificates().map(<[_]>::to_vec).unwrap_or_default(),
        }
    }
}

/// A request received by the server or prepared for a client.
#[derive(Debug, Clone)]
pub struct Request {
    /// URL requested by the client.
    pub url: Url,
    /// Raw request line as received. Set by the server.
    pub request_uri: String,
    /// Remote address of the peer. Set by the server.
    pub remote_addr: String,
    /// Server Name Indication passed by the client. The server fills it in
    /// from the handshake; client requests default it to the URL authority.
    pub host: String,
    /// TLS connection details, when the request travelled over TLS.
    pub tls: Option<TlsInfo>,
    cancel: CancellationToken,
}

impl Request {
    /// Creates a request for the given URL. A missing scheme defaults to
    /// `gemini`.
    pub fn new(raw_url: &str) -> Result<Request, url::ParseError> {
        Request::with_cancellation(raw_url, CancellationToken::new())
    }

    /// Creates a request that observes the given cancellation token.
    pub fn with_cancellation(
        raw_url: &str,
        cancel: CancellationToken,
    ) -> Result<Request, url::ParseError> {
        let url = match Url::parse(raw_url) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                Url::parse(&format!("gemini://{raw_url}"))?
            }
            Err(err) => return Err(err),
        };

        Ok(Request {
            host: authority(&url),
            url,
            request_uri: String::new(),
            remote_addr: String::new(),
            tls: None,
            cancel,
        })
    }

    pub(crate) fn from_server(
        url: Url,
        request_uri: String,
        remote_addr: String,
        host: String,
        tls: Option<TlsInfo>,
        cancel: CancellationToken,
    ) -> Request {
        Request { url, request_uri, remote_addr, host, tls, cancel }
    }

    /// Token that fires when the request should be abandoned.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the unescaped query string, or `None` when there is no query
    /// or it does not decode to UTF-8.
    pub fn input(&self) -> Option<String> {
        let raw = self.url.query().unwrap_or("");
        if raw.is_empty() {
            return None;
        }

        let spaced = raw.replace('+', " ");
        percent_encoding::percent_decode_str(&spaced)
            .decode_utf8()
            .ok()
            .map(|decoded| decoded.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_the_scheme_to_gemini() {
        let r = Request::new("/index.gmi").unwrap();
        assert_eq!(r.url.scheme(), "gemini");
        assert_eq!(r.url.path(), "/index.gmi");

        let r = Request::new("gemini://example.com/index.gmi").unwrap();
        assert_eq!(r.host, "example.com");
    }

    #[test]
    fn host_includes_the_port() {
        let r = Request::new("gemini://example.com:1966/").unwrap();
        assert_eq!(r.host, "example.com:1966");
    }

    #[test]
    fn input_unescapes_the_query() {
        assert_eq!(Request::new("gemini://h/x").unwrap().input(), None);
        assert_eq!(
            Request::new("gemini://h/x?teh%20gopher").unwrap().input().as_deref(),
            Some("teh gopher")
        );
        assert_eq!(
            Request::new("gemini://h/x?a+b").unwrap().input().as_deref(),
            Some("a b")
        );
        // invalid escapes pass through verbatim
        assert_eq!(Request::new("gemini://h/x?%zz").unwrap().input().as_deref(), Some("%zz"));
    }
}
