//! Trust-On-First-Use host verification.
//!
//! [`HostsFile`] maintains the set of known hosts in an append-only
//! hostsfile and applies the TOFU algorithm to presented certificates: a
//! host's public key is pinned on first contact and verified by equality
//! afterwards; rotation requires the pinned certificate to have expired.
//!
//! The file is append-only but only the latest entry per address is kept in
//! memory. Older lines remain on disk for auditing.
//!
//! # File format
//!
//! One entry per line, four space-separated fields terminated by a newline:
//!
//! ```text
//! address algorithm fingerprint expiry
//! ```
//!
//! `address` is the `domain:port` of the remote host, `algorithm` names the
//! fingerprint hash, `fingerprint` is the hex encoded hash of the
//! certificate's Subject Public Key Info section and `expiry` is the
//! RFC 3339 expiration date of the certificate. Later entries shadow earlier
//! ones. Blank lines, lines starting with `#` and lines that do not conform
//! to the format are skipped.

use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, BufRead, BufReader, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use thiserror::Error;
use tokio_rustls::rustls::pki_types::CertificateDer;
use x509_parser::prelude::*;

use crate::cert::hex_sha256;
use crate::protocol::split_host_port;

const FINGERPRINT_ALGORITHM: &str = "sha256";

/// Errors from the TOFU verification algorithm.
#[derive(Debug, Error)]
pub enum TrustError {
    /// The presented certificate does not match the pinned fingerprint and
    /// the pinned certificate has not expired.
    #[error("certificate not trusted")]
    CertificateNotTrusted,

    /// The certificate is not valid for the host that presented it.
    #[error("certificate is not valid for {host}")]
    HostnameMismatch { host: String },

    /// The certificate could not be parsed.
    #[error("malformed certificate: {reason}")]
    InvalidCertificate { reason: String },

    /// The hostsfile writer failed.
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl TrustError {
    fn hostname_mismatch(host: impl Into<String>) -> TrustError {
        TrustError::HostnameMismatch { host: host.into() }
    }

    fn invalid_certificate(reason: impl ToString) -> TrustError {
        TrustError::InvalidCertificate { reason: reason.to_string() }
    }
}

/// An entry in a [`HostsFile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    /// `domain:port` of the remote host.
    pub addr: String,
    /// Algorithm used to compute the fingerprint.
    pub algorithm: String,
    /// Hash of the host certificate's public key.
    pub fingerprint: String,
    /// Expiry time of the certificate.
    pub not_after: DateTime<Utc>,
}

/// The set of known hosts, safe for concurrent use.
pub struct HostsFile {
    inner: RwLock<Inner>,
}

struct Inner {
    hosts: HashMap<String, HostEntry>,
    writer: Box<dyn Write + Send + Sync>,
}

impl fmt::Debug for HostsFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("HostsFile").field("hosts", &inner.hosts.len()).finish()
    }
}

impl HostsFile {
    /// Creates a hosts file that appends new entries to `writer`.
    pub fn new<W: Write + Send + Sync + 'static>(writer: W) -> HostsFile {
        HostsFile {
            inner: RwLock::new(Inner { hosts: HashMap::new(), writer: Box::new(writer) }),
        }
    }

    /// Opens a hostsfile on disk, creating it if missing, and loads its
    /// entries. New entries are appended to the same file.
    pub fn open(path: impl AsRef<Path>) -> io::Result<HostsFile> {
        let file = OpenOptions::new().read(true).append(true).create(true).open(path)?;
        let reader = file.try_clone()?;
        let hosts = HostsFile::new(file);
        hosts.read_from(BufReader::new(reader))?;
        Ok(hosts)
    }

    /// Returns the entry for the `domain:port` address.
    pub fn host(&self, addr: &str) -> Option<HostEntry> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).hosts.get(addr).cloned()
    }

    /// Installs the entry and appends it to the writer.
    ///
    /// Setting an entry identical to the stored one writes nothing. A write
    /// failure surfaces but the in-memory entry stays installed.
    pub fn set_host(&self, entry: HostEntry) -> io::Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if inner.hosts.get(&entry.addr) == Some(&entry) {
            return Ok(());
        }

        let line = format!(
            "{} {} {} {}\n",
            entry.addr,
            entry.algorithm,
            entry.fingerprint,
            entry.not_after.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        inner.hosts.insert(entry.addr.clone(), entry);

        inner.writer.write_all(line.as_bytes())?;
        inner.writer.flush()
    }

    /// Applies the Trust On First Use algorithm to the certificate presented
    /// by `addr`.
    ///
    /// Unknown hosts are pinned after hostname verification. A fingerprint
    /// mismatch against an unexpired pinned entry fails with
    /// [`TrustError::CertificateNotTrusted`]; once the pinned entry has
    /// expired the new certificate may take its place.
    pub fn trust_certificate(
        &self,
        cert: &CertificateDer<'_>,
        addr: &str,
    ) -> Result<(), TrustError> {
        let (_, parsed) =
            X509Certificate::from_der(cert).map_err(TrustError::invalid_certificate)?;

        let fingerprint = hex_sha256(parsed.tbs_certificate.subject_pki.raw);
        let not_after = match Utc.timestamp_opt(parsed.validity().not_after.timestamp(), 0) {
            chrono::LocalResult::Single(t) => t,
            _ => return Err(TrustError::invalid_certificate("unrepresentable expiry")),
        };

        if let Some(pinned) = self.host(addr) {
            if pinned.algorithm != FINGERPRINT_ALGORITHM || pinned.fingerprint != fingerprint {
                if Utc::now() <= pinned.not_after {
                    return Err(TrustError::CertificateNotTrusted);
                }
                // pinned certificate expired, renew below
            } else if pinned.not_after == not_after {
                return Ok(());
            }
        }

        let (host, _) = split_host_port(addr);
        verify_hostname(&parsed, &host)?;

        self.set_host(HostEntry {
            addr: addr.to_string(),
            algorithm: FINGERPRINT_ALGORITHM.to_string(),
            fingerprint,
            not_after,
        })?;
        Ok(())
    }

    /// Parses hostsfile entries from `reader` into memory. Later entries
    /// overwrite earlier ones.
    pub fn read_from(&self, reader: impl BufRead) -> io::Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        for line in reader.lines() {
            let line = line?;
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 4 {
                continue;
            }
            let Ok(not_after) = DateTime::parse_from_rfc3339(fields[3]) else {
                continue;
            };

            let entry = HostEntry {
                addr: fields[0].to_string(),
                algorithm: fields[1].to_string(),
                fingerprint: fields[2].to_string(),
                not_after: not_after.with_timezone(&Utc),
            };
            inner.hosts.insert(entry.addr.clone(), entry);
        }

        Ok(())
    }
}

/// Verifies that the certificate is valid for `hostname`, also accepting the
/// legacy subject common name when it is not among the SAN entries.
fn verify_hostname(cert: &X509Certificate<'_>, hostname: &str) -> Result<(), TrustError> {
    let mut dns_names: Vec<String> = Vec::new();
    let mut ip_sans: Vec<IpAddr> = Vec::new();

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(name) => dns_names.push((*name).to_string()),
                GeneralName::IPAddress(bytes) => match bytes.len() {
                    4 => {
                        let mut octets = [0u8; 4];
                        octets.copy_from_slice(bytes);
                        ip_sans.push(IpAddr::from(octets));
                    }
                    16 => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(bytes);
                        ip_sans.push(IpAddr::from(octets));
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }

    if let Some(cn) = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
    {
        if !dns_names.iter().any(|name| name == cn) {
            dns_names.push(cn.to_string());
        }
    }

    if let Ok(ip) = hostname.parse::<IpAddr>() {
        if ip_sans.contains(&ip) {
            return Ok(());
        }
        return Err(TrustError::hostname_mismatch(hostname));
    }

    let candidate = hostname.trim_end_matches('.').to_ascii_lowercase();
    if dns_names.iter().any(|pattern| match_hostname(pattern, &candidate)) {
        return Ok(());
    }
    Err(TrustError::hostname_mismatch(hostname))
}

// X.509 name matching: labels compare case-insensitively, a `*` in the
// leftmost label matches exactly one label.
fn match_hostname(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    if pattern.is_empty() {
        return false;
    }

    let pattern_labels: Vec<&str> = pattern.split('.').collect();
    let host_labels: Vec<&str> = host.split('.').collect();
    if pattern_labels.len() != host_labels.len() {
        return false;
    }

    for (i, (p, h)) in pattern_labels.iter().zip(host_labels.iter()).enumerate() {
        if i == 0 && *p == "*" {
            if h.is_empty() {
                return false;
            }
            continue;
        }
        if p != h {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::TimeZone;
    use indoc::indoc;

    use super::*;
    use crate::cert::Identity;

    /// Shared in-memory writer so tests can inspect appended lines.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn entry(addr: &str, fingerprint: &str) -> HostEntry {
        HostEntry {
            addr: addr.to_string(),
            algorithm: "sha256".to_string(),
            fingerprint: fingerprint.to_string(),
            not_after: Utc.with_ymd_and_hms(2050, 12, 31, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn set_host_appends_only_changes() {
        let buf = SharedBuf::default();
        let hosts = HostsFile::new(buf.clone());

        hosts.set_host(entry("localhost:1965", "1")).unwrap();
        hosts.set_host(entry("localhost:1965", "1")).unwrap();
        hosts.set_host(entry("localhost:1965", "11")).unwrap();

        let written = String::from_utf8(buf.contents()).unwrap();
        assert_eq!(
            written,
            "localhost:1965 sha256 1 2050-12-31T00:00:00Z\n\
             localhost:1965 sha256 11 2050-12-31T00:00:00Z\n"
        );
        assert_eq!(hosts.host("localhost:1965").unwrap().fingerprint, "11");
    }

    #[test]
    fn persisted_bytes_reconstruct_the_store() {
        let buf = SharedBuf::default();
        let hosts = HostsFile::new(buf.clone());

        hosts.set_host(entry("a:1965", "f1")).unwrap();
        hosts.set_host(entry("b:1965", "f2")).unwrap();
        hosts.set_host(entry("a:1965", "f3")).unwrap();

        let replayed = HostsFile::new(io::sink());
        replayed.read_from(buf.contents().as_slice()).unwrap();

        assert_eq!(replayed.host("a:1965"), hosts.host("a:1965"));
        assert_eq!(replayed.host("b:1965"), hosts.host("b:1965"));
        assert_eq!(replayed.host("a:1965").unwrap().fingerprint, "f3");
    }

    #[test]
    fn read_from_skips_comments_and_garbage() {
        let hosts = HostsFile::new(io::sink());
        let input = indoc! {"
            # comment
            localhost sha256 abcdef 2050-12-31T00:00:00Z

            short line
            bad sha256 fp not-a-timestamp
            localhost sha256 fedcba 2051-01-01T00:00:00Z
        "};
        hosts.read_from(input.as_bytes()).unwrap();

        let host = hosts.host("localhost").unwrap();
        assert_eq!(host.fingerprint, "fedcba");
        assert_eq!(host.not_after, Utc.with_ymd_and_hms(2051, 1, 1, 0, 0, 0).unwrap());
        assert!(hosts.host("short").is_none());
        assert!(hosts.host("bad").is_none());
    }

    #[test]
    fn tofu_pins_verifies_and_renews() {
        let hosts = HostsFile::new(io::sink());

        // first contact pins the certificate
        let first = Identity::self_signed(&["localhost"], 1).unwrap();
        assert!(hosts.host("localhost").is_none());
        hosts.trust_certificate(first.certificate(), "localhost").unwrap();
        assert!(hosts.host("localhost").is_some());

        // the same certificate stays trusted
        hosts.trust_certificate(first.certificate(), "localhost").unwrap();

        // a different key is rejected while the pin is fresh
        let imposter = Identity::self_signed_with_cn("localhost", &[], 1).unwrap();
        assert!(matches!(
            hosts.trust_certificate(imposter.certificate(), "localhost"),
            Err(TrustError::CertificateNotTrusted)
        ));
    }

    #[test]
    fn tofu_renews_after_expiry() {
        let hosts = HostsFile::new(io::sink());

        let expired = Identity::self_signed_with_cn("localhost", &[], -1).unwrap();
        hosts.trust_certificate(expired.certificate(), "localhost").unwrap();

        let replacement = Identity::self_signed_with_cn("localhost", &[], 1).unwrap();
        hosts.trust_certificate(replacement.certificate(), "localhost").unwrap();

        let pinned = hosts.host("localhost").unwrap();
        assert_eq!(pinned.fingerprint, crate::cert::fingerprint(replacement.certificate()).unwrap());
    }

    #[test]
    fn tofu_rejects_wrong_hostnames() {
        let hosts = HostsFile::new(io::sink());
        let cert = Identity::self_signed(&["example.com"], 1).unwrap();
        assert!(matches!(
            hosts.trust_certificate(cert.certificate(), "localhost"),
            Err(TrustError::HostnameMismatch { .. })
        ));
    }

    #[test]
    fn open_loads_and_appends() {
        let dir = std::env::temp_dir().join(format!("gemnet-tofu-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hosts");

        {
            let hosts = HostsFile::open(&path).unwrap();
            hosts.set_host(entry("a:1965", "f1")).unwrap();
        }
        {
            let hosts = HostsFile::open(&path).unwrap();
            assert_eq!(hosts.host("a:1965").unwrap().fingerprint, "f1");
            hosts.set_host(entry("a:1965", "f2")).unwrap();
        }
        {
            let hosts = HostsFile::open(&path).unwrap();
            assert_eq!(hosts.host("a:1965").unwrap().fingerprint, "f2");
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn hostname_matching() {
        assert!(match_hostname("localhost", "localhost"));
        assert!(match_hostname("LOCALHOST", "localhost"));
        assert!(match_hostname("*.example.com", "gem.example.com"));
        assert!(!match_hostname("*.example.com", "example.com"));
        assert!(!match_hostname("*.example.com", "a.b.example.com"));
        assert!(!match_hostname("other.com", "example.com"));
        assert!(!match_hostname("", "example.com"));
    }
}
