//! URL normalization: path cleaning, host/port splitting and resolution of
//! redirect targets against the request URL.

use url::Url;

use crate::protocol::Request;

/// Returns the canonical form of a request path: rooted, lexically cleaned,
/// with a trailing slash preserved. Idempotent.
pub fn clean_path(p: &str) -> String {
    if p.is_empty() {
        return "/".to_string();
    }

    let rooted = if p.starts_with('/') {
        p.to_string()
    } else {
        format!("/{p}")
    };

    let mut np = path_clean(&rooted);
    if p.ends_with('/') && np != "/" {
        np.push('/');
    }
    np
}

/// Splits `host:port`, returning an empty port when there is none. Malformed
/// addresses fall back to `(addr, "")` rather than erroring.
pub fn split_host_port(addr: &str) -> (String, String) {
    if !addr.contains(':') {
        return (addr.to_string(), String::new());
    }

    // bracketed ipv6: [host]:port
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            if let Some(port) = tail.strip_prefix(':') {
                if !port.contains(':') {
                    return (host.to_string(), port.to_string());
                }
            }
        }
        return (addr.to_string(), String::new());
    }

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host.to_string(), port.to_string()),
        _ => (addr.to_string(), String::new()),
    }
}

/// Makes a redirect target absolute by combining it with the request URL.
///
/// Targets that already carry a scheme or an authority pass through
/// unchanged. Relative paths resolve against the directory of the request
/// path, preserving a trailing slash on the target.
pub fn absolute_url(r: &Request, target: &str) -> String {
    if target.starts_with("//") {
        return target.to_string();
    }
    if Url::parse(target).is_ok() {
        return target.to_string();
    }

    let (path_ref, suffix) = match target.find(['?', '#']) {
        Some(i) => (&target[..i], &target[i..]),
        None => (target, ""),
    };

    let path = if path_ref.starts_with('/') {
        path_ref.to_string()
    } else {
        let trailing = path_ref.ends_with('/');

        let oldpath = match r.url.path() {
            "" => "/",
            p => p,
        };
        let dir = match oldpath.rfind('/') {
            Some(i) => &oldpath[..=i],
            None => "",
        };

        let mut path = path_clean(&format!("{dir}{path_ref}"));
        if trailing && !path.ends_with('/') {
            path.push('/');
        }
        path
    };

    format!("{}://{}{}{}", r.url.scheme(), authority(&r.url), path, suffix)
}

/// `host` or `host:port` of the URL; empty when the URL has no host.
pub(crate) fn authority(u: &Url) -> String {
    let host = u.host_str().unwrap_or("");
    match u.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Lexical path cleaning: collapses `.`, `..` and repeated slashes without
/// touching the filesystem.
pub(crate) fn path_clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let rooted = path.starts_with('/');
    let bytes = path.as_bytes();
    let n = bytes.len();

    let mut out = String::with_capacity(n);
    let mut r = 0;
    // output length below which ".." may not backtrack
    let mut dotdot = 0;

    if rooted {
        out.push('/');
        r = 1;
        dotdot = 1;
    }

    while r < n {
        if bytes[r] == b'/' {
            r += 1;
        } else if bytes[r] == b'.' && (r + 1 == n || bytes[r + 1] == b'/') {
            r += 1;
        } else if bytes[r] == b'.' && bytes[r + 1] == b'.' && (r + 2 == n || bytes[r + 2] == b'/') {
            r += 2;
            if out.len() > dotdot {
                let mut w = out.len() - 1;
                while w > dotdot && out.as_bytes()[w] != b'/' {
                    w -= 1;
                }
                out.truncate(w);
            } else if !rooted {
                if !out.is_empty() {
                    out.push('/');
                }
                out.push_str("..");
                dotdot = out.len();
            }
        } else {
            if (rooted && out.len() != 1) || (!rooted && !out.is_empty()) {
                out.push('/');
            }
            let start = r;
            while r < n && bytes[r] != b'/' {
                r += 1;
            }
            out.push_str(&path[start..r]);
        }
    }

    if out.is_empty() {
        return ".".to_string();
    }
    out
}
