//! Functions that manipulate or return paths.
//!
//! The pure helpers operate on byte strings; [`server_root`] and
//! [`page_root`] add virtual-host resolution on top of them.

use crate::conn::Conn;
use crate::server::Server;
use camino::Utf8PathBuf;

fn is_slash(in_url: bool, c: u8) -> bool {
    if in_url {
        c == b'/'
    } else {
        c == b'/' || c == b'\\'
    }
}

/// Is the path absolute?
pub fn is_absolute(path: &str) -> bool {
    matches!(path.as_bytes().first(), Some(b'/') | Some(b'\\'))
}

/// Removes `..`, `.`, and repeated separators from a filesystem path.
/// Backslashes are treated as separators so Windows-style input normalizes
/// predictably.
pub fn normalize_path(dest: &mut String, path: &str) {
    normalize(dest, path, false)
}

/// Removes `..`, `.`, and repeated slashes from a URL path.
pub fn normalize_url(dest: &mut String, path: &str) {
    normalize(dest, path, true)
}

/// Convenience wrapper returning a fresh normalized URL.
pub fn normalized_url(path: &str) -> String {
    let mut dest = String::new();
    normalize_url(&mut dest, path);
    dest
}

fn normalize(dest: &mut String, path: &str, url: bool) {
    let bytes = path.as_bytes();
    let mut i = 0;

    // Move past leading separator(s).
    while i < bytes.len() && is_slash(url, bytes[i]) {
        i += 1;
    }

    let base = dest.len();
    loop {
        let start = i;
        while i < bytes.len() && !is_slash(url, bytes[i]) {
            i += 1;
        }
        let part = &path[start..i];
        let at_end = i >= bytes.len();
        if !at_end {
            i += 1;
        }

        if part == ".." {
            // Wipe out one path segment backwards.
            if let Some(slash) = dest[base..].rfind('/') {
                dest.truncate(base + slash);
            }
        } else if !part.is_empty() && part != "." {
            dest.push('/');
            dest.push_str(part);
        }

        if at_end {
            break;
        }
    }

    if dest[base..].is_empty() {
        dest.push('/');
    }
}

/// Appends path elements, inserting a `/` before each component and
/// collapsing separators inside every element.
pub fn make_path<'a>(dest: &mut String, segments: impl IntoIterator<Item = &'a str>) {
    for segment in segments {
        let bytes = segment.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            while i < bytes.len() && is_slash(false, bytes[i]) {
                i += 1;
            }
            if i < bytes.len() {
                dest.push('/');
                let start = i;
                while i < bytes.len() && !is_slash(false, bytes[i]) {
                    i += 1;
                }
                dest.push_str(&segment[start..i]);
            }
        }
    }
}

/// Joins the elements into a fresh path string.
pub fn join_path<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    let mut dest = String::new();
    make_path(&mut dest, segments);
    dest
}

/// Hashes the leading characters of `path` into a directory layout,
/// skipping periods and slashes and padding with `_`:
///
/// ```text
/// foo, 2 -> /f/o
/// foo, 3 -> /f/o/o
/// foo, 4 -> /f/o/o/_
/// ```
pub fn hash_path(dest: &mut String, path: &str, levels: usize) {
    let mut chars = path
        .chars()
        .filter(|&c| c != '.' && c != '/' && c != '\\');

    for _ in 0..levels {
        dest.push('/');
        match chars.next() {
            Some(c) => dest.push(c),
            None => dest.push('_'),
        }
    }
}

/// Conservative validity check for a raw `Host` header before it is used to
/// build filesystem paths. Letters, digits, `-`, `.`, `_`, `:` and IPv6
/// brackets are allowed.
pub fn is_valid_host_header(host: &str) -> bool {
    !host.is_empty()
        && host.bytes().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, b'-' | b'.' | b'_' | b':' | b'[' | b']')
        })
}

/// Computes the server root directory.
///
/// A registered root hook wins and its result is cached on the connection.
/// Otherwise, with virtual hosting enabled and a usable host, the host is
/// normalized (lowercased, `www.`/port stripped per configuration,
/// optionally hashed) and appended below the configured server directory.
/// Everything else falls back to the static server directory.
pub fn server_root(
    server: &Server,
    raw_host: Option<&str>,
    mut conn: Option<&mut Conn>,
) -> Utf8PathBuf {
    if let Some(proc) = server.vhost.root_proc.as_ref() {
        if let Some(cached) = conn
            .as_ref()
            .and_then(|c| c.request.server_root.as_deref())
        {
            return Utf8PathBuf::from(cached);
        }

        // The hook receives the raw host header as-is.
        let hook_host = raw_host
            .map(str::to_string)
            .or_else(|| conn.as_ref().and_then(|c| c.headers.iget("host").map(str::to_string)));

        if let Some(path) = proc(hook_host.as_deref()) {
            let resolved = if is_absolute(&path) {
                path
            } else {
                let mut dest = String::new();
                make_path(&mut dest, [server.serverdir.as_str(), path.as_str()]);
                dest
            };
            if let Some(conn) = conn.as_mut() {
                conn.request.server_root = Some(resolved.clone());
            }
            return Utf8PathBuf::from(resolved);
        }
    } else if server.vhost.enabled {
        let header_host = conn
            .as_ref()
            .and_then(|c| c.headers.iget("host").map(str::to_string));
        let host = raw_host.map(str::to_string).or(header_host);

        if let Some(host) = host.filter(|h| !h.is_empty()) {
            if is_valid_host_header(&host) {
                let mut safehost = host.to_ascii_lowercase();
                if server.vhost.strip_www {
                    if let Some(stripped) = safehost.strip_prefix("www.") {
                        safehost = stripped.to_string();
                    }
                }
                if server.vhost.strip_port {
                    if let Some(colon) = safehost.rfind(':') {
                        safehost.truncate(colon);
                    }
                }

                let mut dest = String::new();
                let prefix = server.vhost.host_prefix.as_deref().unwrap_or("");
                make_path(&mut dest, [server.serverdir.as_str(), prefix]);
                if server.vhost.host_hash_level > 0 {
                    hash_path(&mut dest, &safehost, server.vhost.host_hash_level);
                }
                normalize_path(&mut dest, &safehost);
                return Utf8PathBuf::from(dest);
            }
        }
    }

    Utf8PathBuf::from(join_path([server.serverdir.as_str()]))
}

/// Returns the path to the server pages directory. An absolute page
/// directory short-circuits virtual-host resolution.
pub fn page_root(server: &Server, raw_host: Option<&str>, conn: Option<&mut Conn>) -> Utf8PathBuf {
    if is_absolute(server.pagedir.as_str()) {
        return server.pagedir.clone();
    }
    let mut dest = server_root(server, raw_host, conn).into_string();
    make_path(&mut dest, [server.pagedir.as_str()]);
    Utf8PathBuf::from(dest)
}
