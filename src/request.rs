//! Parsing of HTTP request lines and header lines.

use crate::error::Error;
use crate::set::Set;
use percent_encoding::percent_decode_str;
use std::cell::OnceCell;
use std::collections::BTreeMap;

/// How the request-target was shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestType {
    #[default]
    Plain,
    Proxy,
    Connect,
}

/// A parsed request line. Immutable after parsing except through
/// [`Request::set_url`] (internal redirects).
#[derive(Debug, Default)]
pub struct Request {
    /// The raw request line with surrounding whitespace trimmed, kept for
    /// logging.
    pub line: String,
    pub method: String,
    /// Scheme of a proxy request-target, absent otherwise.
    pub protocol: Option<String>,
    /// Host of a proxy or CONNECT target, absent otherwise.
    pub host: Option<String>,
    pub port: u16,
    /// `HTTP/x.y` as a float; `0.0` means HTTP/0.9.
    pub version: f64,
    /// Normalized decoded path. Always starts with `/`, never contains `.`
    /// or `..` segments.
    pub url: String,
    /// Decoded path segments of `url`.
    pub urlv: Vec<String>,
    /// Raw query string without the `?`; never empty.
    pub query: Option<String>,
    pub request_type: RequestType,
    /// Cached vhost root, filled lazily by the path resolver.
    pub(crate) server_root: Option<String>,
    query_map: OnceCell<BTreeMap<String, String>>,
}

const HTTP_PREFIX: &str = "HTTP/";

impl Request {
    /// Parses one request line (without the terminating newline).
    pub fn parse(line: &str) -> Result<Request, Error> {
        let bytes = line.as_bytes();

        // A TLS ClientHello is binary garbage to us; refuse it up front
        // rather than logging it.
        if bytes.len() >= 3 && bytes[0] == 0x16 && bytes[1] >= 3 && bytes[2] == 1 {
            return Err(Error::LooksLikeTls);
        }

        if !line.is_ascii() {
            log::warn!(
                "request line {line:?} contains 8-bit character data; \
                 future versions might reject it"
            );
        }

        debug_assert!(!line.contains('\n'));

        let trimmed = line.trim();
        let base = line.len() - line.trim_start().len();
        let fail = |offset: usize, reason: &'static str| {
            log::warn!("cannot parse request line {line:?}: {reason}");
            Err(Error::MalformedRequest {
                offset: base + offset,
                reason,
            })
        };

        if trimmed.is_empty() {
            return fail(0, "empty request line");
        }

        let mut request = Request {
            line: trimmed.to_string(),
            ..Request::default()
        };

        // First token is the method.
        let Some(method_end) = trimmed.find(|c: char| c.is_ascii_whitespace()) else {
            return fail(trimmed.len(), "no method found");
        };
        request.method = trimmed[..method_end].to_string();

        let after_method = trimmed[method_end..].trim_start();
        if after_method.is_empty() {
            return fail(trimmed.len(), "no version information found");
        }
        let target_offset = trimmed.len() - after_method.len();

        // The version token, if any, is everything after the last space.
        let mut target = after_method;
        request.version = 0.0;
        match after_method.rfind(' ') {
            Some(last_space) => {
                let token = &after_method[last_space + 1..];
                if let Some(version) = token.strip_prefix(HTTP_PREFIX) {
                    // A failed number parse leaves 0.0 and the connection is
                    // treated as if it carried no HTTP/n.n keyword.
                    request.version = parse_version_number(version);
                    target = &after_method[..last_space];
                } else {
                    return fail(target_offset + last_space + 1, "version information invalid");
                }
            }
            None => {
                // HTTP/0.9 never had proxy functionality.
                if !after_method.starts_with('/') {
                    return fail(target_offset, "HTTP 0.9 URL does not start with a slash");
                }
            }
        }

        let target = target.trim_end();
        if target.is_empty() {
            return fail(target_offset, "URL is empty");
        }

        let mut url_part = target;
        if !target.starts_with('/') {
            // RFC 3986 allows more scheme characters, but every protocol we
            // proxy uses plain letters; this keeps "CONNECT host:443" cases
            // unambiguous.
            let alpha_run = target
                .bytes()
                .take_while(|b| b.is_ascii_alphabetic())
                .count();

            let rest;
            if target.as_bytes().get(alpha_run) == Some(&b':') {
                request.request_type = RequestType::Proxy;
                request.protocol = Some(target[..alpha_run].to_string());
                let mut p = &target[alpha_run + 1..];
                if let Some(stripped) = p.strip_prefix("//") {
                    p = stripped;
                }
                rest = p;
            } else {
                request.request_type = RequestType::Connect;
                rest = target;
            }

            if rest.is_empty() || rest.starts_with('/') {
                url_part = rest;
            } else {
                let (hostport, path) = match rest.find('/') {
                    Some(slash) => (&rest[..slash], &rest[slash..]),
                    None => (rest, ""),
                };
                url_part = path;

                match parse_host_port(hostport) {
                    Some((host, port)) => {
                        request.host = Some(host.to_string());
                        request.port = port;
                    }
                    None => {
                        return fail(target_offset, "invalid host in request target");
                    }
                }
            }

            match request.request_type {
                RequestType::Proxy if url_part.is_empty() => {
                    return fail(target_offset, "invalid proxy request, path must not be empty");
                }
                RequestType::Connect if !url_part.is_empty() => {
                    return fail(target_offset, "invalid CONNECT request, path must be empty");
                }
                _ => {}
            }
        }

        request.assign_url(url_part);
        Ok(request)
    }

    /// Number of path segments.
    pub fn urlc(&self) -> usize {
        self.urlv.len()
    }

    /// Rewrites the URL in place, e.g. for an internal redirect. A `?` in
    /// the new URL replaces the query; otherwise the old query is kept.
    pub fn set_url(&mut self, url: &str) {
        self.assign_url(url);
    }

    fn assign_url(&mut self, url: &str) {
        let path = match url.find('?') {
            Some(q) => {
                let query = &url[q + 1..];
                self.query = if query.is_empty() {
                    None
                } else {
                    Some(query.to_string())
                };
                &url[..q]
            }
            None => url,
        };
        self.query_map = OnceCell::new();

        if path.is_empty() {
            // CONNECT targets carry no path at all.
            self.url = String::new();
            self.urlv = Vec::new();
            return;
        }

        let decoded = url_path_decode(path);
        let mut normalized = String::new();
        crate::pathname::normalize_url(&mut normalized, &decoded);

        // Preserve a trailing slash when the original path ended in one that
        // was not also the leading slash, and segments remain.
        let stripped = decoded.trim_start_matches('/');
        if !stripped.is_empty() && stripped.ends_with('/') && normalized != "/" {
            normalized.push('/');
        }

        self.urlv = normalized
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self.url = normalized;
    }

    /// Returns the value of `key` from the parsed query string.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        let map = self.query_map.get_or_init(|| {
            let mut map = BTreeMap::new();
            if let Some(raw) = self.query.as_deref() {
                for (k, v) in form_urlencoded::parse(raw.as_bytes()) {
                    map.insert(k.to_string(), v.to_string());
                }
            }
            map
        });
        map.get(key).map(String::as_str)
    }
}

/// `strtod`-style version parse: consume leading digits with at most one
/// decimal point, ignore the rest, `0.0` on no digits.
fn parse_version_number(s: &str) -> f64 {
    let mut end = 0;
    let mut seen_dot = false;
    for c in s.chars() {
        match c {
            '0'..='9' => end += 1,
            '.' if !seen_dot => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }
    s[..end].parse().unwrap_or(0.0)
}

/// Splits `host[:port]`, tolerating the IPv6 bracket form. The returned
/// host has brackets removed. A missing or unparsable port yields 0.
fn parse_host_port(hostport: &str) -> Option<(&str, u16)> {
    if hostport.is_empty() {
        return None;
    }

    if let Some(rest) = hostport.strip_prefix('[') {
        let close = rest.find(']')?;
        let host = &rest[..close];
        if host.is_empty() {
            return None;
        }
        let port = match &rest[close + 1..] {
            "" => 0,
            p => p.strip_prefix(':')?.parse().ok()?,
        };
        return Some((host, port));
    }

    match hostport.rfind(':') {
        Some(colon) => {
            let host = &hostport[..colon];
            if host.is_empty() || host.contains(':') {
                return None;
            }
            let port = hostport[colon + 1..].parse().ok()?;
            Some((host, port))
        }
        None => Some((hostport, 0)),
    }
}

/// Percent-decodes a URL path. Input that does not decode to valid UTF-8 is
/// used as-is.
fn url_path_decode(path: &str) -> String {
    match percent_decode_str(path).decode_utf8() {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => path.to_string(),
    }
}

/// What to do with header field names as they are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderCase {
    #[default]
    Preserve,
    ToLower,
    ToUpper,
}

/// Consumes one header line, handling continuation lines, placing results
/// in `set`. Returns the index of the touched field.
pub fn parse_header(
    set: &mut Set,
    line: &str,
    prefix: Option<&str>,
    disp: HeaderCase,
) -> Result<usize, Error> {
    if line.starts_with([' ', '\t']) {
        // Continuation of the previous field's value.
        let Some(idx) = set.last() else {
            return Err(Error::MalformedHeader);
        };
        let continued = line.trim_start_matches([' ', '\t']);
        if !continued.is_empty() {
            let mut value = set.value(idx).unwrap_or_default().to_string();
            value.push(' ');
            value.push_str(continued);
            set.set_value(idx, value);
        }
        return Ok(idx);
    }

    let Some(colon) = line.find(':') else {
        return Err(Error::MalformedHeader);
    };

    let mut key = match prefix {
        Some(prefix) => format!("{prefix}{}", &line[..colon]),
        None => line[..colon].to_string(),
    };
    match disp {
        HeaderCase::ToLower => key.make_ascii_lowercase(),
        HeaderCase::ToUpper => key.make_ascii_uppercase(),
        HeaderCase::Preserve => {}
    }

    let value = line[colon + 1..].trim_start_matches([' ', '\t']);
    Ok(set.put(key, value))
}
