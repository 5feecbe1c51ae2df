//! Routines to manipulate HTTP cookie headers.

use crate::conn::Conn;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Cookie attribute flags.
pub type CookieFlags = u32;

pub const COOKIE_SECURE: CookieFlags = 0x01;
/// Omit `HttpOnly` so client-side scripts may read the cookie.
pub const COOKIE_SCRIPTABLE: CookieFlags = 0x02;
pub const COOKIE_DISCARD: CookieFlags = 0x04;
/// Drop matching outbound `set-cookie` fields before adding this one.
pub const COOKIE_REPLACE: CookieFlags = 0x08;
/// Expire the cookie immediately.
pub const COOKIE_EXPIRENOW: CookieFlags = 0x10;
pub const COOKIE_SAMESITE_STRICT: CookieFlags = 0x20;
pub const COOKIE_SAMESITE_LAX: CookieFlags = 0x40;
pub const COOKIE_SAMESITE_NONE: CookieFlags = 0x80;

/// `maxage` value meaning "never expires".
pub const COOKIE_MAXAGE_FOREVER: i64 = i64::MAX;

// Everything outside the unreserved set is escaped in cookie values.
const COOKIE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const EXPIRES_NOW: &str = "Fri, 01-Jan-1980 01:00:00 GMT";
const EXPIRES_NEVER: &str = "Fri, 01-Jan-2035 01:00:00 GMT";

/// Emits a `set-cookie` header for the connection.
///
/// Attributes appear in a fixed order: expiry, `Domain`, `Path`, `Secure`,
/// `Discard`, `HttpOnly`, `SameSite`. Requesting `SameSite=None` without
/// `Secure` falls back to `Lax` with a warning.
pub fn set_cookie(
    conn: &mut Conn,
    name: &str,
    value: Option<&str>,
    maxage: i64,
    domain: Option<&str>,
    path: Option<&str>,
    mut flags: CookieFlags,
) {
    if flags & COOKIE_REPLACE != 0 {
        delete_named_set_cookies(conn, name);
    }

    if flags & COOKIE_SAMESITE_NONE != 0 && flags & COOKIE_SECURE == 0 {
        log::warn!(
            "cookie '{name}': trying to set 'SameSite=None' without the \
             'Secure' flag. Fall back to SameSite=Lax"
        );
        flags = (flags & !COOKIE_SAMESITE_NONE) | COOKIE_SAMESITE_LAX;
    }

    let mut cookie = format!("{name}=\"");
    if let Some(value) = value {
        cookie.push_str(&utf8_percent_encode(value, COOKIE_ENCODE_SET).to_string());
    }
    cookie.push('"');

    if flags & COOKIE_EXPIRENOW != 0 {
        cookie.push_str("; Expires=");
        cookie.push_str(EXPIRES_NOW);
    } else if maxage == COOKIE_MAXAGE_FOREVER {
        cookie.push_str("; Expires=");
        cookie.push_str(EXPIRES_NEVER);
    } else if maxage > 0 {
        cookie.push_str(&format!("; Max-Age={maxage}"));
    }

    // An empty domain would make clients drop the cookie.
    if let Some(domain) = domain.filter(|d| !d.is_empty()) {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    if let Some(path) = path {
        cookie.push_str("; Path=");
        cookie.push_str(path);
    }
    if flags & COOKIE_SECURE != 0 {
        cookie.push_str("; Secure");
    }
    if flags & COOKIE_DISCARD != 0 {
        cookie.push_str("; Discard");
    }
    if flags & COOKIE_SCRIPTABLE == 0 {
        cookie.push_str("; HttpOnly");
    }
    if flags & COOKIE_SAMESITE_STRICT != 0 {
        cookie.push_str("; SameSite=Strict");
    } else if flags & COOKIE_SAMESITE_LAX != 0 {
        cookie.push_str("; SameSite=Lax");
    } else if flags & COOKIE_SAMESITE_NONE != 0 {
        cookie.push_str("; SameSite=None");
    }

    conn.add_response_header("set-cookie", cookie);
}

/// Expires the cookie with matching name, domain, and path immediately.
pub fn delete_cookie(
    conn: &mut Conn,
    name: &str,
    domain: Option<&str>,
    path: Option<&str>,
    flags: CookieFlags,
) {
    set_cookie(conn, name, None, 0, domain, path, flags | COOKIE_EXPIRENOW);
}

/// Returns the first value of the named cookie from the `cookie:` request
/// headers.
pub fn get_cookie(conn: &Conn, name: &str) -> Option<String> {
    let mut from = 0;
    while let Some(idx) = conn.headers.ifind_from("cookie", from) {
        let header = conn.headers.value(idx)?;
        if let Some((value, _)) = find_in_cookie_header(header, name) {
            return Some(value);
        }
        from = idx + 1;
    }
    None
}

/// Returns every value of the named cookie, across all `cookie:` headers.
pub fn get_cookie_all(conn: &Conn, name: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut from = 0;
    while let Some(idx) = conn.headers.ifind_from("cookie", from) {
        if let Some(header) = conn.headers.value(idx) {
            let mut rest = header;
            while !rest.is_empty() {
                match find_in_cookie_header(rest, name) {
                    Some((value, consumed)) => {
                        values.push(value);
                        rest = &rest[consumed..];
                    }
                    None => break,
                }
            }
        }
        from = idx + 1;
    }
    values
}

/// Like [`get_cookie`], but outbound `set-cookie` headers are searched
/// first, so a cookie set earlier in the same request is visible.
pub fn get_cookie_include_set_cookies(conn: &Conn, name: &str) -> Option<String> {
    let mut from = 0;
    while let Some(idx) = conn.output_headers.ifind_from("set-cookie", from) {
        let header = conn.output_headers.value(idx)?;
        if let Some(value) = find_in_set_cookie_header(header, name) {
            return Some(value);
        }
        from = idx + 1;
    }
    get_cookie(conn, name)
}

fn delete_named_set_cookies(conn: &mut Conn, name: &str) {
    let mut from = 0;
    while let Some(idx) = conn.output_headers.ifind_from("set-cookie", from) {
        let matched = conn
            .output_headers
            .value(idx)
            .and_then(|header| find_in_set_cookie_header(header, name))
            .is_some();
        if matched {
            conn.output_headers.delete(idx);
            from = idx;
        } else {
            from = idx + 1;
        }
    }
}

/// Extracts an optionally quoted cookie value starting at `s`, returning
/// the decoded value and the number of bytes consumed (value plus closing
/// delimiters).
fn copy_cookie_value(s: &str) -> (String, usize) {
    let bytes = s.as_bytes();
    let mut i = 0;
    if bytes.first() == Some(&b'"') {
        i += 1;
    }
    let start = i;
    while i < bytes.len() && bytes[i] != b'"' && bytes[i] != b';' {
        i += 1;
    }
    let raw = &s[start..i];
    let value = percent_decode_str(raw)
        .decode_utf8()
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| raw.to_string());

    while i < bytes.len() && (bytes[i] == b'"' || bytes[i] == b';') {
        i += 1;
    }
    (value, i)
}

/// Scans a `cookie:` header (a `;`-separated pair list) for `name`. On a
/// hit, returns the decoded value and the offset just past it, so callers
/// can continue scanning for further cookies of the same name.
fn find_in_cookie_header(header: &str, name: &str) -> Option<(String, usize)> {
    let bytes = header.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] as char).is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        let rest = &header[i..];
        if let Some(after_name) = rest.strip_prefix(name) {
            // Names are case-sensitive and must be followed by '='.
            if after_name.starts_with('=') {
                let value_start = i + name.len() + 1;
                let (value, consumed) = copy_cookie_value(&header[value_start..]);
                return Some((value, value_start + consumed));
            }
        }

        while i < bytes.len() && bytes[i] != b';' {
            i += 1;
        }
        if i < bytes.len() {
            i += 1;
        }
    }
    None
}

/// A `set-cookie:` header holds one cookie; only a leading `name=` counts.
fn find_in_set_cookie_header(header: &str, name: &str) -> Option<String> {
    let trimmed = header.trim_start();
    let after_name = trimmed.strip_prefix(name)?;
    let value = after_name.strip_prefix('=')?;
    Some(copy_cookie_value(value).0)
}

#[cfg(test)]
mod test {
    use super::*;

    fn outbound_cookies(conn: &Conn) -> Vec<&str> {
        conn.output_headers
            .iter()
            .filter(|f| f.key == "set-cookie")
            .map(|f| f.value.as_str())
            .collect()
    }

    #[test]
    fn emits_attributes_in_fixed_order() {
        let mut conn = Conn::default();
        set_cookie(
            &mut conn,
            "s",
            Some("a b"),
            0,
            None,
            None,
            COOKIE_SECURE | COOKIE_SAMESITE_STRICT,
        );
        assert_eq!(
            outbound_cookies(&conn),
            vec![r#"s="a%20b"; Secure; HttpOnly; SameSite=Strict"#]
        );
    }

    #[test]
    fn expiry_variants() {
        let mut conn = Conn::default();
        set_cookie(&mut conn, "now", None, 0, None, None, COOKIE_EXPIRENOW | COOKIE_SCRIPTABLE);
        set_cookie(&mut conn, "forever", Some("v"), COOKIE_MAXAGE_FOREVER, None, None, COOKIE_SCRIPTABLE);
        set_cookie(&mut conn, "hour", Some("v"), 3600, None, None, COOKIE_SCRIPTABLE);

        assert_eq!(
            outbound_cookies(&conn),
            vec![
                r#"now=""; Expires=Fri, 01-Jan-1980 01:00:00 GMT"#,
                r#"forever="v"; Expires=Fri, 01-Jan-2035 01:00:00 GMT"#,
                r#"hour="v"; Max-Age=3600"#,
            ]
        );
    }

    #[test]
    fn domain_and_path_attributes() {
        let mut conn = Conn::default();
        set_cookie(
            &mut conn,
            "c",
            Some("v"),
            0,
            Some("example.com"),
            Some("/app"),
            COOKIE_SCRIPTABLE,
        );
        // Empty domains are dropped entirely.
        set_cookie(&mut conn, "d", Some("v"), 0, Some(""), None, COOKIE_SCRIPTABLE);

        assert_eq!(
            outbound_cookies(&conn),
            vec![
                r#"c="v"; Domain=example.com; Path=/app"#,
                r#"d="v""#,
            ]
        );
    }

    #[test]
    fn samesite_none_without_secure_downgrades_to_lax() {
        let mut conn = Conn::default();
        set_cookie(&mut conn, "c", Some("v"), 0, None, None, COOKIE_SAMESITE_NONE | COOKIE_SCRIPTABLE);
        assert_eq!(outbound_cookies(&conn), vec![r#"c="v"; SameSite=Lax"#]);

        let mut conn = Conn::default();
        set_cookie(
            &mut conn,
            "c",
            Some("v"),
            0,
            None,
            None,
            COOKIE_SAMESITE_NONE | COOKIE_SECURE | COOKIE_SCRIPTABLE,
        );
        assert_eq!(outbound_cookies(&conn), vec![r#"c="v"; Secure; SameSite=None"#]);
    }

    #[test]
    fn replace_drops_matching_outbound_cookies() {
        let mut conn = Conn::default();
        set_cookie(&mut conn, "c", Some("old"), 0, None, None, COOKIE_SCRIPTABLE);
        set_cookie(&mut conn, "other", Some("keep"), 0, None, None, COOKIE_SCRIPTABLE);
        set_cookie(&mut conn, "c", Some("new"), 0, None, None, COOKIE_SCRIPTABLE | COOKIE_REPLACE);

        assert_eq!(
            outbound_cookies(&conn),
            vec![r#"other="keep""#, r#"c="new""#]
        );
    }

    #[test]
    fn get_cookie_finds_across_headers() {
        let mut conn = Conn::default();
        conn.headers.put("cookie", r#"a=1; b="two""#);
        conn.headers.put("cookie", "c=3");

        assert_eq!(get_cookie(&conn, "a").as_deref(), Some("1"));
        assert_eq!(get_cookie(&conn, "b").as_deref(), Some("two"));
        assert_eq!(get_cookie(&conn, "c").as_deref(), Some("3"));
        assert_eq!(get_cookie(&conn, "missing"), None);
    }

    #[test]
    fn cookie_names_are_case_sensitive() {
        let mut conn = Conn::default();
        conn.headers.put("cookie", "Session=x");
        assert_eq!(get_cookie(&conn, "session"), None);
        assert_eq!(get_cookie(&conn, "Session").as_deref(), Some("x"));
    }

    #[test]
    fn name_prefix_does_not_match() {
        let mut conn = Conn::default();
        conn.headers.put("cookie", "sess=1; s=2");
        assert_eq!(get_cookie(&conn, "s").as_deref(), Some("2"));
    }

    #[test]
    fn get_all_collects_every_occurrence() {
        let mut conn = Conn::default();
        conn.headers.put("cookie", "dup=1; other=x; dup=2");
        conn.headers.put("cookie", "dup=3");

        assert_eq!(get_cookie_all(&conn, "dup"), vec!["1", "2", "3"]);
    }

    #[test]
    fn include_set_cookies_sees_outbound_first() {
        let mut conn = Conn::default();
        conn.headers.put("cookie", "c=stale");
        set_cookie(&mut conn, "c", Some("fresh"), 0, None, None, COOKIE_SCRIPTABLE);

        assert_eq!(
            get_cookie_include_set_cookies(&conn, "c").as_deref(),
            Some("fresh")
        );
        assert_eq!(get_cookie(&conn, "c").as_deref(), Some("stale"));
    }

    #[test]
    fn emitted_cookie_round_trips_through_decode() {
        let original = "hello world/100%";
        let mut conn = Conn::default();
        set_cookie(&mut conn, "rt", Some(original), 0, None, None, COOKIE_SCRIPTABLE);

        // Feed the emitted value back through the request-side parser.
        let emitted = outbound_cookies(&conn)[0].to_string();
        let mut inbound = Conn::default();
        inbound
            .headers
            .put("cookie", emitted.split(';').next().unwrap().to_string());

        assert_eq!(get_cookie(&inbound, "rt").as_deref(), Some(original));
    }
}
