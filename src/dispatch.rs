//! Registration and execution of connection request handlers.

use crate::conn::{
    Conn, CONN_ENTITY_TOO_LARGE, CONN_LINE_TOO_LONG, CONN_REQUEST_URI_TOO_LONG,
};
use crate::request::RequestType;
use crate::server::Server;
use crate::urlspace::{EntryRef, MatchInfo, OpFlags, SpaceEntry, SpaceOp};
use std::any::Any;
use std::sync::Arc;

/// Outcome of request-processing steps, filters, and authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok,
    Error,
    Forbidden,
    Unauthorized,
    FilterBreak,
    FilterReturn,
    Timeout,
}

/// A request handler. Implemented for plain closures; scripted handlers
/// from an embedding layer implement it over their opaque token.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, conn: &mut Conn) -> ReturnCode;

    /// Human-readable description for introspection surfaces.
    fn describe(&self) -> String {
        "handler".to_string()
    }
}

impl<F> RequestHandler for F
where
    F: Fn(&mut Conn) -> ReturnCode + Send + Sync,
{
    fn handle(&self, conn: &mut Conn) -> ReturnCode {
        self(conn)
    }
}

/// Predicate evaluated against the connection during handler resolution.
pub type ContextSpec = Arc<dyn Fn(&Conn) -> bool + Send + Sync>;

/// Callback run when a registration's last reference is released.
pub type DeleteCallback = Box<dyn FnOnce() + Send>;

/// A registered handler descriptor, stored refcounted in the URL-space.
pub struct RegisteredProc {
    pub handler: Arc<dyn RequestHandler>,
    pub flags: OpFlags,
    context: Option<ContextSpec>,
}

impl RegisteredProc {
    fn matches_context(&self, conn: &Conn) -> bool {
        self.context.as_ref().map_or(true, |spec| spec(conn))
    }
}

/// An acquired handler reference. The registration's delete callback runs
/// once the last of these (and the registration itself) is gone.
pub struct ProcRef {
    entry: EntryRef,
}

impl ProcRef {
    pub fn proc(&self) -> &RegisteredProc {
        // Entries in the request partition only ever hold RegisteredProc.
        self.entry
            .downcast_ref::<RegisteredProc>()
            .unwrap_or_else(|| unreachable!("foreign entry in request space"))
    }
}

fn adapt_delete(delete: Option<DeleteCallback>) -> Option<crate::urlspace::DeleteProc> {
    delete.map(|cb| -> crate::urlspace::DeleteProc { Box::new(move |_| cb()) })
}

/// A URL acceptable for registration: a plain absolute path.
fn plain_url_path(url: &str) -> Result<(), &'static str> {
    if !url.starts_with('/') {
        return Err("URL is not an absolute path");
    }
    if url.contains(['?', '#']) {
        return Err("URL contains query or fragment characters");
    }
    Ok(())
}

/// Registers a handler for `(method, url)`. An invalid URL path is logged
/// and ignored.
pub fn register_request(
    server: &Server,
    method: &str,
    url: &str,
    handler: Arc<dyn RequestHandler>,
    flags: OpFlags,
    context: Option<ContextSpec>,
    delete: Option<DeleteCallback>,
) {
    if let Err(reason) = plain_url_path(url) {
        log::error!("register request handler: invalid URL path {url}: {reason}");
        return;
    }

    let proc = RegisteredProc {
        handler,
        flags,
        context,
    };
    server
        .urlspace
        .set(server.request_id, method, url, Box::new(proc), flags, adapt_delete(delete));
}

/// Removes the handler registered for `(method, url)`. Its delete callback
/// may run.
pub fn unregister_request(server: &Server, method: &str, url: &str, flags: OpFlags) -> usize {
    server.urlspace.destroy(server.request_id, method, url, flags)
}

/// Returns the handler that would run for `(method, url)`, without any
/// connection context.
pub fn get_request(server: &Server, method: &str, url: &str) -> Option<(ProcRef, MatchInfo)> {
    server
        .urlspace
        .get(server.request_id, method, url, 0, SpaceOp::Default, None)
        .map(|(entry, info)| (ProcRef { entry }, info))
}

/// Locates and executes the handler for the connection's request.
pub fn run_request(server: &Server, conn: &mut Conn) -> ReturnCode {
    // Error responses for invalid reads flagged before parsing.
    if conn.flags & CONN_ENTITY_TOO_LARGE != 0 {
        conn.flags &= !CONN_ENTITY_TOO_LARGE;
        return conn.return_entity_too_large();
    }
    if conn.flags & CONN_REQUEST_URI_TOO_LONG != 0 {
        conn.flags &= !CONN_REQUEST_URI_TOO_LONG;
        return conn.return_request_uri_too_long();
    }
    if conn.flags & CONN_LINE_TOO_LONG != 0 {
        conn.flags &= !CONN_LINE_TOO_LONG;
        return conn.return_header_line_too_long();
    }

    if conn.request.method.is_empty() {
        return ReturnCode::Ok;
    }

    if conn.request.request_type == RequestType::Proxy {
        return run_proxy_request(server, conn);
    }

    let found = {
        let context = &*conn;
        let filter = |data: &(dyn Any + Send + Sync)| {
            data.downcast_ref::<RegisteredProc>()
                .is_some_and(|proc| proc.matches_context(context))
        };
        server.urlspace.get(
            server.request_id,
            &conn.request.method,
            &conn.request.url,
            0,
            SpaceOp::Default,
            Some(&filter),
        )
    };

    match found {
        None => {
            if conn.request.method == "BAD" {
                conn.return_bad_request()
            } else {
                conn.return_not_implemented()
            }
        }
        Some((entry, info)) => {
            conn.match_info = Some(info);
            let proc_ref = ProcRef { entry };
            let status = proc_ref.proc().handler.clone().handle(conn);
            drop(proc_ref);
            status
        }
    }
}

/// Performs an internal redirect: rewrite the request URL (preserving the
/// query), re-run authorization, then re-dispatch.
pub fn redirect(server: &Server, conn: &mut Conn, url: &str) -> ReturnCode {
    conn.request.set_url(url);

    let status = match server.authorize.as_ref() {
        Some(authorize) => authorize(
            &conn.request.method,
            &conn.request.url,
            conn.auth_user.as_deref(),
            conn.auth_passwd.as_deref(),
            conn.peer_addr.as_deref(),
        ),
        None => ReturnCode::Ok,
    };

    match status {
        ReturnCode::Ok => run_request(server, conn),
        ReturnCode::Forbidden => conn.return_forbidden(),
        ReturnCode::Unauthorized => conn.return_unauthorized(),
        cause => conn.return_internal_error(cause, "redirect, after authorize request"),
    }
}

/// Registers a proxy handler for a method/protocol pair, replacing (and
/// releasing) any previous registration.
pub fn register_proxy(
    server: &Server,
    method: &str,
    protocol: &str,
    handler: Arc<dyn RequestHandler>,
    delete: Option<DeleteCallback>,
) {
    let proc = RegisteredProc {
        handler,
        flags: 0,
        context: None,
    };
    let entry = SpaceEntry::detached(Box::new(proc), 0, adapt_delete(delete));

    let key = format!("{method}{protocol}");
    let mut proxy = server.proxy.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(previous) = proxy.insert(key, entry) {
        SpaceEntry::release(previous);
    }
}

/// Removes a proxy handler. Its delete callback may run.
pub fn unregister_proxy(server: &Server, method: &str, protocol: &str) {
    let key = format!("{method}{protocol}");
    let mut proxy = server.proxy.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(entry) = proxy.remove(&key) {
        SpaceEntry::release(entry);
    }
}

/// Locates and executes the proxy handler for the connection's method and
/// protocol. Misses respond 404.
pub fn run_proxy_request(server: &Server, conn: &mut Conn) -> ReturnCode {
    let key = format!(
        "{}{}",
        conn.request.method,
        conn.request.protocol.as_deref().unwrap_or_default()
    );

    let acquired = {
        let proxy = server.proxy.lock().unwrap_or_else(|e| e.into_inner());
        proxy.get(&key).map(SpaceEntry::acquire)
    };

    match acquired {
        None => conn.return_not_found(),
        Some(entry) => {
            let proc_ref = ProcRef { entry };
            let status = proc_ref.proc().handler.clone().handle(conn);
            drop(proc_ref);
            status
        }
    }
}

/// Describes every registered request handler for introspection.
pub fn describe_requests(server: &Server) -> Vec<String> {
    let mut out = Vec::new();
    server.urlspace.walk(server.request_id, |method, url, _, data| {
        if let Some(proc) = data.downcast_ref::<RegisteredProc>() {
            out.push(format!("{method} {url} {}", proc.handler.describe()));
        }
    });
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::request::Request;
    use crate::server::ServerConfig;
    use crate::status;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn server() -> Arc<Server> {
        ServerConfig::new("test").build()
    }

    fn conn_for_line(line: &str) -> Conn {
        Conn::new(Request::parse(line).unwrap())
    }

    fn ok_handler(marker: &'static str) -> Arc<dyn RequestHandler> {
        Arc::new(move |conn: &mut Conn| {
            conn.response_status = status::OK;
            conn.response_body = marker.as_bytes().to_vec();
            ReturnCode::Ok
        })
    }

    #[test]
    fn dispatches_to_registered_handler() {
        let server = server();
        register_request(&server, "GET", "/hello", ok_handler("hi"), 0, None, None);

        let mut conn = conn_for_line("GET /hello HTTP/1.1");
        assert_eq!(run_request(&server, &mut conn), ReturnCode::Ok);
        assert_eq!(conn.response_body, b"hi");
        assert!(conn.match_info.unwrap().segment_match);
    }

    #[test]
    fn inherited_handler_serves_subpaths() {
        let server = server();
        register_request(&server, "GET", "/api", ok_handler("api"), 0, None, None);

        let mut conn = conn_for_line("GET /api/v1/users HTTP/1.1");
        assert_eq!(run_request(&server, &mut conn), ReturnCode::Ok);
        assert_eq!(conn.response_body, b"api");
    }

    #[test]
    fn miss_with_known_method_responds_501() {
        let server = server();
        let mut conn = conn_for_line("GET /nope HTTP/1.1");
        run_request(&server, &mut conn);
        assert_eq!(conn.response_status, status::NOT_IMPLEMENTED);
    }

    #[test]
    fn bad_sentinel_method_responds_400() {
        let server = server();
        let mut conn = Conn::default();
        conn.request.method = "BAD".to_string();
        conn.request.url = "/".to_string();
        run_request(&server, &mut conn);
        assert_eq!(conn.response_status, status::BAD_REQUEST);
    }

    #[test]
    fn reader_flags_map_to_canned_responses() {
        let server = server();
        for (flag, code) in [
            (CONN_ENTITY_TOO_LARGE, status::ENTITY_TOO_LARGE),
            (CONN_REQUEST_URI_TOO_LONG, status::REQUEST_URI_TOO_LONG),
            (CONN_LINE_TOO_LONG, status::HEADER_LINE_TOO_LONG),
        ] {
            let mut conn = Conn::default();
            conn.flags = flag;
            run_request(&server, &mut conn);
            assert_eq!(conn.response_status, code);
            assert_eq!(conn.flags, 0, "flag must be cleared");
        }
    }

    #[test]
    fn context_spec_rejection_falls_through() {
        let server = server();
        register_request(
            &server,
            "GET",
            "/ctx",
            ok_handler("gated"),
            0,
            Some(Arc::new(|conn: &Conn| {
                conn.headers.iget("host") == Some("gated.example.com")
            })),
            None,
        );
        register_request(&server, "GET", "/", ok_handler("default"), 0, None, None);

        let mut conn = conn_for_line("GET /ctx HTTP/1.1");
        conn.headers.put("host", "other.example.com");
        run_request(&server, &mut conn);
        assert_eq!(conn.response_body, b"default");

        let mut conn = conn_for_line("GET /ctx HTTP/1.1");
        conn.headers.put("host", "gated.example.com");
        run_request(&server, &mut conn);
        assert_eq!(conn.response_body, b"gated");
    }

    #[test]
    fn delete_callback_fires_after_unregister() {
        static DELETES: AtomicUsize = AtomicUsize::new(0);
        let server = server();
        register_request(
            &server,
            "GET",
            "/gone",
            ok_handler("x"),
            0,
            None,
            Some(Box::new(|| {
                DELETES.fetch_add(1, Ordering::SeqCst);
            })),
        );

        assert_eq!(unregister_request(&server, "GET", "/gone", 0), 1);
        assert_eq!(DELETES.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_registration_url_is_ignored() {
        let server = server();
        register_request(&server, "GET", "/x?bad", ok_handler("x"), 0, None, None);
        assert!(get_request(&server, "GET", "/x").is_none());
    }

    #[test]
    fn proxy_requests_use_the_proxy_registry() {
        let server = server();
        register_proxy(&server, "GET", "http", ok_handler("proxied"), None);

        let mut conn = conn_for_line("GET http://upstream.example/a HTTP/1.1");
        assert_eq!(run_request(&server, &mut conn), ReturnCode::Ok);
        assert_eq!(conn.response_body, b"proxied");

        let mut conn = conn_for_line("GET https://upstream.example/a HTTP/1.1");
        run_request(&server, &mut conn);
        assert_eq!(conn.response_status, status::NOT_FOUND);
    }

    #[test]
    fn redirect_reruns_request_after_authorization() {
        let server = ServerConfig::new("test")
            .authorize(|_method, url, _user, _passwd, _peer| {
                if url.starts_with("/private") {
                    ReturnCode::Forbidden
                } else {
                    ReturnCode::Ok
                }
            })
            .build();
        register_request(&server, "GET", "/landing", ok_handler("landed"), 0, None, None);

        let mut conn = conn_for_line("GET /original?q=1 HTTP/1.1");
        assert_eq!(redirect(&server, &mut conn, "/landing"), ReturnCode::Ok);
        assert_eq!(conn.response_body, b"landed");
        assert_eq!(conn.request.query.as_deref(), Some("q=1"));

        let mut conn = conn_for_line("GET /x HTTP/1.1");
        redirect(&server, &mut conn, "/private/area");
        assert_eq!(conn.response_status, status::FORBIDDEN);
    }

    #[test]
    fn describe_lists_registrations() {
        let server = server();
        register_request(&server, "GET", "/a", ok_handler("x"), 0, None, None);
        register_request(&server, "POST", "/b", ok_handler("y"), 0, None, None);
        assert_eq!(describe_requests(&server).len(), 2);
    }
}
