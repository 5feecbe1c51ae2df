//! Per-connection state threaded through filters, handlers, and traces.

use crate::dispatch::ReturnCode;
use crate::request::Request;
use crate::set::Set;
use crate::status;
use crate::urlspace::MatchInfo;
use std::collections::BTreeMap;
use std::time::Instant;

/// Reader-side signals raised before the request was parsed.
pub type ConnFlags = u32;

pub const CONN_ENTITY_TOO_LARGE: ConnFlags = 0x01;
pub const CONN_REQUEST_URI_TOO_LONG: ConnFlags = 0x02;
pub const CONN_LINE_TOO_LONG: ConnFlags = 0x04;

/// Everything about one in-flight request/response pair.
#[derive(Debug)]
pub struct Conn {
    pub request: Request,
    /// Incoming header fields (keys stored lowercase by the reader).
    pub headers: Set,
    /// Outgoing header fields.
    pub output_headers: Set,
    pub flags: ConnFlags,
    pub request_body: Vec<u8>,
    pub peer_addr: Option<String>,
    pub auth_user: Option<String>,
    pub auth_passwd: Option<String>,
    pub response_status: u16,
    pub response_body: Vec<u8>,
    /// How the dispatched handler matched, for handlers that care.
    pub match_info: Option<MatchInfo>,
    pub(crate) start_time: Instant,
    data: BTreeMap<&'static str, String>,
}

impl Default for Conn {
    fn default() -> Self {
        Conn {
            request: Request::default(),
            headers: Set::new("headers"),
            output_headers: Set::new("outputheaders"),
            flags: 0,
            request_body: Vec::new(),
            peer_addr: None,
            auth_user: None,
            auth_passwd: None,
            response_status: 0,
            response_body: Vec::new(),
            match_info: None,
            start_time: Instant::now(),
            data: BTreeMap::new(),
        }
    }
}

macro_rules! impl_canned {
    ($($name:ident :: $doc:literal),* $(,)?) => {
        $(
        paste::paste! {
            #[doc = $doc]
            pub fn [<return_ $name:lower>](&mut self) -> ReturnCode {
                self.canned(status::$name)
            }
        }
        )*
    };
}

impl Conn {
    pub fn new(request: Request) -> Self {
        Conn {
            request,
            ..Conn::default()
        }
    }

    /// When the connection started processing.
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Sets an outgoing header, replacing any previous field with the same
    /// key.
    pub fn set_response_header(&mut self, key: &str, value: impl Into<String>) {
        while let Some(idx) = self.output_headers.ifind_from(key, 0) {
            self.output_headers.delete(idx);
        }
        self.output_headers.put(key, value);
    }

    /// Appends an outgoing header, keeping existing fields with the same
    /// key (needed for `set-cookie`).
    pub fn add_response_header(&mut self, key: &str, value: impl Into<String>) {
        self.output_headers.put(key, value);
    }

    /// Stores a value for later pipeline stages.
    pub fn set_data(&mut self, key: &'static str, value: impl Into<String>) {
        self.data.insert(key, value.into());
    }

    pub fn get_data(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    fn canned(&mut self, code: u16) -> ReturnCode {
        self.response_status = code;
        self.response_body = format!("{} {}\n", code, status::reason_phrase(code)).into_bytes();
        self.set_response_header("content-type", "text/plain");
        ReturnCode::Ok
    }

    impl_canned![
        BAD_REQUEST :: "Responds 400 to an unparseable request.",
        UNAUTHORIZED :: "Responds 401 after a failed authorization.",
        FORBIDDEN :: "Responds 403 after a denied authorization.",
        NOT_FOUND :: "Responds 404 when nothing is registered.",
        ENTITY_TOO_LARGE :: "Responds 413 to an oversized request body.",
        REQUEST_URI_TOO_LONG :: "Responds 414 to an oversized request target.",
        HEADER_LINE_TOO_LONG :: "Responds 431 to an oversized header line.",
        NOT_IMPLEMENTED :: "Responds 501 for a method with no handler.",
    ];

    /// Responds 500 with a short diagnostic tag suitable for logs.
    pub fn return_internal_error(&mut self, cause: ReturnCode, tag: &str) -> ReturnCode {
        log::error!("internal error ({cause:?}): {tag}");
        self.canned(status::INTERNAL_SERVER_ERROR)
    }
}
