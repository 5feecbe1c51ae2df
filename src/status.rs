//! HTTP status code constants

macro_rules! status_codes {
    ($($name:ident  $value:literal),* $(,)?) => {
        $(
            pub const $name: u16 = $value;
        )*
    }
}

status_codes! {
    OK                          200,
    NOT_MODIFIED                304,
    TEMPORARY_REDIRECT          307,
    PERMANENT_REDIRECT          308,
    BAD_REQUEST                 400,
    UNAUTHORIZED                401,
    FORBIDDEN                   403,
    NOT_FOUND                   404,
    METHOD_NOT_ALLOWED          405,
    ENTITY_TOO_LARGE            413,
    REQUEST_URI_TOO_LONG        414,
    TEAPOT                      418,
    HEADER_LINE_TOO_LONG        431,
    INTERNAL_SERVER_ERROR       500,
    NOT_IMPLEMENTED             501,
}

/// Returns the canonical reason phrase for `code`, or `"Unknown"`.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        OK => "OK",
        NOT_MODIFIED => "Not Modified",
        TEMPORARY_REDIRECT => "Temporary Redirect",
        PERMANENT_REDIRECT => "Permanent Redirect",
        BAD_REQUEST => "Bad Request",
        UNAUTHORIZED => "Unauthorized",
        FORBIDDEN => "Forbidden",
        NOT_FOUND => "Not Found",
        METHOD_NOT_ALLOWED => "Method Not Allowed",
        ENTITY_TOO_LARGE => "Content Too Large",
        REQUEST_URI_TOO_LONG => "URI Too Long",
        TEAPOT => "I'm a teapot",
        HEADER_LINE_TOO_LONG => "Request Header Fields Too Large",
        INTERNAL_SERVER_ERROR => "Internal Server Error",
        NOT_IMPLEMENTED => "Not Implemented",
        _ => "Unknown",
    }
}
