//! Mapping request URLs to filesystem paths.
//!
//! Mappers live in their own URL-space partition, so different URL
//! prefixes can resolve against different roots. Descriptors are
//! refcounted like request handlers; a replacement or unregistration
//! releases the old mapper once no resolution still uses it.

use crate::conn::Conn;
use crate::pathname;
use crate::server::Server;
use crate::urlspace::{DeleteProc, OpFlags, SpaceOp};
use camino::Utf8PathBuf;
use std::sync::Arc;

/// How a URL suffix becomes a filesystem path.
pub enum Mapper {
    /// Prepend the (possibly vhost-resolved) page root.
    PageRoot,
    /// Resolve relative to a fixed base path, stripping the registered URL
    /// prefix first.
    Mount { basepath: String, url: String },
    /// Arbitrary resolution.
    Custom(Arc<dyn Fn(&Server, &str) -> Option<String> + Send + Sync>),
}

struct Url2File {
    mapper: Mapper,
}

/// Registers `mapper` for `url`. Replacing an existing registration
/// releases it, firing `delete` once it is unused.
pub fn register_mapper(
    server: &Server,
    url: &str,
    mapper: Mapper,
    flags: OpFlags,
    delete: Option<DeleteProc>,
) {
    server.urlspace.set(
        server.url2file_id,
        "x",
        url,
        Box::new(Url2File { mapper }),
        flags,
        delete,
    );
}

/// Registers the default page-root mapper for `url`.
pub fn register_page_root_mapper(server: &Server, url: &str, flags: OpFlags) {
    register_mapper(server, url, Mapper::PageRoot, flags, None);
}

/// Registers a mount-point mapper: requests below `url` resolve under
/// `basepath` (absolute, or relative to the page root).
pub fn register_mount_mapper(server: &Server, url: &str, basepath: &str, flags: OpFlags) {
    register_mapper(
        server,
        url,
        Mapper::Mount {
            basepath: basepath.to_string(),
            url: url.to_string(),
        },
        flags,
        None,
    );
}

/// Removes the mapper(s) registered under `url`.
pub fn unregister_mapper(server: &Server, url: &str, flags: OpFlags) -> usize {
    server.urlspace.destroy(server.url2file_id, "x", url, flags)
}

/// Constructs the filename that corresponds to a URL. Trailing slashes on
/// the result are stripped.
pub fn url_to_file(server: &Server, conn: Option<&mut Conn>, url: &str) -> Option<Utf8PathBuf> {
    let acquired = server
        .urlspace
        .get(server.url2file_id, "x", url, 0, SpaceOp::Default, None);

    let Some((entry, _)) = acquired else {
        log::error!("url2file: no mapper found for url: {url}");
        return None;
    };
    let mapping = entry.downcast_ref::<Url2File>()?;

    let mut path = match &mapping.mapper {
        Mapper::PageRoot => {
            let mut dest = pathname::page_root(server, None, conn).into_string();
            pathname::make_path(&mut dest, [url]);
            dest
        }
        Mapper::Mount { basepath, url: prefix } => {
            let suffix = strip_common_prefix(prefix, url);
            if pathname::is_absolute(basepath) {
                pathname::join_path([basepath.as_str(), suffix])
            } else {
                let mut dest = pathname::page_root(server, None, conn).into_string();
                pathname::make_path(&mut dest, [basepath.as_str(), suffix]);
                dest
            }
        }
        Mapper::Custom(custom) => custom(server, url)?,
    };

    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }

    log::debug!("url2file: url {url:?} is mapped to {path:?}");
    Some(Utf8PathBuf::from(path))
}

/// Advances past the bytes shared by the registered mount URL and the
/// request URL, returning the request remainder.
fn strip_common_prefix<'a>(prefix: &str, url: &'a str) -> &'a str {
    let shared = prefix
        .bytes()
        .zip(url.bytes())
        .take_while(|(a, b)| a == b)
        .count();
    &url[shared..]
}
