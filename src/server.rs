//! The per-virtual-server context object.
//!
//! Everything request processing needs hangs off a [`Server`]: the URL
//! dispatch space and its id partitions, the filter tables, the proxy
//! registry, virtual-hosting options, and the authorization hook. A
//! [`ServerConfig`] builds one before worker threads start.

use crate::dispatch::ReturnCode;
use crate::filter::FilterTables;
use crate::urlspace::{SpaceEntry, SpaceId, UrlSpace};
use camino::Utf8PathBuf;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Hook deciding whether a (method, url, user, password, peer) tuple may
/// proceed.
pub type AuthorizeProc =
    dyn Fn(&str, &str, Option<&str>, Option<&str>, Option<&str>) -> ReturnCode + Send + Sync;

/// Hook computing a server root from a raw host header.
pub type ServerRootProc = dyn Fn(Option<&str>) -> Option<String> + Send + Sync;

/// Virtual-hosting options.
#[derive(Default)]
pub struct VhostOptions {
    pub enabled: bool,
    pub strip_www: bool,
    pub strip_port: bool,
    pub host_prefix: Option<String>,
    pub host_hash_level: usize,
    pub(crate) root_proc: Option<Box<ServerRootProc>>,
}

pub struct Server {
    pub name: String,
    /// Static server directory, the fallback root.
    pub serverdir: Utf8PathBuf,
    /// Pages directory; relative values resolve below the server root.
    pub pagedir: Utf8PathBuf,
    pub vhost: VhostOptions,
    pub filters: FilterTables,
    pub(crate) urlspace: UrlSpace,
    pub(crate) request_id: SpaceId,
    pub(crate) url2file_id: SpaceId,
    pub(crate) proxy: Mutex<HashMap<String, Arc<SpaceEntry>>>,
    pub(crate) authorize: Option<Box<AuthorizeProc>>,
}

/// Builder for a [`Server`].
pub struct ServerConfig {
    name: String,
    serverdir: Utf8PathBuf,
    pagedir: Utf8PathBuf,
    vhost: VhostOptions,
    rwlocks: bool,
    authorize: Option<Box<AuthorizeProc>>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>) -> ServerConfig {
        ServerConfig {
            name: name.into(),
            serverdir: Utf8PathBuf::from("/var/www"),
            pagedir: Utf8PathBuf::from("pages"),
            vhost: VhostOptions {
                strip_www: true,
                strip_port: true,
                ..VhostOptions::default()
            },
            rwlocks: false,
            authorize: None,
        }
    }

    pub fn serverdir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.serverdir = dir.into();
        self
    }

    pub fn pagedir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.pagedir = dir.into();
        self
    }

    /// Enables virtual hosting. Disabled again (with an error log) at build
    /// time if the page directory is absolute, since the host could never
    /// influence the resolved root.
    pub fn vhost_enabled(mut self, enabled: bool) -> Self {
        self.vhost.enabled = enabled;
        self
    }

    pub fn strip_www(mut self, strip: bool) -> Self {
        self.vhost.strip_www = strip;
        self
    }

    pub fn strip_port(mut self, strip: bool) -> Self {
        self.vhost.strip_port = strip;
        self
    }

    pub fn host_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.vhost.host_prefix = Some(prefix.into());
        self
    }

    /// Number of host-hash directory levels (0..=5).
    pub fn host_hash_level(mut self, levels: usize) -> Self {
        self.vhost.host_hash_level = levels.min(5);
        self
    }

    /// Protects the filter chain with a reader-writer lock instead of a
    /// mutex, letting concurrent requests evaluate filters in parallel.
    pub fn filter_rwlocks(mut self, rwlocks: bool) -> Self {
        self.rwlocks = rwlocks;
        self
    }

    pub fn authorize<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &str, Option<&str>, Option<&str>, Option<&str>) -> ReturnCode
            + Send
            + Sync
            + 'static,
    {
        self.authorize = Some(Box::new(hook));
        self
    }

    /// Installs a custom server-root hook consulted before the vhost
    /// machinery.
    pub fn server_root_proc<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<&str>) -> Option<String> + Send + Sync + 'static,
    {
        self.vhost.root_proc = Some(Box::new(hook));
        self
    }

    pub fn build(mut self) -> Arc<Server> {
        if self.vhost.enabled && crate::pathname::is_absolute(self.pagedir.as_str()) {
            log::error!(
                "vhost[{}]: disabled, pagedir not relative: {}",
                self.name,
                self.pagedir
            );
            self.vhost.enabled = false;
        }

        let urlspace = UrlSpace::new();
        let request_id = urlspace.alloc();
        let url2file_id = urlspace.alloc();

        let server = Arc::new(Server {
            name: self.name,
            serverdir: self.serverdir,
            pagedir: self.pagedir,
            vhost: self.vhost,
            filters: FilterTables::new(self.rwlocks),
            urlspace,
            request_id,
            url2file_id,
            proxy: Mutex::new(HashMap::new()),
            authorize: self.authorize,
        });

        // Every server starts with the page-root mapper on "/".
        crate::url2file::register_page_root_mapper(&server, "/", 0);

        server
    }
}
