//! Process-wide interned-string registry.
//!
//! A fixed set of core atoms gets stable ids at compile time. Subsystems may
//! register additional atoms during startup; once the registry is sealed,
//! registration fails and reads no longer take the lock. Shared references
//! handed out through [`obj`] are cached per thread so hot paths do not
//! contend on the reference counts; each cache releases its references when
//! its thread exits.

use crate::error::Error;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Index into the atom table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomId(pub(crate) usize);

impl AtomId {
    pub fn index(self) -> usize {
        self.0
    }
}

macro_rules! core_atoms {
    ($($variant:ident => $text:literal),* $(,)?) => {
        /// Core atoms with stable ids. Append-only so ids stay stable.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(usize)]
        pub enum CoreAtom {
            $($variant),*
        }

        const CORE_ATOM_NAMES: &[&str] = &[$($text),*];
    };
}

core_atoms! {
    Empty => "",
    True => "true",
    False => "false",
    Null => "null",
    Zero => "0",
    One => "1",

    Address => "address",
    Body => "body",
    Callback => "callback",
    Channel => "channel",
    Code => "code",
    Condition => "condition",
    Data => "data",
    Driver => "driver",
    Fault => "error",
    Expire => "expire",
    File => "file",
    Firstline => "firstline",
    Flags => "flags",
    Handler => "handler",
    Headers => "headers",
    Host => "host",
    Httpversion => "httpversion",
    Location => "location",
    Module => "module",
    Name => "name",
    Path => "path",
    Peer => "peer",
    Phrase => "phrase",
    Pool => "pool",
    Port => "port",
    Proc => "proc",
    Protocol => "protocol",
    Query => "query",
    Received => "received",
    Request => "request",
    Running => "running",
    Sent => "sent",
    Server => "server",
    Servername => "servername",
    Sock => "sock",
    Start => "start",
    State => "state",
    Stats => "stats",
    Status => "status",
    Thread => "thread",
    Time => "time",
    Type => "type",
    Url => "url",
    User => "user",
    Version => "version",
}

impl From<CoreAtom> for AtomId {
    fn from(core: CoreAtom) -> AtomId {
        AtomId(core as usize)
    }
}

struct TableInner {
    entries: Vec<Arc<str>>,
    by_name: HashMap<Arc<str>, AtomId>,
}

/// The registry itself. One lives for the process (see [`global`]); tests
/// may construct their own.
pub struct AtomTable {
    inner: Mutex<TableInner>,
    // Set by seal(); reads go through this snapshot without locking.
    sealed: OnceLock<Box<[Arc<str>]>>,
}

impl Default for AtomTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomTable {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(CORE_ATOM_NAMES.len());
        let mut by_name = HashMap::with_capacity(CORE_ATOM_NAMES.len());
        for (idx, name) in CORE_ATOM_NAMES.iter().enumerate() {
            let shared: Arc<str> = Arc::from(*name);
            by_name.insert(shared.clone(), AtomId(idx));
            entries.push(shared);
        }
        AtomTable {
            inner: Mutex::new(TableInner { entries, by_name }),
            sealed: OnceLock::new(),
        }
    }

    /// Registers a dynamic atom. Returns the existing id when the name is
    /// already present. Fails after [`AtomTable::seal`].
    pub fn register(&self, name: &str) -> Result<AtomId, Error> {
        if self.sealed.get().is_some() {
            return Err(Error::Sealed);
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(&id) = inner.by_name.get(name) {
            return Ok(id);
        }
        let shared: Arc<str> = Arc::from(name);
        let id = AtomId(inner.entries.len());
        inner.by_name.insert(shared.clone(), id);
        inner.entries.push(shared);
        Ok(id)
    }

    /// Closes the registry. Subsequent [`AtomTable::register`] calls fail
    /// and reads stop taking the lock.
    pub fn seal(&self) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot: Box<[Arc<str>]> = inner.entries.clone().into_boxed_slice();
        let _ = self.sealed.set(snapshot);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.get().is_some()
    }

    /// Number of registered atoms (core and dynamic).
    pub fn len(&self) -> usize {
        if let Some(snapshot) = self.sealed.get() {
            return snapshot.len();
        }
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The atom's name bytes, or `None` for an out-of-range id.
    pub fn name(&self, id: AtomId) -> Option<Arc<str>> {
        if let Some(snapshot) = self.sealed.get() {
            return snapshot.get(id.0).cloned();
        }
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(id.0).cloned()
    }

    /// Looks up an atom id by name.
    pub fn find(&self, name: &str) -> Option<AtomId> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_name.get(name).copied()
    }
}

static GLOBAL: OnceLock<AtomTable> = OnceLock::new();

/// The process-wide registry, created on first use.
pub fn global() -> &'static AtomTable {
    GLOBAL.get_or_init(AtomTable::new)
}

thread_local! {
    // Per-thread cache of shared name references from the global table.
    // Dropped (references released) when the thread exits.
    static OBJ_CACHE: RefCell<Vec<Option<Arc<str>>>> = const { RefCell::new(Vec::new()) };
}

/// Shared reference to the atom's name in the global table, served from a
/// per-thread cache.
pub fn obj(id: AtomId) -> Option<Arc<str>> {
    OBJ_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();
        if let Some(Some(cached)) = cache.get(id.0) {
            return Some(cached.clone());
        }
        let fresh = global().name(id)?;
        if cache.len() <= id.0 {
            cache.resize(id.0 + 1, None);
        }
        cache[id.0] = Some(fresh.clone());
        Some(fresh)
    })
}

/// Convenience accessor for a core atom's text.
pub fn core_name(core: CoreAtom) -> &'static str {
    CORE_ATOM_NAMES[core as usize]
}
