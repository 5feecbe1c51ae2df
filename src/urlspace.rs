//! The URL-space: a keyed registry of (method, URL-pattern) → value
//! mappings with inheritance semantics.
//!
//! The registry is partitioned into independently allocated id spaces so
//! several subsystems (request handlers, url2file mappings) can share one
//! trie without key collisions. Values are reference-counted descriptors;
//! a descriptor's delete callback runs exactly once, when the last
//! reference (registration or in-flight lookup) goes away.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Registration and lookup flags.
pub type OpFlags = u32;

/// The entry matches its URL exactly; subpaths do not inherit it.
pub const OP_NOINHERIT: OpFlags = 0x01;
/// Destroy the whole subtree below the URL.
pub const OP_RECURSE: OpFlags = 0x02;
/// Skip the delete callback when destroying.
pub const OP_NODELETE: OpFlags = 0x04;

/// Lookup mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpaceOp {
    /// Deepest exact match wins, otherwise the deepest inherited entry.
    #[default]
    Default,
    /// Only entries registered at the full URL are considered.
    Exact,
}

/// Identifies one partition of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpaceId(usize);

/// Details about how a lookup matched.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchInfo {
    /// The match covered every segment of the URL.
    pub segment_match: bool,
    /// Byte offset of the matched prefix within the URL.
    pub offset: usize,
}

/// Predicate consulted during resolution; a rejected candidate is skipped
/// and the search continues with the next-best one.
pub type ContextFilter<'a> = &'a dyn Fn(&(dyn Any + Send + Sync)) -> bool;

/// Callback invoked once when a registration's last reference goes away.
pub type DeleteProc = Box<dyn FnOnce(&(dyn Any + Send + Sync)) + Send>;

/// A registered descriptor. Holds the opaque value, the delete callback,
/// and the reference count that decides when the callback fires.
pub struct SpaceEntry {
    data: Box<dyn Any + Send + Sync>,
    delete: Mutex<Option<DeleteProc>>,
    refcnt: AtomicUsize,
    flags: OpFlags,
    seq: u64,
}

impl SpaceEntry {
    pub fn data(&self) -> &(dyn Any + Send + Sync) {
        &*self.data
    }

    pub fn flags(&self) -> OpFlags {
        self.flags
    }

    fn incr(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    fn decr(&self) {
        if self.refcnt.fetch_sub(1, Ordering::AcqRel) == 1 {
            let delete = self.delete.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(delete) = delete {
                delete(&*self.data);
            }
        }
    }

    fn disarm(&self) {
        self.delete.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

impl SpaceEntry {
    /// Builds a standalone refcounted entry outside any trie. The proxy
    /// registry stores these in its own table but shares the reference
    /// discipline.
    pub(crate) fn detached(
        data: Box<dyn Any + Send + Sync>,
        flags: OpFlags,
        delete: Option<DeleteProc>,
    ) -> Arc<SpaceEntry> {
        Arc::new(SpaceEntry {
            data,
            delete: Mutex::new(delete),
            refcnt: AtomicUsize::new(1),
            flags,
            seq: 0,
        })
    }

    /// Acquires a reference on `entry`.
    pub(crate) fn acquire(entry: &Arc<SpaceEntry>) -> EntryRef {
        entry.incr();
        EntryRef {
            entry: entry.clone(),
        }
    }

    /// Releases the registration reference of a detached entry.
    pub(crate) fn release(entry: Arc<SpaceEntry>) {
        entry.decr();
    }
}

impl std::fmt::Debug for SpaceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceEntry")
            .field("flags", &self.flags)
            .field("refcnt", &self.refcnt.load(Ordering::Relaxed))
            .finish()
    }
}

/// An acquired reference to an entry. Dropping it releases the reference,
/// which may fire the delete callback.
pub struct EntryRef {
    entry: Arc<SpaceEntry>,
}

impl EntryRef {
    pub fn data(&self) -> &(dyn Any + Send + Sync) {
        self.entry.data()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.entry.data.downcast_ref::<T>()
    }

    pub fn flags(&self) -> OpFlags {
        self.entry.flags
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        self.entry.decr();
    }
}

#[derive(Default)]
struct Slot {
    exact: Option<Arc<SpaceEntry>>,
    inherit: Option<Arc<SpaceEntry>>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.exact.is_none() && self.inherit.is_none()
    }
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    // method token (including "*") -> id partition -> slot
    methods: HashMap<String, HashMap<usize, Slot>>,
}

impl Node {
    fn slot(&self, method: &str, id: SpaceId) -> Option<&Slot> {
        self.methods.get(method)?.get(&id.0)
    }

    fn slot_mut(&mut self, method: &str, id: SpaceId) -> &mut Slot {
        self.methods
            .entry(method.to_string())
            .or_default()
            .entry(id.0)
            .or_default()
    }
}

/// The registry. One mutex serializes all access; lookups return before
/// any handler runs, so the lock is never held across user code other than
/// delete callbacks (which fire under the lock, as replacement requires).
pub struct UrlSpace {
    root: Mutex<Node>,
    next_id: AtomicUsize,
    next_seq: AtomicU64,
}

impl Default for UrlSpace {
    fn default() -> Self {
        Self::new()
    }
}

struct Candidate {
    entry: Arc<SpaceEntry>,
    exact: bool,
    depth: usize,
    offset: usize,
    seq: u64,
}

impl UrlSpace {
    pub fn new() -> UrlSpace {
        UrlSpace {
            root: Mutex::new(Node::default()),
            next_id: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Returns a fresh id partitioning the registry.
    pub fn alloc(&self) -> SpaceId {
        SpaceId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers `data` under `(method, url)` within `id`. Replacing an
    /// existing entry releases the previous entry's reference, firing its
    /// delete callback under the registry lock once no lookup still holds
    /// it.
    pub fn set(
        &self,
        id: SpaceId,
        method: &str,
        url: &str,
        data: Box<dyn Any + Send + Sync>,
        flags: OpFlags,
        delete: Option<DeleteProc>,
    ) {
        let entry = Arc::new(SpaceEntry {
            data,
            delete: Mutex::new(delete),
            refcnt: AtomicUsize::new(1),
            flags,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        });

        let mut root = self.root.lock().unwrap_or_else(|e| e.into_inner());
        let mut node = &mut *root;
        for segment in segments(url) {
            node = node.children.entry(segment.to_string()).or_default();
        }

        let slot = node.slot_mut(method, id);
        let previous = if flags & OP_NOINHERIT != 0 {
            slot.exact.replace(entry)
        } else {
            slot.inherit.replace(entry)
        };
        if let Some(previous) = previous {
            previous.decr();
        }
    }

    /// Resolves the best-matching entry, acquiring a reference on it.
    ///
    /// Candidate order: exact matches at the full URL first, then inherited
    /// entries deepest-first; among equals the most recently registered
    /// wins. `filter` may reject a candidate, in which case resolution
    /// continues with the next-best one.
    pub fn get(
        &self,
        id: SpaceId,
        method: &str,
        url: &str,
        flags: OpFlags,
        op: SpaceOp,
        filter: Option<ContextFilter<'_>>,
    ) -> Option<(EntryRef, MatchInfo)> {
        let root = self.root.lock().unwrap_or_else(|e| e.into_inner());

        let segs: Vec<&str> = segments(url).collect();
        let full_depth = segs.len();
        let exact_only = op == SpaceOp::Exact || flags & OP_NOINHERIT != 0;

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut node = Some(&*root);
        let mut offset = 0usize;

        for depth in 0..=full_depth {
            let Some(current) = node else { break };

            for token in [method, "*"] {
                if let Some(slot) = current.slot(token, id) {
                    if depth == full_depth {
                        if let Some(entry) = &slot.exact {
                            candidates.push(Candidate {
                                entry: entry.clone(),
                                exact: true,
                                depth,
                                offset,
                                seq: entry.seq,
                            });
                        }
                    }
                    if !exact_only || depth == full_depth {
                        if let Some(entry) = &slot.inherit {
                            candidates.push(Candidate {
                                entry: entry.clone(),
                                exact: depth == full_depth,
                                depth,
                                offset,
                                seq: entry.seq,
                            });
                        }
                    }
                }
            }

            if depth < full_depth {
                let segment = segs[depth];
                // +1 for the separator in front of the segment.
                offset += 1 + segment.len();
                node = current.children.get(segment);
            }
        }

        if exact_only {
            candidates.retain(|c| c.exact && c.depth == full_depth);
        }

        candidates.sort_by(|a, b| {
            b.exact
                .cmp(&a.exact)
                .then(b.depth.cmp(&a.depth))
                .then(b.seq.cmp(&a.seq))
        });

        for candidate in candidates {
            if let Some(filter) = filter {
                if !filter(candidate.entry.data()) {
                    continue;
                }
            }
            candidate.entry.incr();
            let info = MatchInfo {
                segment_match: candidate.depth == full_depth,
                offset: candidate.offset,
            };
            return Some((
                EntryRef {
                    entry: candidate.entry,
                },
                info,
            ));
        }
        None
    }

    /// Removes one entry (the exact one with `OP_NOINHERIT`, the inherited
    /// one otherwise), or every entry under `url` with `OP_RECURSE`.
    /// Returns the number of entries removed.
    pub fn destroy(&self, id: SpaceId, method: &str, url: &str, flags: OpFlags) -> usize {
        let mut root = self.root.lock().unwrap_or_else(|e| e.into_inner());

        let mut node = &mut *root;
        for segment in segments(url) {
            match node.children.get_mut(segment) {
                Some(child) => node = child,
                None => return 0,
            }
        }

        let mut removed = Vec::new();
        if flags & OP_RECURSE != 0 {
            collect_subtree(node, method, id, &mut removed);
        } else if let Some(slot) = node
            .methods
            .get_mut(method)
            .and_then(|by_id| by_id.get_mut(&id.0))
        {
            let taken = if flags & OP_NOINHERIT != 0 {
                slot.exact.take()
            } else {
                slot.inherit.take()
            };
            removed.extend(taken);
        }

        let count = removed.len();
        for entry in removed {
            if flags & OP_NODELETE != 0 {
                entry.disarm();
            }
            entry.decr();
        }
        count
    }

    /// Visits every entry in the partition. The visitor receives the
    /// method token, the registered URL, the flags, and the value.
    pub fn walk(&self, id: SpaceId, mut visitor: impl FnMut(&str, &str, OpFlags, &(dyn Any + Send + Sync))) {
        let root = self.root.lock().unwrap_or_else(|e| e.into_inner());
        let mut path = String::new();
        walk_node(&root, id, &mut path, &mut visitor);
    }
}

fn segments(url: &str) -> impl Iterator<Item = &str> {
    url.split('/').filter(|s| !s.is_empty())
}

fn collect_subtree(node: &mut Node, method: &str, id: SpaceId, out: &mut Vec<Arc<SpaceEntry>>) {
    if let Some(slot) = node
        .methods
        .get_mut(method)
        .and_then(|by_id| by_id.get_mut(&id.0))
    {
        out.extend(slot.exact.take());
        out.extend(slot.inherit.take());
    }
    for child in node.children.values_mut() {
        collect_subtree(child, method, id, out);
    }
}

fn walk_node(
    node: &Node,
    id: SpaceId,
    path: &mut String,
    visitor: &mut impl FnMut(&str, &str, OpFlags, &(dyn Any + Send + Sync)),
) {
    let url = if path.is_empty() { "/" } else { path.as_str() };
    for (method, by_id) in &node.methods {
        if let Some(slot) = by_id.get(&id.0) {
            for entry in [&slot.exact, &slot.inherit].into_iter().flatten() {
                visitor(method, url, entry.flags, entry.data());
            }
        }
    }

    for (segment, child) in &node.children {
        let saved = path.len();
        path.push('/');
        path.push_str(segment);
        walk_node(child, id, path, visitor);
        path.truncate(saved);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn put(space: &UrlSpace, id: SpaceId, method: &str, url: &str, value: &'static str, flags: OpFlags) {
        space.set(id, method, url, Box::new(value), flags, None);
    }

    fn lookup(space: &UrlSpace, id: SpaceId, method: &str, url: &str) -> Option<&'static str> {
        space
            .get(id, method, url, 0, SpaceOp::Default, None)
            .map(|(entry, _)| *entry.downcast_ref::<&'static str>().unwrap())
    }

    #[test]
    fn set_then_get_round_trips() {
        let space = UrlSpace::new();
        let id = space.alloc();
        put(&space, id, "GET", "/a", "v", 0);
        assert_eq!(lookup(&space, id, "GET", "/a"), Some("v"));
        assert_eq!(lookup(&space, id, "POST", "/a"), None);
    }

    #[test]
    fn inheritance_matches_subpaths() {
        let space = UrlSpace::new();
        let id = space.alloc();
        put(&space, id, "GET", "/a", "v", 0);

        assert_eq!(lookup(&space, id, "GET", "/a"), Some("v"));
        assert_eq!(lookup(&space, id, "GET", "/a/"), Some("v"));
        assert_eq!(lookup(&space, id, "GET", "/a/x"), Some("v"));
        assert_eq!(lookup(&space, id, "GET", "/a/x/y"), Some("v"));
        assert_eq!(lookup(&space, id, "GET", "/b"), None);
    }

    #[test]
    fn noinherit_matches_exactly() {
        let space = UrlSpace::new();
        let id = space.alloc();
        put(&space, id, "GET", "/a", "v", OP_NOINHERIT);

        assert_eq!(lookup(&space, id, "GET", "/a"), Some("v"));
        // Trailing-slash tolerance is policy, not inheritance.
        assert_eq!(lookup(&space, id, "GET", "/a/"), Some("v"));
        assert_eq!(lookup(&space, id, "GET", "/a/x"), None);
    }

    #[test]
    fn deeper_exact_beats_shallow_inherit() {
        let space = UrlSpace::new();
        let id = space.alloc();
        put(&space, id, "GET", "/a", "v", 0);
        put(&space, id, "GET", "/a/b", "w", OP_NOINHERIT);

        assert_eq!(lookup(&space, id, "GET", "/a/b"), Some("w"));
        assert_eq!(lookup(&space, id, "GET", "/a/b/c"), Some("v"));
    }

    #[test]
    fn most_recent_registration_wins_ties() {
        let space = UrlSpace::new();
        let id = space.alloc();
        put(&space, id, "GET", "/a", "old", 0);
        put(&space, id, "*", "/a", "new", 0);

        assert_eq!(lookup(&space, id, "GET", "/a/x"), Some("new"));
    }

    #[test]
    fn wildcard_method_matches_any() {
        let space = UrlSpace::new();
        let id = space.alloc();
        put(&space, id, "*", "/any", "v", 0);

        assert_eq!(lookup(&space, id, "DELETE", "/any"), Some("v"));
    }

    #[test]
    fn id_spaces_are_independent() {
        let space = UrlSpace::new();
        let a = space.alloc();
        let b = space.alloc();
        put(&space, a, "GET", "/x", "in-a", 0);

        assert_eq!(lookup(&space, a, "GET", "/x"), Some("in-a"));
        assert_eq!(lookup(&space, b, "GET", "/x"), None);
    }

    #[test]
    fn destroy_removes_one_or_recursively() {
        let space = UrlSpace::new();
        let id = space.alloc();
        put(&space, id, "GET", "/a", "v", 0);
        put(&space, id, "GET", "/a/b", "w", 0);
        put(&space, id, "GET", "/a/b/c", "x", 0);

        assert_eq!(space.destroy(id, "GET", "/a/b", 0), 1);
        assert_eq!(lookup(&space, id, "GET", "/a/b"), Some("v"));

        assert_eq!(space.destroy(id, "GET", "/a", OP_RECURSE), 2);
        assert_eq!(lookup(&space, id, "GET", "/a"), None);
    }

    #[test]
    fn delete_callback_fires_once_after_last_ref() {
        static DELETES: AtomicUsize = AtomicUsize::new(0);
        let space = UrlSpace::new();
        let id = space.alloc();

        space.set(
            id,
            "GET",
            "/a",
            Box::new("v"),
            0,
            Some(Box::new(|_| {
                DELETES.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let held = space.get(id, "GET", "/a", 0, SpaceOp::Default, None).unwrap();
        assert_eq!(space.destroy(id, "GET", "/a", 0), 1);
        // Still referenced by the in-flight lookup.
        assert_eq!(DELETES.load(Ordering::SeqCst), 0);

        drop(held);
        assert_eq!(DELETES.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replacement_releases_the_previous_entry() {
        static DELETES: AtomicUsize = AtomicUsize::new(0);
        let space = UrlSpace::new();
        let id = space.alloc();

        space.set(
            id,
            "GET",
            "/a",
            Box::new("old"),
            0,
            Some(Box::new(|_| {
                DELETES.fetch_add(1, Ordering::SeqCst);
            })),
        );
        space.set(id, "GET", "/a", Box::new("new"), 0, None);

        assert_eq!(DELETES.load(Ordering::SeqCst), 1);
        assert_eq!(lookup(&space, id, "GET", "/a"), Some("new"));
    }

    #[test]
    fn nodelete_destroy_skips_the_callback() {
        static DELETES: AtomicUsize = AtomicUsize::new(0);
        let space = UrlSpace::new();
        let id = space.alloc();

        space.set(
            id,
            "GET",
            "/a",
            Box::new("v"),
            0,
            Some(Box::new(|_| {
                DELETES.fetch_add(1, Ordering::SeqCst);
            })),
        );
        assert_eq!(space.destroy(id, "GET", "/a", OP_NODELETE), 1);
        assert_eq!(DELETES.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn context_filter_falls_back_to_next_candidate() {
        let space = UrlSpace::new();
        let id = space.alloc();
        put(&space, id, "GET", "/a/b", "deep", 0);
        put(&space, id, "GET", "/a", "shallow", 0);

        let reject_deep = |data: &(dyn Any + Send + Sync)| {
            *data.downcast_ref::<&'static str>().unwrap() != "deep"
        };
        let got = space
            .get(id, "GET", "/a/b", 0, SpaceOp::Default, Some(&reject_deep))
            .unwrap();
        assert_eq!(*got.0.downcast_ref::<&'static str>().unwrap(), "shallow");
    }

    #[test]
    fn match_info_reports_depth_and_offset() {
        let space = UrlSpace::new();
        let id = space.alloc();
        put(&space, id, "GET", "/a", "v", 0);

        let (_, info) = space
            .get(id, "GET", "/a/b/c", 0, SpaceOp::Default, None)
            .unwrap();
        assert!(!info.segment_match);
        assert_eq!(info.offset, 2); // "/a"

        let (_, info) = space.get(id, "GET", "/a", 0, SpaceOp::Default, None).unwrap();
        assert!(info.segment_match);
    }

    #[test]
    fn exact_op_ignores_inherited_entries() {
        let space = UrlSpace::new();
        let id = space.alloc();
        put(&space, id, "GET", "/a", "v", 0);

        assert!(space
            .get(id, "GET", "/a/b", 0, SpaceOp::Exact, None)
            .is_none());
    }

    #[test]
    fn walk_visits_all_entries_in_partition() {
        let space = UrlSpace::new();
        let id = space.alloc();
        put(&space, id, "GET", "/a", "v", 0);
        put(&space, id, "POST", "/a/b", "w", OP_NOINHERIT);

        let mut seen = Vec::new();
        space.walk(id, |method, url, _, _| {
            seen.push(format!("{method} {url}"));
        });
        seen.sort();
        assert_eq!(seen, vec!["GET /a", "POST /a/b"]);
    }
}
