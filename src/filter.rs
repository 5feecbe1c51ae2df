//! Connection filters, traces, and cleanups.
//!
//! Filters are an ordered list of `(when, method-glob, url-glob, proc)`
//! tuples consulted at four request phases. Traces run FIFO after a
//! successful response; cleanups run LIFO at connection teardown no matter
//! the outcome.

use crate::conn::Conn;
use crate::dispatch::ReturnCode;
use crate::strmatch::glob_match;
use std::sync::{Arc, Mutex, RwLock};

/// Request phase a filter is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterWhen {
    PreAuth,
    PostAuth,
    Trace,
    VoidTrace,
}

/// What a filter asks the dispatcher to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// Continue with the next filter.
    Ok,
    /// Stop the chain; the dispatcher proceeds normally.
    Break,
    /// Stop the chain and short-circuit the request.
    Return,
    /// Stop the chain with an error.
    Error,
}

pub type FilterProc = Arc<dyn Fn(&mut Conn, FilterWhen) -> FilterStatus + Send + Sync>;
pub type TraceProc = Arc<dyn Fn(&mut Conn) + Send + Sync>;

struct Filter {
    method: String,
    url: String,
    when: FilterWhen,
    proc: FilterProc,
}

struct Trace {
    proc: TraceProc,
}

#[derive(Default)]
struct Chains {
    filters: Vec<Filter>,
    traces: Vec<Trace>,
    cleanups: Vec<Trace>,
}

// The configured locking mode for the filter chain. Registration always
// takes the write side; traversal takes the read side, which with `Rw`
// lets concurrent requests evaluate filters in parallel.
enum Store {
    Plain(Mutex<Chains>),
    Rw(RwLock<Chains>),
}

impl Store {
    fn read<R>(&self, f: impl FnOnce(&Chains) -> R) -> R {
        match self {
            Store::Plain(m) => f(&m.lock().unwrap_or_else(|e| e.into_inner())),
            Store::Rw(l) => f(&l.read().unwrap_or_else(|e| e.into_inner())),
        }
    }

    fn write<R>(&self, f: impl FnOnce(&mut Chains) -> R) -> R {
        match self {
            Store::Plain(m) => f(&mut m.lock().unwrap_or_else(|e| e.into_inner())),
            Store::Rw(l) => f(&mut l.write().unwrap_or_else(|e| e.into_inner())),
        }
    }
}

/// Per-server filter, trace, and cleanup registry.
pub struct FilterTables {
    store: Store,
}

impl FilterTables {
    pub fn new(rwlocks: bool) -> FilterTables {
        let store = if rwlocks {
            Store::Rw(RwLock::new(Chains::default()))
        } else {
            Store::Plain(Mutex::new(Chains::default()))
        };
        FilterTables { store }
    }

    /// Registers a filter for a method/URL glob pair. `first` prepends the
    /// filter; otherwise it is appended.
    pub fn register_filter(
        &self,
        method: &str,
        url: &str,
        when: FilterWhen,
        first: bool,
        proc: FilterProc,
    ) {
        let filter = Filter {
            method: method.to_string(),
            url: url.to_string(),
            when,
            proc,
        };
        self.store.write(|chains| {
            if first {
                chains.filters.insert(0, filter);
            } else {
                chains.filters.push(filter);
            }
        });
    }

    /// Registers a trace, run in FIFO order after successful responses.
    pub fn register_trace(&self, proc: TraceProc) {
        self.store.write(|chains| chains.traces.push(Trace { proc }));
    }

    /// Registers a cleanup, run in LIFO order at connection end regardless
    /// of the outcome.
    pub fn register_cleanup(&self, proc: TraceProc) {
        self.store
            .write(|chains| chains.cleanups.push(Trace { proc }));
    }

    /// Executes the filters registered for `why` in registration order.
    pub fn run_filters(&self, conn: &mut Conn, why: FilterWhen) -> ReturnCode {
        if conn.request.method.is_empty() {
            return ReturnCode::Ok;
        }

        // Snapshot matching procs so user code never runs under the chain
        // lock.
        let matching: Vec<FilterProc> = self.store.read(|chains| {
            chains
                .filters
                .iter()
                .filter(|f| {
                    f.when == why
                        && glob_match(&f.method, &conn.request.method)
                        && glob_match(&f.url, &conn.request.url)
                })
                .map(|f| f.proc.clone())
                .collect()
        });

        let mut status = FilterStatus::Ok;
        for proc in matching {
            status = proc(conn, why);
            if status != FilterStatus::Ok {
                break;
            }
        }

        match status {
            FilterStatus::Ok | FilterStatus::Break => ReturnCode::Ok,
            FilterStatus::Return if why == FilterWhen::Trace => ReturnCode::Ok,
            FilterStatus::Return => ReturnCode::FilterReturn,
            FilterStatus::Error => ReturnCode::Error,
        }
    }

    /// Runs traces in FIFO registration order.
    pub fn run_traces(&self, conn: &mut Conn) {
        let traces: Vec<TraceProc> =
            self.store.read(|chains| chains.traces.iter().map(|t| t.proc.clone()).collect());
        for proc in traces {
            proc(conn);
        }
    }

    /// Runs cleanups in LIFO registration order.
    pub fn run_cleanups(&self, conn: &mut Conn) {
        let cleanups: Vec<TraceProc> = self.store.read(|chains| {
            chains
                .cleanups
                .iter()
                .rev()
                .map(|t| t.proc.clone())
                .collect()
        });
        for proc in cleanups {
            proc(conn);
        }
    }

    /// Returns `(method, url, phase)` descriptions of registered filters.
    pub fn describe_filters(&self) -> Vec<(String, String, &'static str)> {
        self.store.read(|chains| {
            chains
                .filters
                .iter()
                .map(|f| {
                    let phase = match f.when {
                        FilterWhen::PreAuth => "preauth",
                        FilterWhen::PostAuth => "postauth",
                        FilterWhen::Trace | FilterWhen::VoidTrace => "trace",
                    };
                    (f.method.clone(), f.url.clone(), phase)
                })
                .collect()
        })
    }
}
