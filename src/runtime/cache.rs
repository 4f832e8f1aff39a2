use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::runtime::arena::NodeId;
use crate::runtime::error::ModelResult;
use crate::runtime::method::{Invocation, MethodBody, MethodEntry};
use crate::runtime::value::Value;
use crate::symbol::Symbol;

/// A resolved lookup: the method, the node that supplied it, and the
/// generation of the searched node when the walk began.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    method: MethodEntry,
    source: NodeId,
    token: u64,
}

impl CacheEntry {
    pub fn new(method: MethodEntry, source: NodeId, token: u64) -> Self {
        Self {
            method,
            source,
            token,
        }
    }

    pub fn method(&self) -> &MethodEntry {
        &self.method
    }

    pub fn source(&self) -> NodeId {
        self.source
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn is_valid_for(&self, generation: u64) -> bool {
        self.token == generation
    }

    pub(crate) fn into_method(self) -> MethodEntry {
        self.method
    }
}

/// Builds cache entries on the miss path. Factories chain: each wraps the
/// entry produced by the one it was installed over.
pub trait CacheEntryFactory: Send + Sync {
    fn new_entry(&self, method: MethodEntry, source: NodeId, token: u64) -> CacheEntry;
}

#[derive(Debug, Default)]
pub struct DefaultCacheEntryFactory;

impl CacheEntryFactory for DefaultCacheEntryFactory {
    fn new_entry(&self, method: MethodEntry, source: NodeId, token: u64) -> CacheEntry {
        CacheEntry::new(method, source, token)
    }
}

/// Serializes execution of every method resolved through one node.
pub struct SynchronizedCacheEntryFactory {
    previous: Arc<dyn CacheEntryFactory>,
    monitor: Arc<Monitor>,
}

impl SynchronizedCacheEntryFactory {
    pub fn new(previous: Arc<dyn CacheEntryFactory>) -> Self {
        Self {
            previous,
            monitor: Arc::new(Monitor::default()),
        }
    }
}

impl CacheEntryFactory for SynchronizedCacheEntryFactory {
    fn new_entry(&self, method: MethodEntry, source: NodeId, token: u64) -> CacheEntry {
        let entry = self.previous.new_entry(method, source, token);
        let monitor = &self.monitor;
        let method = entry.method.map_body(&|_, body| {
            Arc::new(SynchronizedBody {
                body,
                monitor: Arc::clone(monitor),
            }) as Arc<dyn MethodBody>
        });
        CacheEntry::new(method, entry.source, entry.token)
    }
}

/// Counts calls of every method resolved through one node.
pub struct ProfilingCacheEntryFactory {
    previous: Arc<dyn CacheEntryFactory>,
    profile: Arc<CallProfile>,
}

impl ProfilingCacheEntryFactory {
    pub fn new(previous: Arc<dyn CacheEntryFactory>, profile: Arc<CallProfile>) -> Self {
        Self { previous, profile }
    }
}

impl CacheEntryFactory for ProfilingCacheEntryFactory {
    fn new_entry(&self, method: MethodEntry, source: NodeId, token: u64) -> CacheEntry {
        let entry = self.previous.new_entry(method, source, token);
        let profile = &self.profile;
        let method = entry.method.map_body(&|name, body| {
            Arc::new(ProfiledBody {
                body,
                name: name.clone(),
                profile: Arc::clone(profile),
            }) as Arc<dyn MethodBody>
        });
        CacheEntry::new(method, entry.source, entry.token)
    }
}

/// Per-name call counters collected by [`ProfilingCacheEntryFactory`].
#[derive(Default)]
pub struct CallProfile {
    counts: DashMap<Symbol, AtomicU64, FxBuildHasher>,
}

impl CallProfile {
    fn record(&self, name: &Symbol) {
        if let Some(counter) = self.counts.get(name) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counts
            .entry(name.clone())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counts
            .iter()
            .find(|entry| entry.key().as_str() == name)
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Call counts sorted by method name.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut counts = self
            .counts
            .iter()
            .map(|entry| {
                (
                    entry.key().as_str().to_string(),
                    entry.value().load(Ordering::Relaxed),
                )
            })
            .collect::<Vec<_>>();
        counts.sort();
        counts
    }
}

struct ProfiledBody {
    body: Arc<dyn MethodBody>,
    name: Symbol,
    profile: Arc<CallProfile>,
}

impl MethodBody for ProfiledBody {
    fn call(&self, invocation: &Invocation<'_>) -> ModelResult<Value> {
        self.profile.record(&self.name);
        self.body.call(invocation)
    }

    fn arity(&self) -> Option<usize> {
        self.body.arity()
    }
}

struct SynchronizedBody {
    body: Arc<dyn MethodBody>,
    monitor: Arc<Monitor>,
}

impl MethodBody for SynchronizedBody {
    fn call(&self, invocation: &Invocation<'_>) -> ModelResult<Value> {
        let _guard = self.monitor.enter();
        self.body.call(invocation)
    }

    fn arity(&self) -> Option<usize> {
        self.body.arity()
    }
}

/// Re-entrant lock: a synchronized method may call another one on the same node.
#[derive(Default)]
pub(crate) struct Monitor {
    state: Mutex<MonitorState>,
    released: Condvar,
}

#[derive(Default)]
struct MonitorState {
    owner: Option<ThreadId>,
    depth: usize,
}

impl Monitor {
    pub(crate) fn enter(&self) -> MonitorGuard<'_> {
        let current = thread::current().id();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match state.owner {
                None => {
                    state.owner = Some(current);
                    state.depth = 1;
                    break;
                }
                Some(owner) if owner == current => {
                    state.depth += 1;
                    break;
                }
                Some(_) => {
                    state = self
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        MonitorGuard { monitor: self }
    }
}

pub(crate) struct MonitorGuard<'a> {
    monitor: &'a Monitor,
}

impl Drop for MonitorGuard<'_> {
    fn drop(&mut self) {
        let mut state = self
            .monitor
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.monitor.released.notify_one();
        }
    }
}
