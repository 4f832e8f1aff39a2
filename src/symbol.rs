//! Identifier interning.
//!
//! Method, constant and class-variable names are interned once per runtime so
//! tables and caches key on a cheap integer identity instead of string bytes.
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

/// An interned identifier. Equality and hashing use the interned id only.
#[derive(Clone)]
pub struct Symbol {
    id: u32,
    name: Arc<str>,
}

impl Symbol {
    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Symbol {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name).then(self.id.cmp(&other.id))
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.name)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Thread-safe interner; concurrent `intern` calls for the same name agree on one id.
pub struct SymbolTable {
    by_name: DashMap<Arc<str>, Symbol, FxBuildHasher>,
    next_id: AtomicU32,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            by_name: DashMap::with_hasher(FxBuildHasher::default()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn intern(&self, name: &str) -> Symbol {
        if let Some(symbol) = self.by_name.get(name) {
            return symbol.clone();
        }
        let name: Arc<str> = Arc::from(name);
        self.by_name
            .entry(name.clone())
            .or_insert_with(|| Symbol {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                name,
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
