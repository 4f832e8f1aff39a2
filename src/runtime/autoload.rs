//! Lazily loaded constants.
//!
//! An autoload leaves a pending marker in the constant table and a record in
//! the node's autoload table. The first thread to read the constant claims the
//! record and runs the loader with no runtime locks held; every other reader
//! blocks on the record until the load finishes and then sees the same result.
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

use crate::runtime::Runtime;
use crate::runtime::arena::NodeId;
use crate::runtime::constant::ConstantEntry;
use crate::runtime::error::{ModelError, ModelResult};
use crate::runtime::identifier;
use crate::runtime::value::Value;
use crate::symbol::Symbol;

/// Loads the code behind an autoload path.
pub trait Loader: Send + Sync {
    /// Whether `path` was loaded before; a loaded path is not loaded again.
    fn already_loaded(&self, path: &str) -> bool;

    /// Loads `path`. The loader is expected to define the pending constant
    /// through the runtime it is handed.
    fn load(&self, runtime: &Runtime, path: &str) -> ModelResult<()>;
}

/// Loader for runtimes without a file system: every load fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLoader;

impl Loader for NullLoader {
    fn already_loaded(&self, _path: &str) -> bool {
        false
    }

    fn load(&self, _runtime: &Runtime, path: &str) -> ModelResult<()> {
        Err(ModelError::LoadFailed {
            path: path.to_string(),
            message: "cannot load such file".to_string(),
        })
    }
}

pub(crate) struct Autoload {
    path: Arc<str>,
    state: Mutex<AutoloadState>,
    finished: Condvar,
}

#[derive(Default)]
struct AutoloadState {
    /// Thread running the loader.
    owner: Option<ThreadId>,
    /// Value assigned by the loading thread before the load completes.
    value: Option<Value>,
    outcome: Option<ModelResult<()>>,
}

impl Autoload {
    fn new(path: &str) -> Self {
        Self {
            path: Arc::from(path),
            state: Mutex::default(),
            finished: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AutoloadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Claim {
    Load,
    Partial(Option<Value>),
    Finished(ModelResult<()>),
}

impl Runtime {
    /// Registers `path` to be loaded on first access of constant `name` in `id`.
    /// Ignored when `name` is already bound.
    pub fn autoload(&self, id: NodeId, name: &str, path: &str) -> ModelResult<()> {
        if path.is_empty() {
            return Err(ModelError::EmptyAutoloadPath);
        }
        let symbol = identifier::constant_name(self, name)?;
        self.check_frozen(id)?;
        let node = self.node(id);
        let mut state = node.write();
        if state.constants.contains_key(&symbol) {
            return Ok(());
        }
        state
            .constants
            .insert(symbol.clone(), ConstantEntry::new(None));
        state.autoloads.insert(symbol, Arc::new(Autoload::new(path)));
        drop(state);
        debug!(constant = %self.qualified_name(id, name), path, "registered autoload");
        Ok(())
    }

    /// Path of the pending autoload for `name` in `id` or its ancestors.
    pub fn autoload_path(&self, id: NodeId, name: &str) -> Option<String> {
        let symbol = self.intern(name);
        self.ancestors(id).into_iter().find_map(|owner| {
            self.node(owner)
                .read()
                .autoloads
                .get(&symbol)
                .map(|record| record.path.to_string())
        })
    }

    fn autoload_record(&self, id: NodeId, name: &Symbol) -> Option<Arc<Autoload>> {
        self.node(id).read().autoloads.get(name).cloned()
    }

    /// Stores `value` as the partial result when the current thread is
    /// loading `name`. Returns false when no such load is running.
    pub(crate) fn set_autoloading_value(&self, id: NodeId, name: &Symbol, value: &Value) -> bool {
        let Some(record) = self.autoload_record(id, name) else {
            return false;
        };
        let mut state = record.lock();
        if state.outcome.is_none() && state.owner == Some(thread::current().id()) {
            state.value = Some(value.clone());
            true
        } else {
            false
        }
    }

    /// Resolves the pending constant `name` in `owner`.
    pub(crate) fn resolve_autoload(&self, owner: NodeId, name: &Symbol) -> ModelResult<Option<Value>> {
        let Some(record) = self.autoload_record(owner, name) else {
            return Ok(self.bound_constant(owner, name));
        };
        match self.claim(&record) {
            Claim::Partial(value) => Ok(value),
            Claim::Finished(Ok(())) => Ok(self.bound_constant(owner, name)),
            Claim::Finished(Err(error)) => Err(error),
            Claim::Load => self.run_autoload(owner, name, &record),
        }
    }

    /// The value bound to `name` in `owner`, without triggering an autoload.
    pub(crate) fn bound_constant(&self, owner: NodeId, name: &Symbol) -> Option<Value> {
        self.node(owner)
            .read()
            .constants
            .get(name)
            .and_then(|entry| entry.value.clone())
    }

    fn claim(&self, record: &Autoload) -> Claim {
        let current = thread::current().id();
        let mut state = record.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return Claim::Finished(outcome.clone());
            }
            match state.owner {
                None => {
                    state.owner = Some(current);
                    return Claim::Load;
                }
                Some(owner) if owner == current => return Claim::Partial(state.value.clone()),
                Some(_) => {
                    state = record
                        .finished
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn run_autoload(&self, owner: NodeId, name: &Symbol, record: &Arc<Autoload>) -> ModelResult<Option<Value>> {
        let path = Arc::clone(&record.path);
        let result = if self.loader.already_loaded(&path) {
            Ok(())
        } else {
            debug!(constant = %self.qualified_name(owner, name.as_str()), path = %path, "loading autoload");
            self.loader.load(self, &path)
        };

        let mut state = record.lock();
        let value = state.value.take();
        {
            let node = self.node(owner);
            let mut table = node.write();
            let registered = table
                .autoloads
                .get(name)
                .is_some_and(|current| Arc::ptr_eq(current, record));
            if registered {
                table.autoloads.remove(name);
                match (&result, &value) {
                    (Ok(()), Some(value)) => {
                        if let Some(entry) = table.constants.get_mut(name) {
                            entry.value = Some(value.clone());
                        }
                    }
                    _ => {
                        table.constants.remove(name);
                    }
                }
            }
        }
        state.owner = None;
        state.outcome = Some(result.clone());
        record.finished.notify_all();
        drop(state);

        match result {
            Ok(()) => Ok(value.or_else(|| self.bound_constant(owner, name))),
            Err(error) => {
                warn!(
                    constant = %self.qualified_name(owner, name.as_str()),
                    path = %path,
                    %error,
                    "autoload failed"
                );
                Err(error)
            }
        }
    }
}
