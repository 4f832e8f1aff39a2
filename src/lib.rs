//! Class and module composition for a dynamic object runtime.
//!
//! [`runtime::Runtime`] models the class/module hierarchy: definitions,
//! include/prepend/extend, method tables and cached resolution, refinements
//! activated per lexical scope, constant namespaces with autoload, and class
//! variables. [`scenario`] drives the runtime from YAML scripts.
pub mod config;
pub mod runtime;
pub mod scenario;
pub mod symbol;

pub use config::{ConfigError, RuntimeConfig};
pub use runtime::{ModelError, ModelResult, NodeId, Runtime, Value};
pub use scenario::{Scenario, ScenarioError, run_scenario};
