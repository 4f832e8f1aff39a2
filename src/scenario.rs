//! YAML scenarios that drive the runtime API step by step.
//!
//! A scenario lists steps (`op: include`, `op: call`, ...) and optional
//! `files` that autoloads can load. Observable steps print one line each;
//! a step that fails prints `error[<kind>]: <message>` and the scenario
//! continues.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::runtime::{
    Frame, Loader, MethodBody, ModelError, ModelResult, NativeMethod, NodeId, Runtime, Scope,
    Value, Visibility,
};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Parsing scenario: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Unknown scope '{0}'")]
    UnknownScope(String),
    #[error("'{0}' does not name a class or module")]
    NotANode(String),
    #[error(transparent)]
    Model(#[from] ModelError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub config: RuntimeConfig,
    /// Load path -> steps run when an autoload loads that path.
    #[serde(default)]
    pub files: BTreeMap<String, Vec<Step>>,
    pub steps: Vec<Step>,
}

/// A scalar written in YAML. Strings starting with `:` become symbols and
/// `~` becomes nil.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityName {
    #[default]
    Public,
    Protected,
    Private,
}

impl From<VisibilityName> for Visibility {
    fn from(name: VisibilityName) -> Self {
        match name {
            VisibilityName::Public => Visibility::Public,
            VisibilityName::Protected => Visibility::Protected,
            VisibilityName::Private => Visibility::Private,
        }
    }
}

/// A method defined inside a `refine` step.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefinedMethod {
    pub method: String,
    #[serde(default)]
    pub returns: Option<Literal>,
    #[serde(default, rename = "super")]
    pub call_super: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
    DefineClass {
        name: String,
        #[serde(default)]
        superclass: Option<String>,
        #[serde(default)]
        under: Option<String>,
    },
    DefineModule {
        name: String,
        #[serde(default)]
        under: Option<String>,
    },
    Include {
        target: String,
        module: String,
    },
    Prepend {
        target: String,
        module: String,
    },
    Extend {
        target: String,
        module: String,
    },
    /// Defines a method returning `returns`; with `super: true` the result is
    /// `returns` followed by whatever `super` yields.
    Def {
        target: String,
        method: String,
        #[serde(default)]
        returns: Option<Literal>,
        #[serde(default, rename = "super")]
        call_super: bool,
        #[serde(default)]
        visibility: VisibilityName,
        #[serde(default)]
        singleton: bool,
    },
    Undef {
        target: String,
        method: String,
    },
    Remove {
        target: String,
        method: String,
    },
    Alias {
        target: String,
        new: String,
        old: String,
    },
    Visibility {
        target: String,
        methods: Vec<String>,
        visibility: VisibilityName,
    },
    ModuleFunction {
        module: String,
        methods: Vec<String>,
    },
    Refine {
        host: String,
        target: String,
        #[serde(default)]
        methods: Vec<RefinedMethod>,
    },
    Using {
        cref: String,
        module: String,
    },
    /// Names a lexical scope for later `call` and `const_get` steps.
    Scope {
        name: String,
        cref: String,
        #[serde(default)]
        parent: Option<String>,
    },
    Call {
        target: String,
        method: String,
        #[serde(default)]
        class_method: bool,
        #[serde(default)]
        send: bool,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        args: Vec<Literal>,
    },
    Ancestors {
        target: String,
    },
    InstanceMethods {
        target: String,
        #[serde(default)]
        own: bool,
    },
    MethodDefined {
        target: String,
        method: String,
    },
    ConstSet {
        #[serde(default)]
        target: Option<String>,
        name: String,
        value: Option<Literal>,
    },
    /// Qualified lookup from `target`, or lexical lookup when `scope` is set.
    ConstGet {
        #[serde(default)]
        target: Option<String>,
        path: String,
        #[serde(default)]
        scope: Option<String>,
    },
    ConstDefined {
        #[serde(default)]
        target: Option<String>,
        path: String,
    },
    RemoveConst {
        #[serde(default)]
        target: Option<String>,
        name: String,
    },
    PrivateConstant {
        target: String,
        names: Vec<String>,
    },
    DeprecateConstant {
        target: String,
        names: Vec<String>,
    },
    Constants {
        target: String,
        #[serde(default)]
        inherit: bool,
    },
    Autoload {
        #[serde(default)]
        target: Option<String>,
        name: String,
        path: String,
    },
    /// Prints the paths loaded so far, in load order.
    Loads,
    CvarSet {
        target: String,
        name: String,
        value: Option<Literal>,
    },
    CvarGet {
        target: String,
        name: String,
    },
    Freeze {
        target: String,
    },
    Synchronize {
        target: String,
    },
    Profile {
        target: String,
    },
    ProfileReport {
        target: String,
    },
}

impl Scenario {
    pub fn from_yaml_str(source: &str) -> Result<Self, ScenarioError> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Runs every step on a fresh runtime and returns the printed lines.
    pub fn run(&self) -> Result<String, ScenarioError> {
        let shared = Arc::new(Shared {
            files: self.files.clone(),
            loaded: Mutex::default(),
            lines: Mutex::default(),
        });
        let loader = ScenarioLoader {
            shared: Arc::clone(&shared),
        };
        let runtime = Runtime::with_config(self.config.clone(), Arc::new(loader));
        let mut session = Session::new(&runtime, &shared);
        for step in &self.steps {
            session.execute(step)?;
        }
        Ok(shared.output())
    }
}

/// Parses and runs a scenario.
pub fn run_scenario(source: &str) -> Result<String, ScenarioError> {
    Scenario::from_yaml_str(source)?.run()
}

struct Shared {
    files: BTreeMap<String, Vec<Step>>,
    loaded: Mutex<Vec<String>>,
    lines: Mutex<Vec<String>>,
}

impl Shared {
    fn emit(&self, line: String) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    fn output(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let mut output = lines.join("\n");
        if !output.is_empty() {
            output.push('\n');
        }
        output
    }
}

/// Loads scenario `files` by running their steps against the loading runtime.
pub struct ScenarioLoader {
    shared: Arc<Shared>,
}

impl Loader for ScenarioLoader {
    fn already_loaded(&self, path: &str) -> bool {
        self.shared
            .loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|loaded| loaded == path)
    }

    fn load(&self, runtime: &Runtime, path: &str) -> ModelResult<()> {
        let Some(steps) = self.shared.files.get(path) else {
            return Err(ModelError::LoadFailed {
                path: path.to_string(),
                message: "cannot load such file".to_string(),
            });
        };
        self.shared
            .loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_string());
        debug!(path, steps = steps.len(), "loading scenario file");
        let mut session = Session::new(runtime, &self.shared);
        for step in steps {
            session
                .run_step(step)
                .map_err(|error| ModelError::LoadFailed {
                    path: path.to_string(),
                    message: error.to_string(),
                })?;
        }
        Ok(())
    }
}

struct Session<'a> {
    runtime: &'a Runtime,
    shared: &'a Shared,
    scopes: HashMap<String, Arc<Scope>>,
}

impl<'a> Session<'a> {
    fn new(runtime: &'a Runtime, shared: &'a Shared) -> Self {
        let scopes = HashMap::from([("top".to_string(), Scope::top(runtime.object()))]);
        Self {
            runtime,
            shared,
            scopes,
        }
    }

    fn execute(&mut self, step: &Step) -> Result<(), ScenarioError> {
        match self.run_step(step) {
            Err(ScenarioError::Model(error)) => {
                self.shared
                    .emit(format!("error[{}]: {error}", error.kind().label()));
                Ok(())
            }
            other => other,
        }
    }

    fn node(&self, path: &str) -> Result<NodeId, ScenarioError> {
        self.runtime
            .const_get(self.runtime.object(), path)?
            .as_module()
            .ok_or_else(|| ScenarioError::NotANode(path.to_string()))
    }

    fn namespace(&self, path: Option<&str>) -> Result<NodeId, ScenarioError> {
        match path {
            Some(path) => self.node(path),
            None => Ok(self.runtime.object()),
        }
    }

    fn scope(&self, name: &str) -> Result<Arc<Scope>, ScenarioError> {
        self.scopes
            .get(name)
            .cloned()
            .ok_or_else(|| ScenarioError::UnknownScope(name.to_string()))
    }

    fn value(&self, literal: Option<&Literal>) -> Value {
        match literal {
            None => Value::Nil,
            Some(Literal::Bool(value)) => Value::Bool(*value),
            Some(Literal::Int(value)) => Value::Int(*value),
            Some(Literal::Str(text)) => match text.strip_prefix(':') {
                Some(name) if !name.is_empty() => Value::Sym(self.runtime.intern(name)),
                _ => Value::str(text.as_str()),
            },
        }
    }

    fn names(&self, ids: &[NodeId]) -> String {
        ids.iter()
            .map(|&id| self.runtime.name(id))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn run_step(&mut self, step: &Step) -> Result<(), ScenarioError> {
        let runtime = self.runtime;
        match step {
            Step::DefineClass {
                name,
                superclass,
                under,
            } => {
                let superclass = superclass.as_deref().map(|path| self.node(path)).transpose()?;
                let under = under.as_deref().map(|path| self.node(path)).transpose()?;
                runtime.define_class(name, superclass, under)?;
            }
            Step::DefineModule { name, under } => {
                let under = under.as_deref().map(|path| self.node(path)).transpose()?;
                runtime.define_module(name, under)?;
            }
            Step::Include { target, module } => {
                runtime.include_module(self.node(target)?, self.node(module)?)?;
            }
            Step::Prepend { target, module } => {
                runtime.prepend_module(self.node(target)?, self.node(module)?)?;
            }
            Step::Extend { target, module } => {
                runtime.extend_object(self.node(target)?, self.node(module)?)?;
            }
            Step::Def {
                target,
                method,
                returns,
                call_super,
                visibility,
                singleton,
            } => {
                let mut owner = self.node(target)?;
                if *singleton {
                    owner = runtime.singleton_class(owner);
                }
                let body = scripted_body(self.value(returns.as_ref()), *call_super);
                runtime.define_method(owner, method, body, (*visibility).into())?;
            }
            Step::Undef { target, method } => runtime.undef_method(self.node(target)?, method)?,
            Step::Remove { target, method } => runtime.remove_method(self.node(target)?, method)?,
            Step::Alias { target, new, old } => {
                runtime.alias_method(self.node(target)?, new, old)?;
            }
            Step::Visibility {
                target,
                methods,
                visibility,
            } => {
                let methods = methods.iter().map(String::as_str).collect::<Vec<_>>();
                runtime.set_visibility(self.node(target)?, &methods, (*visibility).into())?;
            }
            Step::ModuleFunction { module, methods } => {
                let methods = methods.iter().map(String::as_str).collect::<Vec<_>>();
                runtime.module_function(self.node(module)?, &methods)?;
            }
            Step::Refine {
                host,
                target,
                methods,
            } => {
                let bodies = methods
                    .iter()
                    .map(|spec| {
                        (
                            spec.method.clone(),
                            scripted_body(self.value(spec.returns.as_ref()), spec.call_super),
                        )
                    })
                    .collect::<Vec<_>>();
                runtime.refine(self.node(host)?, self.node(target)?, |runtime, refinement| {
                    for (name, body) in bodies {
                        runtime.define_method(refinement, &name, body, Visibility::Public)?;
                    }
                    Ok(())
                })?;
            }
            Step::Using { cref, module } => runtime.using(self.node(cref)?, self.node(module)?)?,
            Step::Scope { name, cref, parent } => {
                let parent = self.scope(parent.as_deref().unwrap_or("top"))?;
                let scope = parent.nest(self.node(cref)?);
                self.scopes.insert(name.clone(), scope);
            }
            Step::Call {
                target,
                method,
                class_method,
                send,
                scope,
                args,
            } => {
                let class = self.node(target)?;
                let (receiver, label) = if *class_method {
                    (Value::Module(class), target.clone())
                } else {
                    (runtime.new_instance(class)?, format!("{target}.new"))
                };
                let frame = Frame::new(self.scope(scope.as_deref().unwrap_or("top"))?);
                let args = args
                    .iter()
                    .map(|literal| self.value(Some(literal)))
                    .collect::<Vec<_>>();
                let result = if *send {
                    runtime.send_method(&frame, &receiver, method, &args)?
                } else {
                    runtime.call_method(&frame, &receiver, method, &args)?
                };
                self.shared
                    .emit(format!("{label}.{method} => {}", runtime.inspect(&result)));
            }
            Step::Ancestors { target } => {
                let ancestors = runtime.ancestors(self.node(target)?);
                self.shared
                    .emit(format!("ancestors({target}) = [{}]", self.names(&ancestors)));
            }
            Step::InstanceMethods { target, own } => {
                let names = runtime
                    .instance_methods(self.node(target)?, !*own, None)
                    .iter()
                    .map(|name| name.as_str().to_string())
                    .collect::<Vec<_>>();
                self.shared
                    .emit(format!("instance_methods({target}) = [{}]", names.join(", ")));
            }
            Step::MethodDefined { target, method } => {
                let defined = runtime.method_defined(self.node(target)?, method);
                self.shared
                    .emit(format!("method_defined({target}, {method}) = {defined}"));
            }
            Step::ConstSet {
                target,
                name,
                value,
            } => {
                let namespace = self.namespace(target.as_deref())?;
                runtime.const_set(namespace, name, self.value(value.as_ref()))?;
            }
            Step::ConstGet {
                target,
                path,
                scope,
            } => {
                let value = match scope {
                    Some(scope) => runtime.const_get_lexical(&*self.scope(scope)?, path)?,
                    None => runtime.const_get(self.namespace(target.as_deref())?, path)?,
                };
                self.shared
                    .emit(format!("{path} = {}", runtime.inspect(&value)));
            }
            Step::ConstDefined { target, path } => {
                let defined = runtime.const_defined(self.namespace(target.as_deref())?, path)?;
                self.shared.emit(format!("const_defined({path}) = {defined}"));
            }
            Step::RemoveConst { target, name } => {
                let removed = runtime.remove_const(self.namespace(target.as_deref())?, name)?;
                self.shared
                    .emit(format!("removed {name} = {}", runtime.inspect(&removed)));
            }
            Step::PrivateConstant { target, names } => {
                let names = names.iter().map(String::as_str).collect::<Vec<_>>();
                runtime.private_constant(self.node(target)?, &names)?;
            }
            Step::DeprecateConstant { target, names } => {
                let names = names.iter().map(String::as_str).collect::<Vec<_>>();
                runtime.deprecate_constant(self.node(target)?, &names)?;
            }
            Step::Constants { target, inherit } => {
                let names = runtime
                    .constants(self.node(target)?, *inherit)
                    .iter()
                    .map(|name| name.as_str().to_string())
                    .collect::<Vec<_>>();
                self.shared
                    .emit(format!("constants({target}) = [{}]", names.join(", ")));
            }
            Step::Autoload { target, name, path } => {
                runtime.autoload(self.namespace(target.as_deref())?, name, path)?;
            }
            Step::Loads => {
                let loaded = self
                    .shared
                    .loaded
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .join(", ");
                self.shared.emit(format!("loads = [{loaded}]"));
            }
            Step::CvarSet {
                target,
                name,
                value,
            } => {
                runtime.class_variable_set(self.node(target)?, name, self.value(value.as_ref()))?;
            }
            Step::CvarGet { target, name } => {
                let value = runtime.class_variable_get(self.node(target)?, name)?;
                self.shared
                    .emit(format!("{target}.{name} = {}", runtime.inspect(&value)));
            }
            Step::Freeze { target } => runtime.freeze(self.node(target)?),
            Step::Synchronize { target } => runtime.become_synchronized(self.node(target)?),
            Step::Profile { target } => {
                runtime.enable_profiling(self.node(target)?);
            }
            Step::ProfileReport { target } => {
                let counts = runtime
                    .call_profile(self.node(target)?)
                    .map(|profile| profile.snapshot())
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(name, count)| format!("{name}: {count}"))
                    .collect::<Vec<_>>();
                self.shared
                    .emit(format!("profile({target}) = {{{}}}", counts.join(", ")));
            }
        }
        Ok(())
    }
}

fn scripted_body(value: Value, call_super: bool) -> Arc<dyn MethodBody> {
    if !call_super {
        return NativeMethod::returning(value);
    }
    NativeMethod::new(move |invocation| {
        let above = invocation.call_super(invocation.args)?;
        let runtime = invocation.runtime;
        Ok(Value::str(format!(
            "{}{}",
            display(runtime, &value),
            display(runtime, &above)
        )))
    })
}

fn display(runtime: &Runtime, value: &Value) -> String {
    match value {
        Value::Str(text) => text.to_string(),
        other => runtime.inspect(other),
    }
}
