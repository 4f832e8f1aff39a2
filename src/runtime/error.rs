use thiserror::Error;

/// Coarse classification of [`ModelError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The hierarchy would become invalid (cycles, frozen nodes, wrong node kinds).
    Structural,
    /// A method, constant or class variable name could not be resolved or is malformed.
    Name,
    /// A loader failed while resolving an autoload constant.
    Autoload,
    /// A definition was called with malformed arguments.
    Argument,
}

impl ErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Structural => "structural",
            ErrorKind::Name => "name",
            ErrorKind::Autoload => "autoload",
            ErrorKind::Argument => "argument",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("cyclic include detected: {module} already includes {target}")]
    CyclicInclude { module: String, target: String },
    #[error("cyclic prepend detected: {module} already includes {target}")]
    CyclicPrepend { module: String, target: String },
    #[error("wrong argument type {found} (expected {expected})")]
    WrongArgumentType { found: String, expected: String },
    #[error("can't modify frozen {kind}: {name}")]
    Frozen { kind: String, name: String },
    #[error("can't refine refinement module {name}")]
    RefineRefinement { name: String },
    #[error("Refinement {name} cannot be included or prepended")]
    IncludeRefinement { name: String },
    #[error("superclass mismatch for class {name}")]
    SuperclassMismatch { name: String },
    #[error("{name} is not a class")]
    NotAClass { name: String },
    #[error("{name} is not a module")]
    NotAModule { name: String },

    #[error("undefined method '{method}' for {kind} '{owner}'")]
    UndefinedMethod {
        method: String,
        kind: String,
        owner: String,
    },
    #[error("method '{method}' not defined in {owner}")]
    MethodNotDefined { method: String, owner: String },
    #[error("undefined method '{method}' for {receiver}")]
    NoMethod { method: String, receiver: String },
    #[error("private method '{method}' called for {receiver}")]
    PrivateMethodCalled { method: String, receiver: String },
    #[error("super: no superclass method '{method}' for {receiver}")]
    NoSuperMethod { method: String, receiver: String },
    #[error("Method '{method}' expected {expected} arguments, got {found}")]
    ArityMismatch {
        method: String,
        expected: usize,
        found: usize,
    },

    #[error("uninitialized constant {name}")]
    UninitializedConstant { name: String },
    #[error("constant {name} not defined")]
    ConstantNotDefined { name: String },
    #[error("cannot remove {name}")]
    CannotRemoveConstant { name: String },
    #[error("wrong constant name {name}")]
    WrongConstantName { name: String },
    #[error("{name} does not refer to class/module")]
    NotAClassOrModule { name: String },
    #[error("private constant {name} referenced")]
    PrivateConstant { name: String },

    #[error("uninitialized class variable {name} in {owner}")]
    UninitializedClassVariable { name: String, owner: String },
    #[error("class variable {name} not defined for {owner}")]
    ClassVariableNotDefined { name: String, owner: String },
    #[error("cannot remove {name} for {owner}")]
    CannotRemoveClassVariable { name: String, owner: String },
    #[error("'{name}' is not allowed as a class variable name")]
    WrongClassVariableName { name: String },

    #[error("cannot load such file -- {path}: {message}")]
    LoadFailed { path: String, message: String },

    #[error("empty file name")]
    EmptyAutoloadPath,
    #[error("invalid argument for {operation}: {message}")]
    InvalidArgument { operation: String, message: String },
}

impl ModelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelError::CyclicInclude { .. }
            | ModelError::CyclicPrepend { .. }
            | ModelError::WrongArgumentType { .. }
            | ModelError::Frozen { .. }
            | ModelError::RefineRefinement { .. }
            | ModelError::IncludeRefinement { .. }
            | ModelError::SuperclassMismatch { .. }
            | ModelError::NotAClass { .. }
            | ModelError::NotAModule { .. } => ErrorKind::Structural,
            ModelError::UndefinedMethod { .. }
            | ModelError::MethodNotDefined { .. }
            | ModelError::NoMethod { .. }
            | ModelError::PrivateMethodCalled { .. }
            | ModelError::NoSuperMethod { .. }
            | ModelError::UninitializedConstant { .. }
            | ModelError::ConstantNotDefined { .. }
            | ModelError::CannotRemoveConstant { .. }
            | ModelError::WrongConstantName { .. }
            | ModelError::NotAClassOrModule { .. }
            | ModelError::PrivateConstant { .. }
            | ModelError::UninitializedClassVariable { .. }
            | ModelError::ClassVariableNotDefined { .. }
            | ModelError::CannotRemoveClassVariable { .. }
            | ModelError::WrongClassVariableName { .. } => ErrorKind::Name,
            ModelError::LoadFailed { .. } => ErrorKind::Autoload,
            ModelError::ArityMismatch { .. }
            | ModelError::EmptyAutoloadPath
            | ModelError::InvalidArgument { .. } => ErrorKind::Argument,
        }
    }

    pub(crate) fn expect_arity(method: &str, expected: usize, found: usize) -> Result<(), Self> {
        if expected == found {
            Ok(())
        } else {
            Err(ModelError::ArityMismatch {
                method: method.to_string(),
                expected,
                found,
            })
        }
    }
}

pub type ModelResult<T> = Result<T, ModelError>;
