use crate::runtime::Runtime;
use crate::runtime::error::{ModelError, ModelResult};
use crate::symbol::Symbol;

pub(crate) fn is_constant_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|first| first.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn is_class_variable_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("@@") else {
        return false;
    };
    let mut chars = rest.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn constant_name(runtime: &Runtime, name: &str) -> ModelResult<Symbol> {
    if !is_constant_name(name) {
        return Err(ModelError::WrongConstantName {
            name: name.to_string(),
        });
    }
    Ok(runtime.intern(name))
}

pub(crate) fn class_variable_name(runtime: &Runtime, name: &str) -> ModelResult<Symbol> {
    if !is_class_variable_name(name) {
        return Err(ModelError::WrongClassVariableName {
            name: name.to_string(),
        });
    }
    Ok(runtime.intern(name))
}

pub(crate) fn method_name(runtime: &Runtime, name: &str) -> ModelResult<Symbol> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(ModelError::InvalidArgument {
            operation: "method definition".to_string(),
            message: format!("invalid method name '{name}'"),
        });
    }
    Ok(runtime.intern(name))
}
