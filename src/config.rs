//! Runtime configuration, loaded from YAML and overridable from the environment.
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Reading config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value '{value}' for {variable}, expected a boolean")]
    InvalidEnv { variable: String, value: String },
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Store negative lookups (the undefined sentinel) in method caches.
    pub cache_undefined: bool,
    /// Emit a warning when an initialized constant is reassigned.
    pub warn_on_constant_redefinition: bool,
    /// Install the synchronized cache-entry factory on every new class.
    pub synchronize_new_classes: bool,
    /// Install the profiling cache-entry factory on every new class or module.
    pub profile_methods: bool,
    /// Name of the root namespace class.
    pub root_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_undefined: true,
            warn_on_constant_redefinition: true,
            synchronize_new_classes: false,
            profile_methods: false,
            root_name: "Object".to_string(),
        }
    }
}

const ENV_PREFIX: &str = "MODGRAPH_";

impl RuntimeConfig {
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        if source.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&source)
    }

    /// Applies `MODGRAPH_*` environment variables on top of this configuration.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let flags: [(&str, &mut bool); 4] = [
            ("CACHE_UNDEFINED", &mut self.cache_undefined),
            (
                "WARN_ON_CONSTANT_REDEFINITION",
                &mut self.warn_on_constant_redefinition,
            ),
            ("SYNCHRONIZE_NEW_CLASSES", &mut self.synchronize_new_classes),
            ("PROFILE_METHODS", &mut self.profile_methods),
        ];
        for (suffix, slot) in flags {
            let variable = format!("{ENV_PREFIX}{suffix}");
            if let Some(value) = lookup(&variable) {
                *slot = parse_flag(&variable, &value)?;
            }
        }
        if let Some(root_name) = lookup(&format!("{ENV_PREFIX}ROOT_NAME"))
            && !root_name.is_empty()
        {
            self.root_name = root_name;
        }
        Ok(self)
    }
}

fn parse_flag(variable: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            variable: variable.to_string(),
            value: value.to_string(),
        }),
    }
}
