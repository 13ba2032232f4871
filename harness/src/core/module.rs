//! Typed module configuration, validated when it is built.
//!
//! A [`ModuleSchema`] lists every input variable a module accepts together with
//! the kind of value it expects. [`ModuleConfig`] can only be constructed
//! through [`ModuleConfigBuilder::build`], so a config that exists has already
//! been checked against its schema.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::retry_policy::RetryOverrides;
use crate::error::ConfigError;

/// Kind of value a module variable accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    String,
    Number,
    Bool,
    List,
    Map,
    /// No kind check (the module declares `any`).
    Any,
}

impl VarKind {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            VarKind::String => value.is_string(),
            VarKind::Number => value.is_number(),
            VarKind::Bool => value.is_boolean(),
            VarKind::List => value.is_array(),
            VarKind::Map => value.is_object(),
            VarKind::Any => !value.is_null(),
        }
    }
}

impl fmt::Display for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VarKind::String => "string",
            VarKind::Number => "number",
            VarKind::Bool => "bool",
            VarKind::List => "list",
            VarKind::Map => "map",
            VarKind::Any => "any",
        };
        f.write_str(name)
    }
}

/// Declaration of one module input variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VarSpec {
    pub kind: VarKind,
    #[serde(default)]
    pub required: bool,
}

/// Recognized variables of a module, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleSchema {
    variables: BTreeMap<String, VarSpec>,
}

impl ModuleSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, kind: VarKind) -> Self {
        self.variables
            .insert(name.to_string(), VarSpec { kind, required: true });
        self
    }

    pub fn optional(mut self, name: &str, kind: VarKind) -> Self {
        self.variables.insert(
            name.to_string(),
            VarSpec {
                kind,
                required: false,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&VarSpec> {
        self.variables.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VarSpec)> {
        self.variables.iter()
    }
}

/// Fully validated configuration for one module under test.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleConfig {
    label: String,
    module_dir: PathBuf,
    variables: BTreeMap<String, Value>,
    env: BTreeMap<String, String>,
    retry: RetryOverrides,
}

impl ModuleConfig {
    pub fn builder(module_dir: impl Into<PathBuf>, schema: ModuleSchema) -> ModuleConfigBuilder {
        let module_dir = module_dir.into();
        ModuleConfigBuilder {
            label: module_dir.display().to_string(),
            module_dir,
            schema,
            variables: BTreeMap::new(),
            env: BTreeMap::new(),
            retry: RetryOverrides::default(),
        }
    }

    /// Name used in logs and log file names (the case id when run by the driver).
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn module_dir(&self) -> &Path {
        &self.module_dir
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn retry(&self) -> &RetryOverrides {
        &self.retry
    }

    /// Render variables as `name=value` assignments. Strings are passed raw,
    /// everything else as JSON (which the tool parses as an expression).
    pub fn var_assignments(&self) -> Vec<String> {
        self.variables
            .iter()
            .map(|(name, value)| match value {
                Value::String(raw) => format!("{name}={raw}"),
                other => format!("{name}={other}"),
            })
            .collect()
    }
}

/// Accumulates module inputs; [`build`](Self::build) validates them.
#[derive(Debug, Clone)]
pub struct ModuleConfigBuilder {
    label: String,
    module_dir: PathBuf,
    schema: ModuleSchema,
    variables: BTreeMap<String, Value>,
    env: BTreeMap<String, String>,
    retry: RetryOverrides,
}

impl ModuleConfigBuilder {
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn vars<I, K>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.variables
            .extend(vars.into_iter().map(|(name, value)| (name.into(), value)));
        self
    }

    /// Later calls override earlier values for the same key.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(env.into_iter().map(|(key, value)| (key.into(), value.into())));
        self
    }

    pub fn retry(mut self, retry: RetryOverrides) -> Self {
        self.retry = retry;
        self
    }

    pub fn build(self) -> Result<ModuleConfig, ConfigError> {
        if self.module_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyModuleDir);
        }
        for (name, value) in &self.variables {
            let spec = self
                .schema
                .get(name)
                .ok_or_else(|| ConfigError::UnknownVariable { name: name.clone() })?;
            if !spec.kind.accepts(value) {
                return Err(ConfigError::KindMismatch {
                    name: name.clone(),
                    expected: spec.kind,
                    found: value.clone(),
                });
            }
        }
        if let Some((name, _)) = self
            .schema
            .iter()
            .find(|(name, spec)| spec.required && !self.variables.contains_key(*name))
        {
            return Err(ConfigError::MissingVariable { name: name.clone() });
        }
        if self.env.keys().any(|key| key.trim().is_empty()) {
            return Err(ConfigError::EmptyEnvKey);
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::InvalidRetry(
                "retry.max_attempts must be > 0".to_string(),
            ));
        }
        Ok(ModuleConfig {
            label: self.label,
            module_dir: self.module_dir,
            variables: self.variables,
            env: self.env,
            retry: self.retry,
        })
    }
}
