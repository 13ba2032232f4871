//! Case file parsing and validation.
//!
//! Cases are TOML files naming a module directory, its variables and the
//! checks to run against its outputs. See `cases/` for examples.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use serde_json::Value;

use harness::core::module::{ModuleConfig, ModuleSchema, VarSpec};
use harness::core::retry_policy::RetryOverrides;
use harness::driver::TestCase;

use crate::checks::{Check, case_body};

/// A parsed case file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CaseFile {
    pub case: CaseMeta,
    /// Variables the module declares.
    #[serde(default)]
    pub variables: BTreeMap<String, VarSpec>,
    /// Values passed to the module.
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub retry: RetryOverrides,
    #[serde(default)]
    pub checks: Vec<Check>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CaseMeta {
    /// Unique identifier (slug format: `[a-z0-9_-]+`).
    pub id: String,
    /// Module directory, relative to the case file's directory unless absolute.
    pub module_dir: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
}

/// A case together with the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedCase {
    pub path: PathBuf,
    pub file: CaseFile,
}

impl LoadedCase {
    pub fn id(&self) -> &str {
        &self.file.case.id
    }

    /// Module directory with relative paths resolved against the case file.
    pub fn module_dir(&self) -> PathBuf {
        let dir = &self.file.case.module_dir;
        if dir.is_absolute() {
            return dir.clone();
        }
        self.path
            .parent()
            .map_or_else(|| dir.clone(), |parent| parent.join(dir))
    }

    pub fn to_test_case(&self) -> TestCase {
        let file = &self.file;
        TestCase {
            id: file.case.id.clone(),
            module_dir: self.module_dir(),
            schema: file.schema(),
            vars: file.vars.clone(),
            env: file.env.clone(),
            retry: file.retry,
            body: case_body(file.checks.clone()),
        }
    }
}

impl CaseFile {
    /// Load and validate a case file from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read case {}", path.display()))?;
        let case: CaseFile =
            toml::from_str(&contents).with_context(|| format!("parse case {}", path.display()))?;
        case.validate()
            .with_context(|| format!("validate case {}", path.display()))?;
        Ok(case)
    }

    #[cfg(test)]
    pub fn parse_str(contents: &str) -> Result<Self> {
        let case: CaseFile = toml::from_str(contents).context("parse case")?;
        case.validate()?;
        Ok(case)
    }

    pub fn schema(&self) -> ModuleSchema {
        self.variables
            .iter()
            .fold(ModuleSchema::new(), |schema, (name, spec)| {
                if spec.required {
                    schema.required(name, spec.kind)
                } else {
                    schema.optional(name, spec.kind)
                }
            })
    }

    fn validate(&self) -> Result<()> {
        validate_case_id(&self.case.id)?;
        // Same checks the driver applies, so a bad case fails before anything runs.
        ModuleConfig::builder(&self.case.module_dir, self.schema())
            .vars(self.vars.clone())
            .envs(self.env.clone())
            .retry(self.retry)
            .build()?;
        for (key, value) in &self.env {
            if value.is_empty() {
                bail!("env {} must be non-empty", key);
            }
        }
        for (index, check) in self.checks.iter().enumerate() {
            check
                .validate()
                .with_context(|| format!("checks[{}] invalid", index))?;
        }
        Ok(())
    }
}

/// Discover and load all case files from a directory.
///
/// Returns cases sorted by id. Errors if duplicate ids are found.
pub fn discover_cases(dir: &Path) -> Result<Vec<LoadedCase>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut cases = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read cases dir {}", dir.display()))? {
        let entry = entry.context("read case entry")?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }
        let file = CaseFile::load(&path)?;
        cases.push(LoadedCase { path, file });
    }
    cases.sort_by(|left, right| left.id().cmp(right.id()));
    for pair in cases.windows(2) {
        if pair[0].id() == pair[1].id() {
            return Err(anyhow!("duplicate case.id {}", pair[0].id()));
        }
    }
    Ok(cases)
}

/// Keep only the requested ids (all cases when `ids` is empty).
pub fn select_cases(cases: Vec<LoadedCase>, ids: &[String]) -> Result<Vec<LoadedCase>> {
    if ids.is_empty() {
        return Ok(cases);
    }
    for id in ids {
        if !cases.iter().any(|case| case.id() == id) {
            bail!("case {} not found", id);
        }
    }
    Ok(cases
        .into_iter()
        .filter(|case| ids.iter().any(|id| id == case.id()))
        .collect())
}

fn validate_case_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("case.id must be non-empty");
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        bail!("case.id must use [a-z0-9_-] only");
    }
    Ok(())
}
