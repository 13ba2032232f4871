//! Harness settings stored in `modtest.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::classifier::ErrorClassifier;
use crate::core::region::{RegionCandidates, StaticRegionOracle};
use crate::core::retry_policy::{
    DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, RetryPolicy,
};

/// Harness settings (TOML).
///
/// Edited by humans; every field has a default so a missing or partial file
/// still yields a usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessSettings {
    /// Regions a case may be provisioned in.
    pub allowed_regions: Vec<String>,
    pub excluded_regions: Vec<String>,
    /// Environment variable the selected region is exported under.
    pub region_env_var: String,
    /// Environment variable that pins the region instead of drawing one.
    pub forced_region_env_var: String,
    /// Variables copied from the harness environment into every module run.
    pub passthrough_env: Vec<String>,
    /// Wall-clock budget for the whole run; cancels outstanding init/apply work.
    pub run_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub destroy_timeout_secs: u64,
    pub command_output_limit_bytes: usize,
    /// Grace period between interrupting a timed-out command and killing it.
    pub command_interrupt_grace_secs: u64,
    /// Overrides the built-in list of stable regions when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stable_regions: Option<Vec<String>>,
    pub retry: RetrySettings,
    pub terraform: TerraformSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Extra transient-error patterns (regex → description).
    pub retryable_errors: BTreeMap<String, String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_secs: DEFAULT_BASE_DELAY.as_secs(),
            max_delay_secs: DEFAULT_MAX_DELAY.as_secs(),
            retryable_errors: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TerraformSettings {
    pub binary: PathBuf,
}

impl Default for TerraformSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("terraform"),
        }
    }
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            allowed_regions: vec!["eu-central-1".to_string()],
            excluded_regions: Vec::new(),
            region_env_var: "AWS_DEFAULT_REGION".to_string(),
            forced_region_env_var: "MODTEST_REGION".to_string(),
            passthrough_env: [
                "AWS_PROFILE",
                "AWS_ACCESS_KEY_ID",
                "AWS_SECRET_ACCESS_KEY",
                "AWS_SESSION_TOKEN",
            ]
            .map(String::from)
            .to_vec(),
            run_timeout_secs: 60 * 60,
            command_timeout_secs: 30 * 60,
            destroy_timeout_secs: 30 * 60,
            command_output_limit_bytes: 1_000_000,
            command_interrupt_grace_secs: 60,
            stable_regions: None,
            retry: RetrySettings::default(),
            terraform: TerraformSettings::default(),
        }
    }
}

impl HarnessSettings {
    pub fn validate(&self) -> Result<()> {
        if self.allowed_regions.is_empty() {
            return Err(anyhow!("allowed_regions must be a non-empty array"));
        }
        if self
            .allowed_regions
            .iter()
            .chain(&self.excluded_regions)
            .any(|region| region.trim().is_empty())
        {
            return Err(anyhow!("region names must be non-empty"));
        }
        if self.region_env_var.trim().is_empty() {
            return Err(anyhow!("region_env_var must be non-empty"));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.destroy_timeout_secs == 0 {
            return Err(anyhow!("destroy_timeout_secs must be > 0"));
        }
        if self.command_output_limit_bytes == 0 {
            return Err(anyhow!("command_output_limit_bytes must be > 0"));
        }
        if self.terraform.binary.as_os_str().is_empty() {
            return Err(anyhow!("terraform.binary must be non-empty"));
        }
        self.retry_policy()
            .validate()
            .map_err(|msg| anyhow!("retry: {msg}"))?;
        self.classifier()?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_secs(self.retry.base_delay_secs),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
        }
    }

    /// Default transient patterns plus the configured extras.
    pub fn classifier(&self) -> Result<ErrorClassifier> {
        ErrorClassifier::with_extra(
            self.retry
                .retryable_errors
                .iter()
                .map(|(pattern, reason)| (pattern.as_str(), reason.as_str())),
        )
        .context("compile retry.retryable_errors")
    }

    pub fn candidates(&self) -> RegionCandidates {
        RegionCandidates::new(
            self.allowed_regions.iter().cloned(),
            self.excluded_regions.iter().cloned(),
        )
    }

    pub fn oracle(&self) -> StaticRegionOracle {
        match &self.stable_regions {
            Some(stable) => StaticRegionOracle::new(stable.iter().cloned(), Vec::<String>::new()),
            None => StaticRegionOracle::default(),
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_secs(self.destroy_timeout_secs)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_secs(self.command_interrupt_grace_secs)
    }
}

/// Load settings from a TOML file.
///
/// If the file is missing, returns `HarnessSettings::default()`.
pub fn load_config(path: &Path) -> Result<HarnessSettings> {
    if !path.exists() {
        let cfg = HarnessSettings::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessSettings =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid settings {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write settings to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HarnessSettings) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize settings toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("settings path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp settings {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace settings {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::Classification;
    use crate::core::region::RegionOracle;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, HarnessSettings::default());
        assert_eq!(cfg.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn write_then_load_keeps_settings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("modtest.toml");
        let mut cfg = HarnessSettings::default();
        cfg.excluded_regions = vec!["us-west-1".to_string()];
        cfg.stable_regions = Some(vec!["eu-central-1".to_string()]);
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("modtest.toml");
        fs::write(
            &path,
            "allowed_regions = [\"us-east-1\", \"us-west-2\"]\n[retry]\nmax_attempts = 5\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.allowed_regions, vec!["us-east-1", "us-west-2"]);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_delay_secs, 5);
        assert_eq!(cfg.region_env_var, "AWS_DEFAULT_REGION");
    }

    #[test]
    fn rejects_zero_attempts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("modtest.toml");
        fs::write(&path, "[retry]\nmax_attempts = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("max_attempts"));
    }

    #[test]
    fn rejects_unknown_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("modtest.toml");
        fs::write(&path, "[retry]\nmax_attempt = 5\n").expect("write");
        let err = load_config(&path).expect_err("unknown key");
        assert!(format!("{err:#}").contains("max_attempt"));
    }

    #[test]
    fn rejects_empty_allowed_regions() {
        let cfg = HarnessSettings {
            allowed_regions: Vec::new(),
            ..HarnessSettings::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_retry_pattern() {
        let mut cfg = HarnessSettings::default();
        cfg.retry
            .retryable_errors
            .insert("(unclosed".to_string(), "broken".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn extra_patterns_extend_default_classifier() {
        let mut cfg = HarnessSettings::default();
        cfg.retry
            .retryable_errors
            .insert("QuotaCheckPending".to_string(), "quota check".to_string());
        let classifier = cfg.classifier().expect("classifier");
        assert_eq!(
            classifier.classify("Error: QuotaCheckPending"),
            Classification::Transient {
                reason: "quota check".to_string()
            }
        );
        assert!(matches!(
            classifier.classify("Error: ThrottlingException"),
            Classification::Transient { .. }
        ));
    }

    #[test]
    fn stable_region_override_replaces_builtin_list() {
        let cfg = HarnessSettings {
            stable_regions: Some(vec!["eu-central-1".to_string()]),
            ..HarnessSettings::default()
        };
        let stable = cfg.oracle().stable_regions();
        assert_eq!(stable.len(), 1);
        assert!(stable.contains("eu-central-1"));
    }
}
