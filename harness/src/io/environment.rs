//! Environment inputs captured once at startup.
//!
//! Credentials are copied into every module run verbatim. Only key names ever
//! reach the logs.

use std::collections::BTreeMap;

use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentInputs {
    vars: BTreeMap<String, String>,
    forced_region: Option<String>,
}

impl EnvironmentInputs {
    /// Read the pass-through variables and the forced-region variable from the
    /// process environment. Unset or empty variables are skipped.
    pub fn capture<I, S>(passthrough: I, forced_region_var: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut vars = BTreeMap::new();
        for key in passthrough {
            let key = key.as_ref();
            if let Ok(value) = std::env::var(key)
                && !value.is_empty()
            {
                vars.insert(key.to_string(), value);
            }
        }
        let forced_region = std::env::var(forced_region_var)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        vars.remove(forced_region_var);
        debug!(
            keys = ?vars.keys().collect::<Vec<_>>(),
            forced = forced_region.is_some(),
            "captured environment inputs"
        );
        Self {
            vars,
            forced_region,
        }
    }

    /// Build inputs from an explicit map (tests and embedding callers).
    pub fn from_map<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            forced_region: None,
        }
    }

    pub fn with_forced_region(mut self, region: Option<String>) -> Self {
        self.forced_region = region;
        self
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn forced_region(&self) -> Option<&str> {
        self.forced_region.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_map_has_no_forced_region() {
        let inputs = EnvironmentInputs::from_map([("AWS_PROFILE", "sandbox")]);
        assert_eq!(inputs.vars()["AWS_PROFILE"], "sandbox");
        assert_eq!(inputs.forced_region(), None);
    }

    #[test]
    fn capture_reads_process_environment() {
        // PATH is set in every test environment; the other key is not.
        let inputs = EnvironmentInputs::capture(
            ["PATH", "MODTEST_SURELY_UNSET_VAR"],
            "MODTEST_SURELY_UNSET_REGION",
        );
        assert!(inputs.vars().contains_key("PATH"));
        assert!(!inputs.vars().contains_key("MODTEST_SURELY_UNSET_VAR"));
        assert_eq!(inputs.forced_region(), None);
    }

    #[test]
    fn capture_splits_out_forced_region() {
        // PATH doubles as the forced-region variable here; it must not leak into vars.
        let inputs = EnvironmentInputs::capture(["PATH"], "PATH");
        assert!(inputs.forced_region().is_some());
        assert!(!inputs.vars().contains_key("PATH"));
    }
}
