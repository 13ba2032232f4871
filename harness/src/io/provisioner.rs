//! Provisioning tool abstraction.
//!
//! The [`Provisioner`] trait decouples lifecycle orchestration from the actual
//! infrastructure tool (currently `terraform`). Tests use scripted provisioners
//! that return predetermined outcomes without spawning processes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::command_budget;
use crate::core::module::ModuleConfig;
use crate::error::{Operation, OperationFailure};
use crate::io::process::{CommandLimits, CommandOutput, append_log_line, run_command};

/// Output values produced by a successful apply, keyed by output name.
pub type ProvisionOutputs = BTreeMap<String, Value>;

/// The three operations the harness needs from a provisioning tool.
///
/// Implementations must be shareable across case worker threads.
pub trait Provisioner: Sync {
    fn init(&self, config: &ModuleConfig) -> Result<(), OperationFailure>;
    fn apply(&self, config: &ModuleConfig) -> Result<ProvisionOutputs, OperationFailure>;
    fn destroy(&self, config: &ModuleConfig) -> Result<(), OperationFailure>;
}

/// Provisioner that shells out to the `terraform` CLI.
#[derive(Debug, Clone)]
pub struct TerraformProvisioner {
    /// Executable name or path.
    pub binary: PathBuf,
    /// Cap for a single init/apply/output command.
    pub command_timeout: Duration,
    /// Cap for a single destroy command. Not shortened by the run deadline.
    pub destroy_timeout: Duration,
    pub output_limit_bytes: usize,
    /// How long an overrunning command gets to stop after SIGINT before it is killed.
    pub interrupt_grace: Duration,
    /// Init and apply commands never run past this instant.
    pub deadline: Option<Instant>,
    /// Per-case command logs are appended under this directory as `<label>.log`.
    pub log_dir: Option<PathBuf>,
}

impl Default for TerraformProvisioner {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("terraform"),
            command_timeout: Duration::from_secs(30 * 60),
            destroy_timeout: Duration::from_secs(30 * 60),
            output_limit_bytes: 1_000_000,
            interrupt_grace: Duration::from_secs(60),
            deadline: None,
            log_dir: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OutputEntry {
    value: Value,
}

impl TerraformProvisioner {
    fn log_path(&self, config: &ModuleConfig) -> Option<PathBuf> {
        self.log_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", sanitize_label(config.label()))))
    }

    fn limits_for(&self, operation: Operation) -> Result<CommandLimits, OperationFailure> {
        let timeout = match operation {
            Operation::Destroy => self.destroy_timeout,
            Operation::Init | Operation::Apply => {
                command_budget(self.deadline, self.command_timeout).map_err(|err| {
                    OperationFailure::timed_out(operation, err.to_string())
                })?
            }
        };
        Ok(CommandLimits {
            timeout,
            output_limit_bytes: self.output_limit_bytes,
            interrupt_grace: self.interrupt_grace,
        })
    }

    /// Run one terraform subcommand in the module directory with the config's environment.
    fn run_tf(
        &self,
        operation: Operation,
        config: &ModuleConfig,
        args: &[String],
    ) -> Result<CommandOutput, OperationFailure> {
        let limits = self.limits_for(operation)?;
        let log_path = self.log_path(config);
        if let Some(path) = &log_path
            && let Err(err) = append_log_line(
                path,
                &format!("$ {} {}", self.binary.display(), args.join(" ")),
            )
        {
            warn!(err = %err, "failed to write command log header");
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .current_dir(config.module_dir())
            .envs(config.env());

        let output = run_command(cmd, limits, log_path.as_deref())
            .map_err(|err| OperationFailure::new(operation, None, format!("{err:#}")))?;
        if output.timed_out {
            return Err(OperationFailure::timed_out(operation, output.combined_text()));
        }
        if !output.status.success() {
            return Err(OperationFailure::new(
                operation,
                output.status.code(),
                output.combined_text(),
            ));
        }
        Ok(output)
    }

    fn with_vars(base: &[&str], config: &ModuleConfig) -> Vec<String> {
        let mut args: Vec<String> = base.iter().map(|arg| (*arg).to_string()).collect();
        for assignment in config.var_assignments() {
            args.push("-var".to_string());
            args.push(assignment);
        }
        args
    }
}

impl Provisioner for TerraformProvisioner {
    #[instrument(skip_all, fields(module = %config.label()))]
    fn init(&self, config: &ModuleConfig) -> Result<(), OperationFailure> {
        info!(dir = %config.module_dir().display(), "terraform init");
        let args = ["init", "-input=false", "-no-color"].map(String::from);
        self.run_tf(Operation::Init, config, &args)?;
        Ok(())
    }

    #[instrument(skip_all, fields(module = %config.label()))]
    fn apply(&self, config: &ModuleConfig) -> Result<ProvisionOutputs, OperationFailure> {
        info!(dir = %config.module_dir().display(), "terraform apply");
        let args = Self::with_vars(
            &["apply", "-input=false", "-auto-approve", "-lock=false", "-no-color"],
            config,
        );
        self.run_tf(Operation::Apply, config, &args)?;

        let args = ["output", "-no-color", "-json"].map(String::from);
        let output = self.run_tf(Operation::Apply, config, &args)?;
        let outputs = parse_outputs(&output.stdout)
            .map_err(|err| OperationFailure::new(Operation::Apply, Some(0), err))?;
        debug!(outputs = outputs.len(), "terraform outputs parsed");
        Ok(outputs)
    }

    #[instrument(skip_all, fields(module = %config.label()))]
    fn destroy(&self, config: &ModuleConfig) -> Result<(), OperationFailure> {
        info!(dir = %config.module_dir().display(), "terraform destroy");
        let args = Self::with_vars(
            &["destroy", "-input=false", "-auto-approve", "-lock=false", "-no-color"],
            config,
        );
        self.run_tf(Operation::Destroy, config, &args)?;
        Ok(())
    }
}

/// Parse `terraform output -json` into name → value.
fn parse_outputs(stdout: &[u8]) -> Result<ProvisionOutputs, String> {
    let text = String::from_utf8_lossy(stdout);
    if text.trim().is_empty() {
        return Ok(ProvisionOutputs::new());
    }
    let entries: BTreeMap<String, OutputEntry> =
        serde_json::from_str(&text).map_err(|err| format!("parse terraform outputs: {err}"))?;
    Ok(entries
        .into_iter()
        .map(|(name, entry)| (name, entry.value))
        .collect())
}

fn sanitize_label(label: &str) -> String {
    label
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::module::{ModuleSchema, VarKind};
    use serde_json::json;

    #[test]
    fn parses_terraform_output_json() {
        let stdout = br#"{
  "alias": {"sensitive": false, "type": "string", "value": "test-account"},
  "user_arns": {"sensitive": false, "type": ["list", "string"], "value": ["arn:a", "arn:b"]}
}"#;
        let outputs = parse_outputs(stdout).expect("parse");
        assert_eq!(outputs["alias"], json!("test-account"));
        assert_eq!(outputs["user_arns"], json!(["arn:a", "arn:b"]));
    }

    #[test]
    fn empty_output_means_no_outputs() {
        assert!(parse_outputs(b"\n").expect("parse").is_empty());
    }

    #[test]
    fn malformed_output_is_an_error() {
        assert!(parse_outputs(b"not json").is_err());
    }

    #[test]
    fn labels_become_safe_file_names() {
        assert_eq!(sanitize_label("../iam-users"), "___iam-users");
        assert_eq!(sanitize_label("iam_users"), "iam_users");
    }

    #[test]
    fn expired_deadline_fails_init_without_spawning() {
        let provisioner = TerraformProvisioner {
            binary: PathBuf::from("definitely-not-terraform"),
            deadline: Some(Instant::now()),
            ..TerraformProvisioner::default()
        };
        let config = ModuleConfig::builder("/tmp", ModuleSchema::new())
            .build()
            .expect("config");
        let failure = provisioner.init(&config).expect_err("deadline");
        assert!(failure.timed_out);
        assert_eq!(failure.operation, Operation::Init);
    }

    #[cfg(unix)]
    mod fake_terraform {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        /// Write an executable stand-in for terraform that records its arguments.
        fn fake_binary(dir: &Path, script_body: &str) -> PathBuf {
            let path = dir.join("terraform");
            let script = format!("#!/bin/sh\necho \"$@\" >> \"{}/calls\"\n{script_body}\n", dir.display());
            fs::write(&path, script).expect("write script");
            let mut perms = fs::metadata(&path).expect("meta").permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).expect("chmod");
            path
        }

        fn config(dir: &Path) -> ModuleConfig {
            ModuleConfig::builder(dir, ModuleSchema::new().required("iam_account_alias", VarKind::String))
                .label("iam-users")
                .var("iam_account_alias", "test-account")
                .env("AWS_DEFAULT_REGION", "eu-central-1")
                .build()
                .expect("config")
        }

        #[test]
        fn apply_passes_vars_and_reads_outputs() {
            let temp = tempfile::tempdir().expect("tempdir");
            let binary = fake_binary(
                temp.path(),
                r#"case "$1" in
  output) echo "{\"region\": {\"value\": \"$AWS_DEFAULT_REGION\"}}" ;;
esac"#,
            );
            let provisioner = TerraformProvisioner {
                binary,
                log_dir: Some(temp.path().join("logs")),
                ..TerraformProvisioner::default()
            };

            let outputs = provisioner.apply(&config(temp.path())).expect("apply");
            assert_eq!(outputs["region"], json!("eu-central-1"));

            let calls = fs::read_to_string(temp.path().join("calls")).expect("calls");
            let lines: Vec<&str> = calls.lines().collect();
            assert_eq!(
                lines,
                vec![
                    "apply -input=false -auto-approve -lock=false -no-color -var iam_account_alias=test-account",
                    "output -no-color -json",
                ]
            );
            let log = fs::read_to_string(temp.path().join("logs/iam-users.log")).expect("log");
            assert!(log.contains("apply -input=false"));
        }

        #[test]
        fn failing_command_reports_exit_code_and_output() {
            let temp = tempfile::tempdir().expect("tempdir");
            let binary = fake_binary(
                temp.path(),
                "echo 'Error: ThrottlingException: Rate exceeded' >&2\nexit 1",
            );
            let provisioner = TerraformProvisioner {
                binary,
                ..TerraformProvisioner::default()
            };

            let failure = provisioner.destroy(&config(temp.path())).expect_err("fails");
            assert_eq!(failure.operation, Operation::Destroy);
            assert_eq!(failure.exit_code, Some(1));
            assert!(failure.output.contains("ThrottlingException"));
        }
    }
}
