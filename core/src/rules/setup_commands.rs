//! The setup-commands rule: run allow-listed install and migration steps.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::allowed_command::assert_allowed;
use crate::error::Result;
use crate::error::SxnErr;
use crate::exec;
use crate::exec::ExecParams;

use super::Change;
use super::ChangeKind;
use super::RuleContext;
use super::default_true;

const MAX_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupCommandsConfig {
    pub commands: Vec<CommandEntry>,
    #[serde(default)]
    pub continue_on_failure: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandEntry {
    /// argv vector, spawned without a shell.
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Seconds, clamped by the executor to `[1, 1800]`.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    /// Relative to (and contained in) the session root.
    #[serde(default)]
    pub working_directory: Option<String>,
}

/// Gate deciding whether a command runs at all. A false condition is a
/// silent skip, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    FileExists(PathBuf),
    FileMissing(PathBuf),
    DirectoryExists(PathBuf),
    DirectoryMissing(PathBuf),
    CommandAvailable(String),
    EnvVarSet(String),
    Always,
}

impl Condition {
    pub fn parse(text: &str) -> Option<Self> {
        if text == "always" {
            return Some(Condition::Always);
        }
        let (keyword, argument) = text.split_once(':')?;
        if argument.is_empty() {
            return None;
        }
        match keyword {
            "file_exists" => Some(Condition::FileExists(PathBuf::from(argument))),
            "file_missing" => Some(Condition::FileMissing(PathBuf::from(argument))),
            "directory_exists" => Some(Condition::DirectoryExists(PathBuf::from(argument))),
            "directory_missing" => Some(Condition::DirectoryMissing(PathBuf::from(argument))),
            "command_available" => Some(Condition::CommandAvailable(argument.to_string())),
            "env_var_set" => Some(Condition::EnvVarSet(argument.to_string())),
            _ => None,
        }
    }

    pub fn evaluate(&self, ctx: &RuleContext) -> bool {
        match self {
            Condition::Always => true,
            Condition::FileExists(path) => resolve(ctx, path).is_some_and(|p| p.is_file()),
            Condition::FileMissing(path) => !resolve(ctx, path).is_some_and(|p| p.is_file()),
            Condition::DirectoryExists(path) => resolve(ctx, path).is_some_and(|p| p.is_dir()),
            Condition::DirectoryMissing(path) => !resolve(ctx, path).is_some_and(|p| p.is_dir()),
            Condition::CommandAvailable(name) => command_available(name),
            Condition::EnvVarSet(name) => std::env::var(name).is_ok_and(|v| !v.is_empty()),
        }
    }
}

/// Resolve a condition path against the session root; anything that cannot
/// be contained simply does not exist for condition purposes.
fn resolve(ctx: &RuleContext, path: &Path) -> Option<PathBuf> {
    match ctx.session_root.contain(path) {
        Ok(resolved) => Some(resolved),
        Err(SxnErr::Io(_)) => None,
        Err(other) => {
            warn!("condition path rejected by sandbox: {other}");
            None
        }
    }
}

fn command_available(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(name)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[derive(Debug)]
pub struct SetupCommandsRule {
    config: SetupCommandsConfig,
}

impl SetupCommandsRule {
    pub fn from_config(rule: &str, config: &Value) -> Result<Self> {
        let config: SetupCommandsConfig =
            serde_json::from_value(config.clone()).map_err(|err| SxnErr::BadConfig {
                rule: rule.to_string(),
                reason: err.to_string(),
            })?;
        if config.commands.is_empty() {
            return Err(SxnErr::BadConfig {
                rule: rule.to_string(),
                reason: "'commands' must not be empty".to_string(),
            });
        }
        for entry in &config.commands {
            if entry.command.is_empty() {
                return Err(SxnErr::BadConfig {
                    rule: rule.to_string(),
                    reason: "'command' must not be empty".to_string(),
                });
            }
            if let Some(timeout) = entry.timeout
                && timeout > MAX_TIMEOUT_SECS
            {
                return Err(SxnErr::BadConfig {
                    rule: rule.to_string(),
                    reason: format!("timeout {timeout}s exceeds the {MAX_TIMEOUT_SECS}s limit"),
                });
            }
            if let Some(condition) = &entry.condition
                && Condition::parse(condition).is_none()
            {
                return Err(SxnErr::BadConfig {
                    rule: rule.to_string(),
                    reason: format!("unrecognized condition '{condition}'"),
                });
            }
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &SetupCommandsConfig {
        &self.config
    }

    pub async fn validate(&self, _rule: &str, _ctx: &RuleContext) -> Result<()> {
        for entry in &self.config.commands {
            assert_allowed(&entry.command)?;
            exec::build_environment(&entry.env)?;
        }
        Ok(())
    }

    pub async fn apply(&self, ctx: &RuleContext, changes: &mut Vec<Change>) -> Result<()> {
        for entry in &self.config.commands {
            let condition = entry
                .condition
                .as_deref()
                .and_then(Condition::parse)
                .unwrap_or(Condition::Always);
            if !condition.evaluate(ctx) {
                debug!(command = ?entry.command, "condition false, skipping command");
                continue;
            }

            let cwd = match &entry.working_directory {
                Some(dir) => PathBuf::from(dir),
                None => ctx.session_root.root().to_path_buf(),
            };
            let params = ExecParams {
                command: entry.command.clone(),
                cwd,
                env: entry.env.clone(),
                timeout: Duration::from_secs(entry.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            };

            let tolerated = self.config.continue_on_failure || !entry.required;
            match exec::execute(params, &ctx.session_root).await {
                Ok(result) => {
                    changes.push(Change::new(
                        ChangeKind::CommandExecuted,
                        entry.command.join(" "),
                        json!({
                            "command": entry.command,
                            "cwd": entry.working_directory,
                            "env": entry.env,
                            "exit_status": result.exit_status,
                            "duration_ms": result.duration.as_millis() as u64,
                            "description": entry.description,
                        }),
                    ));
                    if !result.ok() {
                        let failure = SxnErr::CommandFailed {
                            program: entry.command[0].clone(),
                            exit_status: result.exit_status,
                        };
                        if tolerated {
                            warn!(
                                command = ?entry.command,
                                exit_status = result.exit_status,
                                stderr = %String::from_utf8_lossy(&result.stderr),
                                "command failed, continuing"
                            );
                            continue;
                        }
                        return Err(failure);
                    }
                }
                Err(err) => {
                    if tolerated {
                        warn!(command = ?entry.command, "command errored, continuing: {err}");
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Command execution cannot be undone; leave an audit note and move on.
    pub async fn rollback(&self, _ctx: &RuleContext, changes: &[Change]) -> Result<()> {
        for change in changes.iter().rev() {
            if change.kind == ChangeKind::CommandExecuted {
                info!(command = %change.target, "rollback: command execution is not reversible");
            }
        }
        Ok(())
    }
}
