//! The copy-files rule: place secret and config files into the session.

use serde::Deserialize;
use serde::Deserializer;
use serde_json::Value;
use serde_json::json;
use std::path::Component;
use std::path::Path;
use tokio::fs;
use tracing::debug;
use tracing::warn;

use crate::copier::CopyOptions;
use crate::copier::is_sensitive;
use crate::error::Result;
use crate::error::SxnErr;

use super::Change;
use super::ChangeKind;
use super::RuleContext;
use super::default_true;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopyFilesConfig {
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileEntry {
    /// Path relative to the project root.
    pub source: String,
    /// Path relative to the session root; defaults to `source`.
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub permissions: Option<Mode>,
    #[serde(default)]
    pub encrypt: Option<bool>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub preserve_permissions: bool,
    #[serde(default)]
    pub create_directories: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Copy,
    Symlink,
}

/// File mode accepted either as an octal string (`"0644"`, `"600"`) or an
/// integer already in `0..=0o777`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode(pub u32);

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let mode = match &value {
            Value::String(text) => parse_octal(text),
            Value::Number(number) => number.as_u64().filter(|n| *n <= 0o777).map(|n| n as u32),
            _ => None,
        };
        mode.map(Mode).ok_or_else(|| {
            serde::de::Error::custom(
                "permissions must be an octal string like \"0644\" or an integer in 0..=0o777",
            )
        })
    }
}

fn parse_octal(text: &str) -> Option<u32> {
    let digits = match text.len() {
        3 => text,
        4 => text.strip_prefix('0')?,
        _ => return None,
    };
    if !digits.bytes().all(|b| b.is_ascii_digit() && b < b'8') {
        return None;
    }
    u32::from_str_radix(digits, 8).ok()
}

#[derive(Debug)]
pub struct CopyFilesRule {
    config: CopyFilesConfig,
}

impl CopyFilesRule {
    pub fn from_config(rule: &str, config: &Value) -> Result<Self> {
        let config: CopyFilesConfig =
            serde_json::from_value(config.clone()).map_err(|err| SxnErr::BadConfig {
                rule: rule.to_string(),
                reason: err.to_string(),
            })?;
        if config.files.is_empty() {
            return Err(SxnErr::BadConfig {
                rule: rule.to_string(),
                reason: "'files' must not be empty".to_string(),
            });
        }
        for entry in &config.files {
            require_relative(rule, "source", &entry.source)?;
            if let Some(destination) = &entry.destination {
                require_relative(rule, "destination", destination)?;
            }
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &CopyFilesConfig {
        &self.config
    }

    pub async fn validate(&self, rule: &str, ctx: &RuleContext) -> Result<()> {
        for entry in &self.config.files {
            if entry.strategy == Strategy::Symlink && entry.encrypt == Some(true) {
                warn!(
                    rule,
                    source = %entry.source,
                    "encryption is inapplicable to symlinks; option ignored"
                );
            }

            match ctx.project_root.contain(&entry.source) {
                Ok(_) => {}
                Err(SxnErr::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    if entry.required {
                        return Err(SxnErr::MissingRequiredSource {
                            rule: rule.to_string(),
                            src: entry.source.clone(),
                        });
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    pub async fn apply(&self, ctx: &RuleContext, changes: &mut Vec<Change>) -> Result<()> {
        let copier = ctx.copier();

        for entry in &self.config.files {
            let source = Path::new(&entry.source);
            let destination = entry.destination.as_deref().map(Path::new);

            // Optional sources may have vanished since validation.
            let missing = matches!(
                ctx.project_root.contain(source),
                Err(SxnErr::Io(ref err)) if err.kind() == std::io::ErrorKind::NotFound
            );
            if missing {
                if entry.required {
                    return Err(SxnErr::SourceMissing {
                        path: source.to_path_buf(),
                    });
                }
                debug!(source = %entry.source, "optional source absent, skipping");
                continue;
            }

            let options = CopyOptions {
                permissions: entry.permissions.map(|mode| mode.0),
                encrypt: entry.encrypt,
                preserve_permissions: entry.preserve_permissions,
                create_directories: entry.create_directories,
                force: false,
            };

            match entry.strategy {
                Strategy::Copy => {
                    let result = copier.copy_file(source, destination, &options).await?;
                    changes.push(Change::new(
                        ChangeKind::FileCreated,
                        result.destination.to_string_lossy(),
                        json!({
                            "source": entry.source,
                            "strategy": "copy",
                            "encrypted": result.encrypted,
                            "checksum": result.checksum,
                            "sensitive": is_sensitive(source),
                        }),
                    ));
                }
                Strategy::Symlink => {
                    let result = copier.create_symlink(source, destination, &options).await?;
                    changes.push(Change::new(
                        ChangeKind::SymlinkCreated,
                        result.destination.to_string_lossy(),
                        json!({
                            "source": entry.source,
                            "strategy": "symlink",
                            "link_target": result.source.to_string_lossy(),
                        }),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Remove every created file or link, newest first, restoring any file
    /// the copier moved aside.
    pub async fn rollback(&self, _ctx: &RuleContext, changes: &[Change]) -> Result<()> {
        for change in changes.iter().rev() {
            match change.kind {
                ChangeKind::FileCreated | ChangeKind::SymlinkCreated => {
                    let target = Path::new(&change.target);
                    if let Err(err) = fs::remove_file(target).await
                        && err.kind() != std::io::ErrorKind::NotFound
                    {
                        return Err(err.into());
                    }
                    if let Some(backup) = change.metadata.get("backup_path").and_then(Value::as_str)
                    {
                        fs::rename(backup, target).await?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn require_relative(rule: &str, field: &str, path: &str) -> Result<()> {
    let candidate = Path::new(path);
    if candidate.is_absolute()
        || candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(SxnErr::BadConfig {
            rule: rule.to_string(),
            reason: format!("'{field}' must be a relative path without '..': {path}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn octal_string_permissions_parse() {
        assert_eq!(parse_octal("0644"), Some(0o644));
        assert_eq!(parse_octal("644"), Some(0o644));
        assert_eq!(parse_octal("600"), Some(0o600));
        assert_eq!(parse_octal("0778"), None);
        assert_eq!(parse_octal("77"), None);
        assert_eq!(parse_octal("07777"), None);
    }

    #[test]
    fn config_requires_non_empty_files() {
        let err = CopyFilesRule::from_config("copy", &json!({"files": []})).unwrap_err();
        assert!(matches!(err, SxnErr::BadConfig { .. }), "{err}");
    }

    #[test]
    fn config_rejects_unknown_strategy() {
        let err = CopyFilesRule::from_config(
            "copy",
            &json!({"files": [{"source": "a", "strategy": "teleport"}]}),
        )
        .unwrap_err();
        assert!(matches!(err, SxnErr::BadConfig { .. }), "{err}");
    }

    #[test]
    fn config_rejects_absolute_source() {
        let err =
            CopyFilesRule::from_config("copy", &json!({"files": [{"source": "/etc/passwd"}]}))
                .unwrap_err();
        assert!(matches!(err, SxnErr::BadConfig { .. }), "{err}");
    }

    #[test]
    fn config_rejects_out_of_range_integer_permissions() {
        let err = CopyFilesRule::from_config(
            "copy",
            &json!({"files": [{"source": "a", "permissions": 4096}]}),
        )
        .unwrap_err();
        assert!(matches!(err, SxnErr::BadConfig { .. }), "{err}");
    }

    #[test]
    fn config_accepts_full_entry() {
        let rule = CopyFilesRule::from_config(
            "copy",
            &json!({"files": [{
                "source": "config/master.key",
                "destination": "config/master.key",
                "strategy": "copy",
                "permissions": "0600",
                "encrypt": true,
                "required": false
            }]}),
        )
        .unwrap();
        let entry = &rule.config().files[0];
        assert_eq!(entry.permissions, Some(Mode(0o600)));
        assert_eq!(entry.strategy, Strategy::Copy);
        assert!(!entry.required);
    }
}
