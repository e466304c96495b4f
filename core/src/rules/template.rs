//! The template rule: render project docs into the session with a merged
//! variable tree.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use chrono::SecondsFormat;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tokio::fs;
use tracing::debug;

use crate::error::Result;
use crate::error::SxnErr;
use crate::template;

use super::Change;
use super::ChangeKind;
use super::RuleContext;
use super::default_true;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const RENDERED_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateConfig {
    pub templates: Vec<TemplateEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateEntry {
    /// Template source, relative to the project root.
    pub source: String,
    /// Render target, relative to the session root.
    pub destination: String,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub overwrite: bool,
}

fn default_engine() -> String {
    template::DEFAULT_ENGINE.to_string()
}

#[derive(Debug)]
pub struct TemplateRule {
    config: TemplateConfig,
}

impl TemplateRule {
    pub fn from_config(rule: &str, config: &Value) -> Result<Self> {
        let config: TemplateConfig =
            serde_json::from_value(config.clone()).map_err(|err| SxnErr::BadConfig {
                rule: rule.to_string(),
                reason: err.to_string(),
            })?;
        if config.templates.is_empty() {
            return Err(SxnErr::BadConfig {
                rule: rule.to_string(),
                reason: "'templates' must not be empty".to_string(),
            });
        }
        for entry in &config.templates {
            require_relative(rule, "source", &entry.source)?;
            require_relative(rule, "destination", &entry.destination)?;
            if !template::is_recognized_engine(&entry.engine) {
                return Err(SxnErr::BadConfig {
                    rule: rule.to_string(),
                    reason: format!(
                        "unrecognized template engine '{}' (recognized: {})",
                        entry.engine,
                        template::RECOGNIZED_ENGINES.join(", ")
                    ),
                });
            }
            if let Some(variables) = &entry.variables
                && !variables.is_object()
            {
                return Err(SxnErr::BadConfig {
                    rule: rule.to_string(),
                    reason: "'variables' must be a map".to_string(),
                });
            }
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &TemplateConfig {
        &self.config
    }

    pub async fn validate(&self, rule: &str, ctx: &RuleContext) -> Result<()> {
        for entry in &self.config.templates {
            let source = match ctx.project_root.contain(&entry.source) {
                Ok(path) => path,
                Err(SxnErr::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    if entry.required {
                        return Err(SxnErr::MissingRequiredSource {
                            rule: rule.to_string(),
                            src: entry.source.clone(),
                        });
                    }
                    continue;
                }
                Err(other) => return Err(other),
            };
            let text = fs::read_to_string(&source).await?;
            template::validate(&entry.source, &text)?;
        }
        Ok(())
    }

    pub async fn apply(&self, ctx: &RuleContext, changes: &mut Vec<Change>) -> Result<()> {
        for entry in &self.config.templates {
            let source = match ctx.project_root.contain(&entry.source) {
                Ok(path) => path,
                Err(SxnErr::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    if entry.required {
                        return Err(SxnErr::SourceMissing {
                            path: PathBuf::from(&entry.source),
                        });
                    }
                    debug!(source = %entry.source, "optional template absent, skipping");
                    continue;
                }
                Err(other) => return Err(other),
            };

            let text = fs::read_to_string(&source).await?;
            template::validate(&entry.source, &text)?;

            let variables = self.assemble_variables(ctx, entry);
            let rendered = template::render(&text, &variables)?;

            let destination = ctx.session_root.contain_for_create(&entry.destination)?;
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).await?;
            }

            let mut backup_path: Option<PathBuf> = None;
            if fs::symlink_metadata(&destination).await.is_ok() {
                if !entry.overwrite {
                    return Err(SxnErr::DestinationExists { path: destination });
                }
                let backup = backup_name(&destination);
                fs::rename(&destination, &backup).await?;
                backup_path = Some(backup);
            }

            fs::write(&destination, rendered.as_bytes()).await?;
            #[cfg(unix)]
            fs::set_permissions(
                &destination,
                std::fs::Permissions::from_mode(RENDERED_FILE_MODE),
            )
            .await?;

            let variables_used: Vec<String> =
                template::extract_variable_names(&text).into_iter().collect();
            changes.push(Change::new(
                ChangeKind::FileCreated,
                destination.to_string_lossy(),
                json!({
                    "source": entry.source,
                    "template": true,
                    "engine": entry.engine,
                    "backup_path": backup_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                    "variables_used": variables_used,
                }),
            ));
        }
        Ok(())
    }

    /// Delete rendered files and put any displaced originals back.
    pub async fn rollback(&self, _ctx: &RuleContext, changes: &[Change]) -> Result<()> {
        for change in changes.iter().rev() {
            if change.kind != ChangeKind::FileCreated {
                continue;
            }
            let target = Path::new(&change.target);
            if let Err(err) = fs::remove_file(target).await
                && err.kind() != std::io::ErrorKind::NotFound
            {
                return Err(err.into());
            }
            if let Some(backup) = change.metadata.get("backup_path").and_then(Value::as_str) {
                fs::rename(backup, target).await?;
            }
        }
        Ok(())
    }

    /// Auto context, then rule variables, then per-template metadata; later
    /// layers override earlier ones key-by-key.
    fn assemble_variables(&self, ctx: &RuleContext, entry: &TemplateEntry) -> Value {
        let mut variables = json!({
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        if let Some(session_name) = &ctx.session_name {
            template::merge(&mut variables, json!({"session_name": session_name}));
        }
        if let Some(project_name) = &ctx.project_name {
            template::merge(&mut variables, json!({"project_name": project_name}));
        }
        if let Some(rule_vars) = &entry.variables {
            template::merge(&mut variables, rule_vars.clone());
        }
        template::merge(
            &mut variables,
            json!({
                "template": {
                    "source": entry.source,
                    "destination": entry.destination,
                    "processed_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                }
            }),
        );
        variables
    }
}

fn backup_name(destination: &Path) -> PathBuf {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut name = destination.as_os_str().to_os_string();
    name.push(format!(".backup.{epoch}"));
    PathBuf::from(name)
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
