//! Rule instances: the unit of work the engine validates, applies, and
//! rolls back.
//!
//! A [`Rule`] is an envelope (name, dependencies, state machine, recorded
//! changes, timing) around one [`RuleKind`] variant holding that variant's
//! typed configuration. The envelope owns all bookkeeping so the variants
//! only implement validate/apply/rollback against a [`RuleContext`].

pub mod copy_files;
pub mod setup_commands;
pub mod template;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::cipher::Cipher;
use crate::copier::SecureCopier;
use crate::error::Result;
use crate::error::SxnErr;
use crate::sandbox::SandboxRoot;

pub use copy_files::CopyFilesRule;
pub use setup_commands::SetupCommandsRule;
pub use template::TemplateRule;

pub const KNOWN_RULE_TYPES: &[&str] = &["copy_files", "setup_commands", "template"];

/// Everything a rule needs to act: the two sandbox roots, naming for
/// template context, and the optional cipher for at-rest encryption.
#[derive(Clone)]
pub struct RuleContext {
    pub project_root: SandboxRoot,
    pub session_root: SandboxRoot,
    pub project_name: Option<String>,
    pub session_name: Option<String>,
    pub cipher: Option<Arc<dyn Cipher>>,
}

impl RuleContext {
    pub fn new(
        project_root: impl AsRef<std::path::Path>,
        session_root: impl AsRef<std::path::Path>,
    ) -> Result<Self> {
        Ok(Self {
            project_root: SandboxRoot::new(project_root)?,
            session_root: SandboxRoot::new(session_root)?,
            project_name: None,
            session_name: None,
            cipher: None,
        })
    }

    pub fn with_names(
        mut self,
        project_name: impl Into<String>,
        session_name: impl Into<String>,
    ) -> Self {
        self.project_name = Some(project_name.into());
        self.session_name = Some(session_name.into());
        self
    }

    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub(crate) fn copier(&self) -> SecureCopier {
        let copier = SecureCopier::new(self.project_root.clone(), self.session_root.clone());
        match &self.cipher {
            Some(cipher) => copier.with_cipher(Arc::clone(cipher)),
            None => copier,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    Pending,
    Validating,
    Validated,
    Applying,
    Applied,
    RollingBack,
    RolledBack,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    FileCreated,
    FileModified,
    DirectoryCreated,
    SymlinkCreated,
    CommandExecuted,
}

/// One recorded effect of a rule, specific enough to drive rollback.
/// `CommandExecuted` entries are audit-only and never reversed.
#[derive(Debug, Clone, Serialize)]
pub struct Change {
    pub kind: ChangeKind,
    /// Path or command line this change concerns.
    pub target: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl Change {
    pub fn new(kind: ChangeKind, target: impl Into<String>, metadata: Value) -> Self {
        Self {
            kind,
            target: target.into(),
            metadata,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub enum RuleKind {
    CopyFiles(CopyFilesRule),
    SetupCommands(SetupCommandsRule),
    Template(TemplateRule),
}

impl RuleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleKind::CopyFiles(_) => "copy_files",
            RuleKind::SetupCommands(_) => "setup_commands",
            RuleKind::Template(_) => "template",
        }
    }
}

#[derive(Debug)]
pub struct Rule {
    name: String,
    kind: RuleKind,
    dependencies: BTreeSet<String>,
    state: RuleState,
    changes: Vec<Change>,
    errors: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Rule {
    /// Build a rule from one entry of the rules configuration. The entry
    /// must be a map carrying a known `type`; `config` and `dependencies`
    /// are optional.
    pub fn from_spec(name: &str, spec: &Value) -> Result<Self> {
        let Some(map) = spec.as_object() else {
            return Err(SxnErr::MalformedRuleSpec {
                rule: name.to_string(),
                reason: "rule spec must be a map".to_string(),
            });
        };

        let type_name = map
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SxnErr::MalformedRuleSpec {
                rule: name.to_string(),
                reason: "missing 'type' field".to_string(),
            })?;

        let config = map.get("config").cloned().unwrap_or_else(|| Value::Object(Default::default()));

        let mut dependencies = BTreeSet::new();
        if let Some(deps) = map.get("dependencies") {
            let entries = deps.as_array().ok_or_else(|| SxnErr::MalformedRuleSpec {
                rule: name.to_string(),
                reason: "'dependencies' must be a list of rule names".to_string(),
            })?;
            for dep in entries {
                let dep = dep.as_str().ok_or_else(|| SxnErr::MalformedRuleSpec {
                    rule: name.to_string(),
                    reason: "'dependencies' must be a list of rule names".to_string(),
                })?;
                dependencies.insert(dep.to_string());
            }
        }

        let kind = match type_name {
            "copy_files" => RuleKind::CopyFiles(CopyFilesRule::from_config(name, &config)?),
            "setup_commands" => {
                RuleKind::SetupCommands(SetupCommandsRule::from_config(name, &config)?)
            }
            "template" => RuleKind::Template(TemplateRule::from_config(name, &config)?),
            other => {
                return Err(SxnErr::UnknownRuleType {
                    rule: name.to_string(),
                    kind: other.to_string(),
                    known: KNOWN_RULE_TYPES.join(", "),
                });
            }
        };

        Ok(Self {
            name: name.to_string(),
            kind,
            dependencies,
            state: RuleState::Pending,
            changes: Vec::new(),
            errors: Vec::new(),
            started_at: None,
            finished_at: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    pub fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    pub fn state(&self) -> RuleState {
        self.state
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// A rule can be rolled back once it has recorded changes, whether the
    /// apply completed or died partway through.
    pub fn is_rollbackable(&self) -> bool {
        matches!(self.state, RuleState::Applied | RuleState::Failed) && !self.changes.is_empty()
    }

    /// Check configuration and preconditions without touching the session.
    pub async fn validate(&mut self, ctx: &RuleContext) -> Result<()> {
        debug_assert!(matches!(
            self.state,
            RuleState::Pending | RuleState::Validated
        ));
        self.state = RuleState::Validating;

        let outcome = match &self.kind {
            RuleKind::CopyFiles(rule) => rule.validate(&self.name, ctx).await,
            RuleKind::SetupCommands(rule) => rule.validate(&self.name, ctx).await,
            RuleKind::Template(rule) => rule.validate(&self.name, ctx).await,
        };

        match outcome {
            Ok(()) => {
                self.state = RuleState::Validated;
                Ok(())
            }
            Err(err) => {
                self.errors.push(err.to_string());
                self.state = RuleState::Failed;
                Err(err)
            }
        }
    }

    /// Perform the rule's work, recording every effect in `changes`.
    pub async fn apply(&mut self, ctx: &RuleContext) -> Result<()> {
        if self.state != RuleState::Validated {
            return Err(SxnErr::Engine(format!(
                "rule '{}' applied in state {:?}",
                self.name, self.state
            )));
        }
        self.state = RuleState::Applying;
        self.started_at = Some(Utc::now());

        let outcome = match &self.kind {
            RuleKind::CopyFiles(rule) => rule.apply(ctx, &mut self.changes).await,
            RuleKind::SetupCommands(rule) => rule.apply(ctx, &mut self.changes).await,
            RuleKind::Template(rule) => rule.apply(ctx, &mut self.changes).await,
        };

        self.finished_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                self.state = RuleState::Applied;
                debug!(rule = %self.name, changes = self.changes.len(), "rule applied");
                Ok(())
            }
            Err(err) => {
                self.errors.push(err.to_string());
                self.state = RuleState::Failed;
                Err(err)
            }
        }
    }

    /// Undo recorded changes in reverse order.
    pub async fn rollback(&mut self, ctx: &RuleContext) -> Result<()> {
        if !self.is_rollbackable() {
            return Ok(());
        }
        self.state = RuleState::RollingBack;

        let outcome = match &self.kind {
            RuleKind::CopyFiles(rule) => rule.rollback(ctx, &self.changes).await,
            RuleKind::SetupCommands(rule) => rule.rollback(ctx, &self.changes).await,
            RuleKind::Template(rule) => rule.rollback(ctx, &self.changes).await,
        };

        match outcome {
            Ok(()) => {
                self.state = RuleState::RolledBack;
                debug!(rule = %self.name, "rule rolled back");
                Ok(())
            }
            Err(err) => {
                self.errors.push(err.to_string());
                self.state = RuleState::Failed;
                Err(err)
            }
        }
    }

    /// Record a failure produced outside the rule's own code (worker panic,
    /// join error) so the report can still name this rule.
    pub(crate) fn mark_engine_failure(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.state = RuleState::Failed;
    }
}

pub(crate) fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn change_records_carry_timestamps() {
        let change = Change::new(ChangeKind::FileCreated, "/tmp/x", json!({"source": "x"}));
        assert_eq!(change.target, "/tmp/x");
        assert!(change.timestamp <= Utc::now());
    }

    #[test]
    fn from_spec_rejects_non_map() {
        let err = Rule::from_spec("bad", &json!("nope")).unwrap_err();
        assert!(matches!(err, SxnErr::MalformedRuleSpec { .. }), "{err}");
    }

    #[test]
    fn from_spec_rejects_missing_type() {
        let err = Rule::from_spec("bad", &json!({"config": {}})).unwrap_err();
        assert!(matches!(err, SxnErr::MalformedRuleSpec { .. }), "{err}");
    }

    #[test]
    fn from_spec_rejects_unknown_type() {
        let err = Rule::from_spec("bad", &json!({"type": "mystery"})).unwrap_err();
        match err {
            SxnErr::UnknownRuleType { kind, known, .. } => {
                assert_eq!(kind, "mystery");
                assert!(known.contains("copy_files"));
                assert!(known.contains("setup_commands"));
                assert!(known.contains("template"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn from_spec_collects_dependencies() {
        let rule = Rule::from_spec(
            "inst",
            &json!({
                "type": "setup_commands",
                "config": {"commands": [{"command": ["echo", "ok"]}]},
                "dependencies": ["copy", "other"]
            }),
        )
        .unwrap();
        assert_eq!(rule.dependencies().len(), 2);
        assert!(rule.dependencies().contains("copy"));
        assert_eq!(rule.state(), RuleState::Pending);
        assert_eq!(rule.kind().type_name(), "setup_commands");
    }

    #[test]
    fn from_spec_rejects_non_string_dependencies() {
        let err = Rule::from_spec(
            "bad",
            &json!({
                "type": "setup_commands",
                "config": {"commands": [{"command": ["echo", "ok"]}]},
                "dependencies": [1, 2]
            }),
        )
        .unwrap_err();
        assert!(matches!(err, SxnErr::MalformedRuleSpec { .. }), "{err}");
    }
}
