use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

pub type Result<T> = std::result::Result<T, SxnErr>;

#[derive(Error, Debug)]
pub enum SxnErr {
    // -----------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------
    #[error("rule '{rule}' has unknown type '{kind}' (known types: {known})")]
    UnknownRuleType {
        rule: String,
        kind: String,
        known: String,
    },

    #[error("rule '{rule}' is malformed: {reason}")]
    MalformedRuleSpec { rule: String, reason: String },

    #[error("rule '{rule}' has invalid config: {reason}")]
    BadConfig { rule: String, reason: String },

    #[error("rule '{rule}' requires source '{src}' which does not exist")]
    MissingRequiredSource { rule: String, src: String },

    #[error("rule '{rule}' depends on '{dependency}', which is not a valid loaded rule")]
    MissingDependency { rule: String, dependency: String },

    #[error("circular dependency detected involving rule '{rule}'")]
    CircularDependency { rule: String },

    #[error("duplicate rule name '{rule}' in rules configuration")]
    DuplicateRule { rule: String },

    // -----------------------------------------------------------------
    // Security
    // -----------------------------------------------------------------
    #[error("path '{path}' escapes sandbox root '{root}'")]
    PathEscape { path: PathBuf, root: PathBuf },

    #[error("path '{path}' is not contained in '{root}'")]
    NotContained { path: PathBuf, root: PathBuf },

    #[error("command not in allow-list: {program} (add it to the allow-list or use a permitted tool)")]
    CommandNotAllowed { program: String },

    #[error("bad environment: {reason}")]
    BadEnvironment { reason: String },

    // -----------------------------------------------------------------
    // I/O
    // -----------------------------------------------------------------
    #[error("source file '{path}' does not exist")]
    SourceMissing { path: PathBuf },

    #[error("destination '{path}' already exists (pass force to overwrite)")]
    DestinationExists { path: PathBuf },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    // -----------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------
    #[error("command '{program}' exited with status {exit_status}")]
    CommandFailed { program: String, exit_status: i32 },

    #[error("command '{program}' timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("failed to spawn '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("template syntax error in '{name}': {reason}")]
    TemplateSyntax { name: String, reason: String },

    #[error("template processing failed: {reason}")]
    TemplateProcessing { reason: String },

    // -----------------------------------------------------------------
    // Engine
    // -----------------------------------------------------------------
    /// Wraps anything unexpected that escapes a rule, including panics
    /// contained at the worker-task boundary.
    #[error("engine error: {0}")]
    Engine(String),

    #[error(transparent)]
    TokioJoin(#[from] JoinError),
}

impl SxnErr {
    /// Name the rule this error belongs to, when it carries one. The engine
    /// uses this to group per-rule failures in the execution report.
    pub fn rule_name(&self) -> Option<&str> {
        match self {
            SxnErr::UnknownRuleType { rule, .. }
            | SxnErr::MalformedRuleSpec { rule, .. }
            | SxnErr::BadConfig { rule, .. }
            | SxnErr::MissingRequiredSource { rule, .. }
            | SxnErr::MissingDependency { rule, .. }
            | SxnErr::CircularDependency { rule }
            | SxnErr::DuplicateRule { rule } => Some(rule),
            _ => None,
        }
    }
}
