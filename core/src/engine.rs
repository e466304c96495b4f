//! The rules engine: load, validate, schedule, execute, roll back.
//!
//! Execution is phase-by-phase. Within a phase rules have no dependencies on
//! one another and may run in parallel on a bounded worker pool; between
//! phases the engine is strictly sequential. The engine is stateless across
//! runs except for the applied-rule list it retains so the caller can invoke
//! [`RulesEngine::rollback_all`] after a failure.

use std::any::Any;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use serde::Serializer;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::error::SxnErr;
use crate::rules::Rule;
use crate::rules::RuleContext;
use crate::rules::RuleState;
use crate::schedule;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Dispatch rules of one phase concurrently.
    pub parallel: bool,
    /// Keep executing later phases after a failure.
    pub continue_on_failure: bool,
    /// Upper bound on concurrent workers within a phase.
    pub max_parallelism: usize,
    /// Stop after validation and report instead of executing.
    pub validate_only: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            continue_on_failure: false,
            max_parallelism: 4,
            validate_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleError {
    pub rule: String,
    pub message: String,
}

/// Outcome of one engine run, shaped for JSON consumers: rule names only,
/// duration in float seconds.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub total_rules: usize,
    pub applied_rules: Vec<String>,
    pub failed_rules: Vec<String>,
    pub skipped_rules: Vec<String>,
    #[serde(serialize_with = "duration_secs")]
    pub total_duration: Duration,
    pub errors: Vec<RuleError>,
}

fn duration_secs<S: Serializer>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(d.as_secs_f64())
}

pub struct RulesEngine {
    ctx: RuleContext,
    options: EngineOptions,
    /// Rules in completion order, retained for global rollback.
    applied: Vec<Rule>,
}

impl RulesEngine {
    pub fn new(ctx: RuleContext, options: EngineOptions) -> Self {
        Self {
            ctx,
            options,
            applied: Vec::new(),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Names of applied rules still eligible for [`Self::rollback_all`], in
    /// completion order.
    pub fn applied_rules(&self) -> Vec<String> {
        self.applied.iter().map(|r| r.name().to_string()).collect()
    }

    /// Run a rules configuration to completion.
    ///
    /// Load and validation problems (unknown types, malformed specs, invalid
    /// configs, missing dependencies, cycles) are fatal for the whole run
    /// and surface as the returned error; no rule is applied in that case.
    /// Per-rule execution failures land in the result's `failed_rules`.
    pub async fn apply_rules(
        &mut self,
        rules_config: &Map<String, Value>,
    ) -> Result<ExecutionResult> {
        let start = Instant::now();
        let total_rules = rules_config.len();

        if rules_config.is_empty() {
            return Ok(ExecutionResult {
                success: true,
                total_rules: 0,
                applied_rules: Vec::new(),
                failed_rules: Vec::new(),
                skipped_rules: Vec::new(),
                total_duration: start.elapsed(),
                errors: Vec::new(),
            });
        }

        // Load. Any malformed entry aborts the run before anything touches
        // the filesystem.
        let mut rules = load_rules(rules_config)?;

        // Validate every rule. Outside validate-only mode the first invalid
        // rule is fatal.
        let mut invalid: Vec<RuleError> = Vec::new();
        for rule in rules.values_mut() {
            if let Err(err) = rule.validate(&self.ctx).await {
                if !self.options.validate_only {
                    return Err(err);
                }
                invalid.push(RuleError {
                    rule: rule.name().to_string(),
                    message: err.to_string(),
                });
            }
        }

        // Dependency references must point at loaded, valid rules; cycles
        // are fatal either way.
        let phases = schedule_of(&rules)?;

        debug!(
            phases = phases.len(),
            rules = rules.len(),
            "computed phase schedule"
        );

        if self.options.validate_only {
            let success = invalid.is_empty();
            return Ok(ExecutionResult {
                success,
                total_rules,
                applied_rules: Vec::new(),
                failed_rules: Vec::new(),
                skipped_rules: invalid.iter().map(|e| e.rule.clone()).collect(),
                total_duration: start.elapsed(),
                errors: invalid,
            });
        }

        // Execute.
        let applied: Arc<Mutex<Vec<Rule>>> = Arc::new(Mutex::new(Vec::new()));
        let mut failed: Vec<RuleError> = Vec::new();
        let mut skipped: Vec<(String, String)> = Vec::new();
        let mut engine_errors: Vec<String> = Vec::new();
        let mut halted = false;

        for phase in &phases {
            if halted {
                for name in phase {
                    skipped.push((name.clone(), "not executed: earlier phase failed".to_string()));
                }
                continue;
            }

            let phase_rules: Vec<Rule> = phase
                .iter()
                .filter_map(|name| rules.remove(name))
                .collect();

            if self.options.parallel && phase_rules.len() > 1 {
                self.run_phase_parallel(phase_rules, &applied, &mut failed, &mut engine_errors)
                    .await;
            } else {
                self.run_phase_sequential(phase_rules, &applied, &mut failed)
                    .await;
            }

            if !failed.is_empty() && !self.options.continue_on_failure {
                halted = true;
            }
        }

        let applied = match Arc::try_unwrap(applied) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(|poison| poison.into_inner()),
            Err(_) => {
                engine_errors.push("applied-rule list still shared after join".to_string());
                Vec::new()
            }
        };
        let applied_rules: Vec<String> = applied.iter().map(|r| r.name().to_string()).collect();
        self.applied = applied;

        let mut errors: Vec<RuleError> = failed.clone();
        errors.extend(engine_errors.iter().map(|message| RuleError {
            rule: String::new(),
            message: message.clone(),
        }));

        let result = ExecutionResult {
            success: failed.is_empty() && engine_errors.is_empty(),
            total_rules,
            applied_rules,
            failed_rules: failed.iter().map(|e| e.rule.clone()).collect(),
            skipped_rules: skipped.iter().map(|(name, _)| name.clone()).collect(),
            total_duration: start.elapsed(),
            errors,
        };

        if result.success {
            info!(
                applied = result.applied_rules.len(),
                duration = ?result.total_duration,
                "all rules applied"
            );
        } else {
            warn!(
                failed = result.failed_rules.len(),
                skipped = result.skipped_rules.len(),
                "rule execution finished with failures"
            );
        }
        Ok(result)
    }

    /// Compute the phase schedule for a configuration without executing
    /// anything. Useful for previewing what a run would do.
    pub async fn plan(&self, rules_config: &Map<String, Value>) -> Result<Vec<Vec<String>>> {
        let mut rules = load_rules(rules_config)?;
        for rule in rules.values_mut() {
            rule.validate(&self.ctx).await?;
        }
        schedule_of(&rules)
    }

    /// Reverse everything applied so far, newest first. Rollback errors are
    /// reported but never stop the loop; the applied list is cleared either
    /// way.
    pub async fn rollback_all(&mut self) -> Vec<RuleError> {
        let mut errors = Vec::new();
        let rules = std::mem::take(&mut self.applied);
        for mut rule in rules.into_iter().rev() {
            let name = rule.name().to_string();
            if let Err(err) = rule.rollback(&self.ctx).await {
                error!(rule = %name, "rollback failed: {err}");
                errors.push(RuleError {
                    rule: name,
                    message: err.to_string(),
                });
            }
        }
        errors
    }

    async fn run_phase_parallel(
        &self,
        phase_rules: Vec<Rule>,
        applied: &Arc<Mutex<Vec<Rule>>>,
        failed: &mut Vec<RuleError>,
        engine_errors: &mut Vec<String>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.options.max_parallelism.max(1)));
        let mut join_set = JoinSet::new();

        for rule in phase_rules {
            let ctx = self.ctx.clone();
            let semaphore = Arc::clone(&semaphore);
            let applied = Arc::clone(applied);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                run_one(rule, &ctx, &applied).await
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    debug!(rule = %name, "rule completed");
                }
                Ok((name, Err(err))) => {
                    failed.push(RuleError {
                        rule: name,
                        message: err.to_string(),
                    });
                }
                Err(join_err) => {
                    engine_errors.push(format!("rule worker died: {join_err}"));
                }
            }
        }
    }

    async fn run_phase_sequential(
        &self,
        phase_rules: Vec<Rule>,
        applied: &Arc<Mutex<Vec<Rule>>>,
        failed: &mut Vec<RuleError>,
    ) {
        for rule in phase_rules {
            let (name, outcome) = run_one(rule, &self.ctx, applied).await;
            if let Err(err) = outcome {
                failed.push(RuleError {
                    rule: name,
                    message: err.to_string(),
                });
            }
        }
    }
}

fn load_rules(rules_config: &Map<String, Value>) -> Result<BTreeMap<String, Rule>> {
    let mut rules: BTreeMap<String, Rule> = BTreeMap::new();
    for (name, spec) in rules_config {
        let rule = Rule::from_spec(name, spec)?;
        if rules.insert(name.clone(), rule).is_some() {
            return Err(SxnErr::DuplicateRule { rule: name.clone() });
        }
    }
    Ok(rules)
}

/// Dependency checks plus Kahn layering over the validated rules.
fn schedule_of(rules: &BTreeMap<String, Rule>) -> Result<Vec<Vec<String>>> {
    let graph: BTreeMap<String, BTreeSet<String>> = rules
        .values()
        .filter(|r| r.state() == RuleState::Validated)
        .map(|r| (r.name().to_string(), r.dependencies().clone()))
        .collect();
    schedule::check_dependencies(&graph)?;
    schedule::detect_cycles(&graph)?;
    schedule::phases(&graph)
}

/// Apply a single rule, containing panics at this boundary. On success the
/// rule moves into the shared applied list (completion order); on failure
/// its local rollback is attempted immediately and the rule is dropped.
async fn run_one(
    mut rule: Rule,
    ctx: &RuleContext,
    applied: &Arc<Mutex<Vec<Rule>>>,
) -> (String, Result<()>) {
    let name = rule.name().to_string();

    let outcome = AssertUnwindSafe(rule.apply(ctx)).catch_unwind().await;
    let outcome = match outcome {
        Ok(result) => result,
        Err(payload) => {
            let message = format!("rule '{name}' panicked: {}", panic_message(payload.as_ref()));
            rule.mark_engine_failure(message.clone());
            Err(SxnErr::Engine(message))
        }
    };

    match outcome {
        Ok(()) => {
            if let Ok(mut list) = applied.lock() {
                list.push(rule);
            }
            (name, Ok(()))
        }
        Err(err) => {
            warn!(rule = %name, "apply failed: {err}");
            if rule.is_rollbackable() {
                if let Err(rollback_err) = rule.rollback(ctx).await {
                    error!(rule = %name, "local rollback failed: {rollback_err}");
                }
            }
            (name, Err(err))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
