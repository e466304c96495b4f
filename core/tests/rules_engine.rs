#![allow(clippy::unwrap_used)]

//! End-to-end engine scenarios: dependency ordering, cycles, validation
//! failures, partial parallel failure, and template overwrite/rollback.

use std::os::unix::fs::PermissionsExt;

use pretty_assertions::assert_eq;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tempfile::TempDir;

use sxn_core::EngineOptions;
use sxn_core::RuleContext;
use sxn_core::RulesEngine;
use sxn_core::SxnErr;

fn rules(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn engine(project: &TempDir, session: &TempDir, options: EngineOptions) -> RulesEngine {
    let ctx = RuleContext::new(project.path(), session.path())
        .unwrap()
        .with_names("api", "feature-x");
    RulesEngine::new(ctx, options)
}

#[tokio::test]
async fn happy_path_with_dependency() {
    let project = TempDir::new().unwrap();
    let session = TempDir::new().unwrap();
    std::fs::create_dir_all(project.path().join("config")).unwrap();
    std::fs::write(project.path().join("config/master.key"), b"abcd").unwrap();

    let config = rules(json!({
        "copy": {"type": "copy_files", "config": {"files": [
            {"source": "config/master.key", "strategy": "copy"}]}},
        "inst": {"type": "setup_commands", "config": {"commands": [
            {"command": ["echo", "ok"]}]}, "dependencies": ["copy"]}
    }));

    let mut engine = engine(&project, &session, EngineOptions::default());
    let result = engine.apply_rules(&config).await.unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.applied_rules, vec!["copy", "inst"]);
    assert!(result.failed_rules.is_empty());

    let copied = session.path().join("config/master.key");
    assert_eq!(std::fs::read(&copied).unwrap(), b"abcd");
    let mode = std::fs::metadata(&copied).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600, "sensitive default mode");
}

#[tokio::test]
async fn plan_previews_phases_without_executing() {
    let project = TempDir::new().unwrap();
    let session = TempDir::new().unwrap();
    std::fs::create_dir_all(project.path().join("config")).unwrap();
    std::fs::write(project.path().join("config/master.key"), b"abcd").unwrap();

    let config = rules(json!({
        "copy": {"type": "copy_files", "config": {"files": [
            {"source": "config/master.key"}]}},
        "inst": {"type": "setup_commands", "config": {"commands": [
            {"command": ["echo", "ok"]}]}, "dependencies": ["copy"]}
    }));

    let engine = engine(&project, &session, EngineOptions::default());
    let phases = engine.plan(&config).await.unwrap();
    assert_eq!(
        phases,
        vec![vec!["copy".to_string()], vec!["inst".to_string()]]
    );
    assert!(!session.path().join("config").exists(), "plan executes nothing");
}

#[tokio::test]
async fn cycle_is_fatal_and_leaves_filesystem_untouched() {
    let project = TempDir::new().unwrap();
    let session = TempDir::new().unwrap();
    std::fs::write(project.path().join("a.txt"), b"a").unwrap();

    let config = rules(json!({
        "a": {"type": "copy_files", "config": {"files": [{"source": "a.txt"}]},
              "dependencies": ["b"]},
        "b": {"type": "setup_commands", "config": {"commands": [
            {"command": ["echo", "ok"]}]}, "dependencies": ["a"]}
    }));

    let mut engine = engine(&project, &session, EngineOptions::default());
    let err = engine.apply_rules(&config).await.unwrap_err();

    match &err {
        SxnErr::CircularDependency { rule } => {
            assert!(rule == "a" || rule == "b", "cycle names a member: {rule}");
        }
        other => panic!("expected CircularDependency, got {other}"),
    }
    assert!(engine.applied_rules().is_empty());
    assert!(!session.path().join("a.txt").exists());
}

#[tokio::test]
async fn disallowed_command_fails_validation_before_any_execution() {
    let project = TempDir::new().unwrap();
    let session = TempDir::new().unwrap();

    let config = rules(json!({
        "bad": {"type": "setup_commands", "config": {"commands": [
            {"command": ["rm", "-rf", "/"]}]}}
    }));

    let mut engine = engine(&project, &session, EngineOptions::default());
    let err = engine.apply_rules(&config).await.unwrap_err();
    assert!(matches!(err, SxnErr::CommandNotAllowed { .. }), "{err}");
    assert!(engine.applied_rules().is_empty());
    assert_eq!(std::fs::read_dir(session.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn missing_dependency_is_fatal() {
    let project = TempDir::new().unwrap();
    let session = TempDir::new().unwrap();

    let config = rules(json!({
        "inst": {"type": "setup_commands", "config": {"commands": [
            {"command": ["echo", "ok"]}]}, "dependencies": ["ghost"]}
    }));

    let mut engine = engine(&project, &session, EngineOptions::default());
    let err = engine.apply_rules(&config).await.unwrap_err();
    assert!(matches!(err, SxnErr::MissingDependency { .. }), "{err}");
}

#[tokio::test]
async fn unknown_rule_type_is_fatal_at_load() {
    let project = TempDir::new().unwrap();
    let session = TempDir::new().unwrap();

    let config = rules(json!({"weird": {"type": "teleport_files", "config": {}}}));

    let mut engine = engine(&project, &session, EngineOptions::default());
    let err = engine.apply_rules(&config).await.unwrap_err();
    assert!(matches!(err, SxnErr::UnknownRuleType { .. }), "{err}");
}

#[tokio::test]
async fn empty_rule_set_is_immediate_success() {
    let project = TempDir::new().unwrap();
    let session = TempDir::new().unwrap();

    let mut engine = engine(&project, &session, EngineOptions::default());
    let result = engine.apply_rules(&Map::new()).await.unwrap();
    assert!(result.success);
    assert_eq!(result.total_rules, 0);
}

#[tokio::test]
async fn parallel_phase_with_partial_failure_halts_later_phases() {
    let project = TempDir::new().unwrap();
    let session = TempDir::new().unwrap();
    std::fs::write(project.path().join("a.txt"), b"a").unwrap();
    std::fs::write(project.path().join("c.txt"), b"c").unwrap();
    std::fs::write(project.path().join("doc.md"), b"rendered").unwrap();
    // Pre-existing destination without overwrite makes rule `b` fail.
    std::fs::write(session.path().join("doc.md"), b"keep me").unwrap();

    let config = rules(json!({
        "a": {"type": "copy_files", "config": {"files": [{"source": "a.txt"}]}},
        "b": {"type": "template", "config": {"templates": [
            {"source": "doc.md", "destination": "doc.md"}]}},
        "c": {"type": "copy_files", "config": {"files": [{"source": "c.txt"}]}},
        "late": {"type": "setup_commands", "config": {"commands": [
            {"command": ["echo", "never"]}]}, "dependencies": ["a", "b", "c"]}
    }));

    let mut engine = engine(&project, &session, EngineOptions::default());
    let result = engine.apply_rules(&config).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.failed_rules, vec!["b"]);
    assert_eq!(result.skipped_rules, vec!["late"]);

    // The independent rules in the same phase ran to completion.
    let mut applied = result.applied_rules.clone();
    applied.sort();
    assert_eq!(applied, vec!["a", "c"]);
    assert!(session.path().join("a.txt").exists());
    assert!(session.path().join("c.txt").exists());
    // The failing rule never clobbered its destination.
    assert_eq!(std::fs::read(session.path().join("doc.md")).unwrap(), b"keep me");

    // Explicit global rollback reverses exactly a and c.
    let rollback_errors = engine.rollback_all().await;
    assert!(rollback_errors.is_empty());
    assert!(!session.path().join("a.txt").exists());
    assert!(!session.path().join("c.txt").exists());
    assert_eq!(std::fs::read(session.path().join("doc.md")).unwrap(), b"keep me");
    assert!(engine.applied_rules().is_empty());
}

#[tokio::test]
async fn continue_on_failure_runs_later_phases() {
    let project = TempDir::new().unwrap();
    let session = TempDir::new().unwrap();
    std::fs::write(project.path().join("doc.md"), b"rendered").unwrap();
    std::fs::write(session.path().join("doc.md"), b"keep me").unwrap();

    std::fs::write(project.path().join("ok.txt"), b"ok").unwrap();
    let config = rules(json!({
        "b": {"type": "template", "config": {"templates": [
            {"source": "doc.md", "destination": "doc.md"}]}},
        "ok": {"type": "copy_files", "config": {"files": [{"source": "ok.txt"}]}},
        "late": {"type": "setup_commands", "config": {"commands": [
            {"command": ["echo", "still runs"]}]}, "dependencies": ["ok"]}
    }));

    let options = EngineOptions {
        continue_on_failure: true,
        ..EngineOptions::default()
    };
    let mut engine = engine(&project, &session, options);
    let result = engine.apply_rules(&config).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.failed_rules, vec!["b"]);
    assert_eq!(result.applied_rules, vec!["ok", "late"]);
    assert!(result.skipped_rules.is_empty());
}

#[tokio::test]
async fn template_overwrite_backs_up_and_rollback_restores() {
    let project = TempDir::new().unwrap();
    let session = TempDir::new().unwrap();
    std::fs::write(
        project.path().join("README.tpl"),
        b"# session {{ session_name }}\n",
    )
    .unwrap();
    std::fs::write(session.path().join("README.md"), b"old").unwrap();

    let config = rules(json!({
        "doc": {"type": "template", "config": {"templates": [
            {"source": "README.tpl", "destination": "README.md", "overwrite": true}]}}
    }));

    let mut engine = engine(&project, &session, EngineOptions::default());
    let result = engine.apply_rules(&config).await.unwrap();
    assert!(result.success, "errors: {:?}", result.errors);

    let rendered = std::fs::read_to_string(session.path().join("README.md")).unwrap();
    assert_eq!(rendered, "# session feature-x\n");

    let backup = std::fs::read_dir(session.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .find(|name| name.starts_with("README.md.backup."))
        .expect("backup file present");
    assert_eq!(
        std::fs::read_to_string(session.path().join(&backup)).unwrap(),
        "old"
    );

    let rollback_errors = engine.rollback_all().await;
    assert!(rollback_errors.is_empty());
    assert_eq!(
        std::fs::read_to_string(session.path().join("README.md")).unwrap(),
        "old"
    );
    assert!(!session.path().join(&backup).exists());
}

#[tokio::test]
async fn validate_only_reports_invalid_rules_as_skipped() {
    let project = TempDir::new().unwrap();
    let session = TempDir::new().unwrap();
    std::fs::write(project.path().join("ok.txt"), b"ok").unwrap();

    let config = rules(json!({
        "good": {"type": "copy_files", "config": {"files": [{"source": "ok.txt"}]}},
        "missing": {"type": "copy_files", "config": {"files": [{"source": "gone.txt"}]}}
    }));

    let options = EngineOptions {
        validate_only: true,
        ..EngineOptions::default()
    };
    let mut engine = engine(&project, &session, options);
    let result = engine.apply_rules(&config).await.unwrap();

    assert!(!result.success);
    assert!(result.applied_rules.is_empty());
    assert_eq!(result.skipped_rules, vec!["missing"]);
    assert!(!session.path().join("ok.txt").exists(), "validation is pure");
}

#[tokio::test]
async fn result_serializes_with_float_duration() {
    let project = TempDir::new().unwrap();
    let session = TempDir::new().unwrap();

    let config = rules(json!({
        "inst": {"type": "setup_commands", "config": {"commands": [
            {"command": ["echo", "ok"]}]}}
    }));

    let mut engine = engine(&project, &session, EngineOptions::default());
    let result = engine.apply_rules(&config).await.unwrap();

    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["success"], json!(true));
    assert_eq!(value["total_rules"], json!(1));
    assert_eq!(value["applied_rules"], json!(["inst"]));
    assert!(value["total_duration"].is_f64());
    assert_eq!(value["errors"], json!([]));
}

#[tokio::test]
async fn rules_only_write_inside_the_session_root() {
    let project = TempDir::new().unwrap();
    let session = TempDir::new().unwrap();
    std::fs::write(project.path().join("x.txt"), b"x").unwrap();

    let config = rules(json!({
        "escape": {"type": "copy_files", "config": {"files": [
            {"source": "x.txt", "destination": "../escape.txt"}]}}
    }));

    let mut engine = engine(&project, &session, EngineOptions::default());
    let err = engine.apply_rules(&config).await.unwrap_err();
    assert!(matches!(err, SxnErr::BadConfig { .. }), "{err}");
    assert!(!session.path().parent().unwrap().join("escape.txt").exists());
}
