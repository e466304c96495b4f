//! Default rule suggestions per detected stack.

use serde_json::Map;
use serde_json::Value;
use serde_json::json;

use crate::criteria::ProjectType;
use crate::detector::ProjectProfile;

/// Produce a starter rules configuration for a freshly detected project:
/// copy the stack's secret files, run the package-manager install plus any
/// migration steps, then render a session-info doc. The output is exactly
/// the mapping the rules engine consumes.
pub fn suggest_default_rules(profile: &ProjectProfile) -> Map<String, Value> {
    let mut rules = Map::new();

    let secrets = secret_candidates(profile);
    if !secrets.is_empty() {
        let files: Vec<Value> = secrets
            .iter()
            .map(|source| json!({"source": source, "strategy": "copy", "required": false}))
            .collect();
        rules.insert(
            "copy_secrets".to_string(),
            json!({"type": "copy_files", "config": {"files": files}}),
        );
    }

    let mut commands = Vec::new();
    if let Some(manager) = profile.package_manager {
        commands.push(json!({
            "command": manager.install_command(),
            "description": format!("{} install", manager.as_str()),
        }));
    }
    match profile.project_type {
        ProjectType::Rails => {
            commands.push(json!({
                "command": ["bin/rails", "db:prepare"],
                "condition": "file_exists:config/database.yml",
                "description": "prepare the database",
                "required": false,
            }));
        }
        ProjectType::Django => {
            commands.push(json!({
                "command": ["python", "manage.py", "migrate"],
                "condition": "file_exists:manage.py",
                "description": "apply migrations",
                "required": false,
            }));
        }
        _ => {}
    }
    if !commands.is_empty() {
        let mut rule = json!({"type": "setup_commands", "config": {"commands": commands}});
        if rules.contains_key("copy_secrets")
            && let Some(map) = rule.as_object_mut()
        {
            map.insert("dependencies".to_string(), json!(["copy_secrets"]));
        }
        rules.insert("install_dependencies".to_string(), rule);
    }

    let mut doc_dependencies = Vec::new();
    for name in ["copy_secrets", "install_dependencies"] {
        if rules.contains_key(name) {
            doc_dependencies.push(Value::String(name.to_string()));
        }
    }
    let mut doc_rule = json!({
        "type": "template",
        "config": {"templates": [{
            "source": ".sxn/session-info.md",
            "destination": "SESSION.md",
            "required": false,
        }]}
    });
    if !doc_dependencies.is_empty()
        && let Some(map) = doc_rule.as_object_mut()
    {
        map.insert("dependencies".to_string(), Value::Array(doc_dependencies));
    }
    rules.insert("session_docs".to_string(), doc_rule);

    rules
}

/// Secret files worth copying for the stack, whether or not they exist yet
/// (entries are non-required). Files already seen during detection come
/// first.
fn secret_candidates(profile: &ProjectProfile) -> Vec<String> {
    let mut candidates = profile.sensitive_files.clone();

    let stack_defaults: &[&str] = match profile.project_type {
        ProjectType::Rails => &["config/master.key", "config/credentials.yml.enc", ".env"],
        ProjectType::Ruby => &[".env"],
        ProjectType::Nextjs | ProjectType::React | ProjectType::Nodejs => {
            &[".env", ".env.local"]
        }
        ProjectType::Javascript | ProjectType::Typescript => &[".env"],
        ProjectType::Django | ProjectType::Python => &[".env"],
        ProjectType::Go | ProjectType::Rust => &[".env"],
        ProjectType::Unknown => &[],
    };
    for default in stack_defaults {
        if !candidates.iter().any(|c| c == default) {
            candidates.push((*default).to_string());
        }
    }
    candidates
}
