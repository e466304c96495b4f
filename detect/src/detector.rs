//! Directory classification and profile assembly.

use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use wildmatch::WildMatch;

use crate::criteria::CRITERIA;
use crate::criteria::Confidence;
use crate::criteria::Criterion;
use crate::criteria::NODE_DEPENDENCY_INDICATORS;
use crate::criteria::NODE_SCRIPT_INDICATORS;
use crate::criteria::Patterns;
use crate::criteria::ProjectType;

const FILE_FOUND_SCORE: f64 = 10.0;
const ALL_FILES_BONUS: f64 = 20.0;
const PATTERN_HIT_SCORE: f64 = 30.0;
const NODE_TIEBREAK_BONUS: f64 = 50.0;

/// Candidate secret files checked per stack; only ones that actually exist
/// end up in the profile.
const SENSITIVE_CANDIDATES: &[&str] = &[
    "config/master.key",
    "config/credentials.yml.enc",
    "config/secrets.yml",
    ".env",
    ".env.local",
    ".env.development",
    ".env.production",
    ".env.test",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageManager {
    Bundler,
    Npm,
    Yarn,
    Pnpm,
    Pip,
    Pipenv,
    Poetry,
    Cargo,
    Go,
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Bundler => "bundler",
            PackageManager::Npm => "npm",
            PackageManager::Yarn => "yarn",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Pip => "pip",
            PackageManager::Pipenv => "pipenv",
            PackageManager::Poetry => "poetry",
            PackageManager::Cargo => "cargo",
            PackageManager::Go => "go",
        }
    }

    /// The install step a fresh working copy needs.
    pub fn install_command(&self) -> Vec<&'static str> {
        match self {
            PackageManager::Bundler => vec!["bundle", "install"],
            PackageManager::Npm => vec!["npm", "install"],
            PackageManager::Yarn => vec!["yarn", "install"],
            PackageManager::Pnpm => vec!["pnpm", "install"],
            PackageManager::Pip => vec!["pip", "install", "-r", "requirements.txt"],
            PackageManager::Pipenv => vec!["pipenv", "install"],
            PackageManager::Poetry => vec!["poetry", "install"],
            PackageManager::Cargo => vec!["cargo", "build"],
            PackageManager::Go => vec!["go", "mod", "download"],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectProfile {
    #[serde(rename = "type")]
    pub project_type: ProjectType,
    pub language: Option<String>,
    pub package_manager: Option<PackageManager>,
    pub framework: Option<String>,
    pub has_docker: bool,
    pub has_tests: bool,
    pub has_ci: bool,
    pub database: Option<String>,
    pub sensitive_files: Vec<String>,
}

/// Classify `dir` and assemble its profile. Unreadable files simply do not
/// contribute evidence; an unrecognizable directory comes back as
/// [`ProjectType::Unknown`].
pub fn detect(dir: &Path) -> ProjectProfile {
    let project_type = classify(dir);
    let package_manager = detect_package_manager(dir, project_type);

    let profile = ProjectProfile {
        language: project_type.language().map(str::to_string),
        framework: project_type.framework().map(str::to_string),
        package_manager,
        has_docker: has_docker(dir),
        has_tests: has_tests(dir),
        has_ci: has_ci(dir),
        database: detect_database(dir),
        sensitive_files: existing_sensitive_files(dir),
        project_type,
    };
    debug!(?profile.project_type, ?profile.package_manager, "detected project");
    profile
}

fn classify(dir: &Path) -> ProjectType {
    let mut best: Option<(f64, usize)> = None;

    for (index, criterion) in CRITERIA.iter().enumerate() {
        let score = score_criterion(dir, criterion);
        if score <= 0.0 {
            continue;
        }
        // Strictly-greater keeps declaration order as the tie-break.
        let better = match best {
            Some((best_score, _)) => score > best_score,
            None => true,
        };
        if better {
            best = Some((score, index));
        }
    }

    best.map_or(ProjectType::Unknown, |(_, index)| {
        CRITERIA[index].project_type
    })
}

fn score_criterion(dir: &Path, criterion: &Criterion) -> f64 {
    let found = criterion
        .files
        .iter()
        .filter(|pattern| marker_exists(dir, pattern))
        .count();
    let all_found = found == criterion.files.len();

    let mut score = FILE_FOUND_SCORE * found as f64;
    if all_found {
        score += ALL_FILES_BONUS;
    }

    let hits = pattern_hits(dir, &criterion.patterns);
    if criterion.confidence == Confidence::High && !criterion.patterns.is_empty() {
        // High-confidence criteria with content patterns are all-or-nothing.
        if !all_found || hits < criterion.patterns.category_count() {
            return 0.0;
        }
    } else {
        score += PATTERN_HIT_SCORE * hits as f64;
    }

    if criterion.project_type == ProjectType::Nodejs && looks_like_node_service(dir) {
        score += NODE_TIEBREAK_BONUS;
    }

    score * criterion.confidence.multiplier()
}

/// A marker is either a literal relative path or a glob in its final
/// component, matched against the entries of the parent directory.
fn marker_exists(dir: &Path, pattern: &str) -> bool {
    if !pattern.contains(['*', '?']) {
        return dir.join(pattern).exists();
    }
    let relative = Path::new(pattern);
    let parent = relative.parent().unwrap_or_else(|| Path::new(""));
    let Some(file_pattern) = relative.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let matcher = WildMatch::new(file_pattern);

    let Ok(entries) = std::fs::read_dir(dir.join(parent)) else {
        return false;
    };
    entries
        .filter_map(|entry| entry.ok())
        .any(|entry| matcher.matches(&entry.file_name().to_string_lossy()))
}

fn pattern_hits(dir: &Path, patterns: &Patterns) -> usize {
    let mut hits = 0;

    if !patterns.gemfile_contains.is_empty()
        && contains_any(&read(dir, "Gemfile"), patterns.gemfile_contains)
    {
        hits += 1;
    }
    if !patterns.package_json_deps.is_empty() {
        let deps = package_json_dependencies(dir);
        if patterns
            .package_json_deps
            .iter()
            .any(|needle| deps.iter().any(|dep| dep == needle))
        {
            hits += 1;
        }
    }
    if !patterns.requirements_contains.is_empty() {
        let text = read(dir, "requirements.txt").to_lowercase();
        if patterns
            .requirements_contains
            .iter()
            .any(|needle| text.contains(&needle.to_lowercase()))
        {
            hits += 1;
        }
    }
    hits
}

fn looks_like_node_service(dir: &Path) -> bool {
    let Some(manifest) = package_json(dir) else {
        return false;
    };

    let deps = package_json_dependencies(dir);
    if NODE_DEPENDENCY_INDICATORS
        .iter()
        .any(|needle| deps.iter().any(|dep| dep == needle))
    {
        return true;
    }

    if let Some(scripts) = manifest.get("scripts").and_then(Value::as_object)
        && NODE_SCRIPT_INDICATORS
            .iter()
            .any(|script| scripts.contains_key(*script))
    {
        return true;
    }

    ["main", "module", "exports"]
        .iter()
        .any(|key| manifest.get(*key).is_some())
}

fn package_json(dir: &Path) -> Option<Value> {
    let text = std::fs::read_to_string(dir.join("package.json")).ok()?;
    serde_json::from_str(&text).ok()
}

fn package_json_dependencies(dir: &Path) -> Vec<String> {
    let Some(manifest) = package_json(dir) else {
        return Vec::new();
    };
    let mut deps = Vec::new();
    for section in ["dependencies", "devDependencies"] {
        if let Some(map) = manifest.get(section).and_then(Value::as_object) {
            deps.extend(map.keys().cloned());
        }
    }
    deps
}

fn detect_package_manager(dir: &Path, project_type: ProjectType) -> Option<PackageManager> {
    // Lockfiles are the most specific evidence.
    if dir.join("Gemfile.lock").exists() || dir.join("Gemfile").exists() {
        return Some(PackageManager::Bundler);
    }
    if dir.join("pnpm-lock.yaml").exists() {
        return Some(PackageManager::Pnpm);
    }
    if dir.join("yarn.lock").exists() {
        return Some(PackageManager::Yarn);
    }
    if dir.join("package.json").exists() {
        return Some(PackageManager::Npm);
    }
    if dir.join("Pipfile").exists() {
        return Some(PackageManager::Pipenv);
    }
    if dir.join("poetry.lock").exists() || dir.join("pyproject.toml").exists() {
        return Some(PackageManager::Poetry);
    }
    if dir.join("requirements.txt").exists() {
        return Some(PackageManager::Pip);
    }
    if dir.join("go.mod").exists() {
        return Some(PackageManager::Go);
    }
    if dir.join("Cargo.toml").exists() {
        return Some(PackageManager::Cargo);
    }
    match project_type {
        ProjectType::Go => Some(PackageManager::Go),
        ProjectType::Rust => Some(PackageManager::Cargo),
        _ => None,
    }
}

fn has_docker(dir: &Path) -> bool {
    dir.join("Dockerfile").exists()
        || marker_exists(dir, "docker-compose.*")
        || marker_exists(dir, "compose.y*ml")
}

fn has_tests(dir: &Path) -> bool {
    ["spec", "test", "tests", "__tests__"]
        .iter()
        .any(|name| dir.join(name).is_dir())
        || marker_exists(dir, "*_test.go")
}

fn has_ci(dir: &Path) -> bool {
    dir.join(".github/workflows").is_dir()
        || dir.join(".gitlab-ci.yml").exists()
        || dir.join(".circleci").is_dir()
}

fn detect_database(dir: &Path) -> Option<String> {
    let database_yml = read(dir, "config/database.yml").to_lowercase();
    if database_yml.contains("postgres") {
        return Some("postgresql".to_string());
    }
    if database_yml.contains("mysql") {
        return Some("mysql".to_string());
    }
    if database_yml.contains("sqlite") {
        return Some("sqlite".to_string());
    }

    let deps = package_json_dependencies(dir);
    let gemfile = read(dir, "Gemfile").to_lowercase();
    if deps.iter().any(|d| d == "pg") || gemfile.contains("\"pg\"") || gemfile.contains("'pg'") {
        return Some("postgresql".to_string());
    }
    if deps.iter().any(|d| d == "mysql2") || gemfile.contains("mysql2") {
        return Some("mysql".to_string());
    }
    if deps.iter().any(|d| d == "sqlite3") || gemfile.contains("sqlite3") {
        return Some("sqlite".to_string());
    }
    None
}

fn existing_sensitive_files(dir: &Path) -> Vec<String> {
    SENSITIVE_CANDIDATES
        .iter()
        .filter(|candidate| dir.join(candidate).exists())
        .map(|candidate| (*candidate).to_string())
        .collect()
}

fn read(dir: &Path, relative: &str) -> String {
    std::fs::read_to_string(dir.join(relative)).unwrap_or_default()
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    let haystack = haystack.to_lowercase();
    needles
        .iter()
        .any(|needle| haystack.contains(&needle.to_lowercase()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn literal_markers_check_the_exact_path() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(dir.path().join("config/application.rb"), b"").unwrap();

        assert!(marker_exists(dir.path(), "config/application.rb"));
        assert!(!marker_exists(dir.path(), "config/routes.rb"));
    }

    #[test]
    fn glob_markers_match_directory_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("next.config.mjs"), b"").unwrap();

        assert!(marker_exists(dir.path(), "next.config.*"));
        assert!(!marker_exists(dir.path(), "vite.config.*"));
    }

    #[test]
    fn high_confidence_with_patterns_is_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Gemfile"), "gem 'sinatra'\n").unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(dir.path().join("config/application.rb"), b"").unwrap();

        let rails = CRITERIA
            .iter()
            .find(|c| c.project_type == ProjectType::Rails)
            .unwrap();
        // Both marker files exist but the Gemfile lacks rails itself.
        assert_eq!(score_criterion(dir.path(), rails), 0.0);

        std::fs::write(dir.path().join("Gemfile"), "gem 'rails'\n").unwrap();
        assert!(score_criterion(dir.path(), rails) > 0.0);
    }

    #[test]
    fn confidence_multiplier_separates_equal_evidence() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();

        let javascript = CRITERIA
            .iter()
            .find(|c| c.project_type == ProjectType::Javascript)
            .unwrap();
        // One file found, all of this criterion's files present.
        assert_eq!(score_criterion(dir.path(), javascript), 30.0 * 0.8);
    }
}
