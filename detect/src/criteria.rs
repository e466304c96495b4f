//! The scoring table: one criterion per supported project type.
//!
//! Declaration order doubles as the tie-break order, so keep the table
//! sorted by specificity (frameworks before their base languages).

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    Rails,
    Ruby,
    Nextjs,
    React,
    Nodejs,
    Javascript,
    Typescript,
    Django,
    Python,
    Go,
    Rust,
    Unknown,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectType::Rails => "rails",
            ProjectType::Ruby => "ruby",
            ProjectType::Nextjs => "nextjs",
            ProjectType::React => "react",
            ProjectType::Nodejs => "nodejs",
            ProjectType::Javascript => "javascript",
            ProjectType::Typescript => "typescript",
            ProjectType::Django => "django",
            ProjectType::Python => "python",
            ProjectType::Go => "go",
            ProjectType::Rust => "rust",
            ProjectType::Unknown => "unknown",
        }
    }

    pub fn language(&self) -> Option<&'static str> {
        match self {
            ProjectType::Rails | ProjectType::Ruby => Some("ruby"),
            ProjectType::Nextjs
            | ProjectType::React
            | ProjectType::Nodejs
            | ProjectType::Javascript => Some("javascript"),
            ProjectType::Typescript => Some("typescript"),
            ProjectType::Django | ProjectType::Python => Some("python"),
            ProjectType::Go => Some("go"),
            ProjectType::Rust => Some("rust"),
            ProjectType::Unknown => None,
        }
    }

    pub fn framework(&self) -> Option<&'static str> {
        match self {
            ProjectType::Rails => Some("rails"),
            ProjectType::Nextjs => Some("nextjs"),
            ProjectType::React => Some("react"),
            ProjectType::Django => Some("django"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    Low,
    Medium,
    MediumHigh,
    High,
}

impl Confidence {
    pub fn multiplier(&self) -> f64 {
        match self {
            Confidence::Low => 0.8,
            Confidence::Medium => 1.0,
            Confidence::MediumHigh => 1.1,
            Confidence::High => 1.2,
        }
    }
}

/// Content patterns, grouped by the manifest they are searched in. A
/// category "hits" when any of its needles is found.
#[derive(Debug, Clone, Copy, Default)]
pub struct Patterns {
    pub gemfile_contains: &'static [&'static str],
    pub package_json_deps: &'static [&'static str],
    pub requirements_contains: &'static [&'static str],
}

impl Patterns {
    pub fn is_empty(&self) -> bool {
        self.gemfile_contains.is_empty()
            && self.package_json_deps.is_empty()
            && self.requirements_contains.is_empty()
    }

    pub fn category_count(&self) -> usize {
        usize::from(!self.gemfile_contains.is_empty())
            + usize::from(!self.package_json_deps.is_empty())
            + usize::from(!self.requirements_contains.is_empty())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Criterion {
    pub project_type: ProjectType,
    /// Marker files (globs allowed in the final component).
    pub files: &'static [&'static str],
    pub patterns: Patterns,
    pub confidence: Confidence,
}

pub const CRITERIA: &[Criterion] = &[
    Criterion {
        project_type: ProjectType::Rails,
        files: &["Gemfile", "config/application.rb"],
        patterns: Patterns {
            gemfile_contains: &["rails"],
            ..EMPTY
        },
        confidence: Confidence::High,
    },
    Criterion {
        project_type: ProjectType::Ruby,
        files: &["Gemfile"],
        patterns: EMPTY,
        confidence: Confidence::Medium,
    },
    // MediumHigh rather than High: the all-or-nothing High rule would
    // forfeit the pattern bonus and lose the react tie.
    Criterion {
        project_type: ProjectType::Nextjs,
        files: &["package.json", "next.config.*"],
        patterns: Patterns {
            package_json_deps: &["next"],
            ..EMPTY
        },
        confidence: Confidence::MediumHigh,
    },
    Criterion {
        project_type: ProjectType::React,
        files: &["package.json"],
        patterns: Patterns {
            package_json_deps: &["react"],
            ..EMPTY
        },
        confidence: Confidence::MediumHigh,
    },
    // `server.js` is rarely present, so this criterion leans on the
    // indicator bonus; a bare `package.json` stays JavaScript territory.
    Criterion {
        project_type: ProjectType::Nodejs,
        files: &["package.json", "server.js"],
        patterns: EMPTY,
        confidence: Confidence::Medium,
    },
    Criterion {
        project_type: ProjectType::Javascript,
        files: &["package.json"],
        patterns: EMPTY,
        confidence: Confidence::Low,
    },
    Criterion {
        project_type: ProjectType::Typescript,
        files: &["package.json", "tsconfig.json"],
        patterns: Patterns {
            package_json_deps: &["typescript"],
            ..EMPTY
        },
        confidence: Confidence::MediumHigh,
    },
    Criterion {
        project_type: ProjectType::Django,
        files: &["manage.py", "requirements.txt"],
        patterns: Patterns {
            requirements_contains: &["django"],
            ..EMPTY
        },
        confidence: Confidence::High,
    },
    Criterion {
        project_type: ProjectType::Python,
        files: &["requirements.txt"],
        patterns: EMPTY,
        confidence: Confidence::Medium,
    },
    Criterion {
        project_type: ProjectType::Go,
        files: &["go.mod"],
        patterns: EMPTY,
        confidence: Confidence::High,
    },
    Criterion {
        project_type: ProjectType::Rust,
        files: &["Cargo.toml"],
        patterns: EMPTY,
        confidence: Confidence::High,
    },
];

const EMPTY: Patterns = Patterns {
    gemfile_contains: &[],
    package_json_deps: &[],
    requirements_contains: &[],
};

/// Dependency or script names that mark a `package.json` as a Node.js
/// service rather than plain JavaScript.
pub const NODE_DEPENDENCY_INDICATORS: &[&str] = &[
    "express",
    "fastify",
    "koa",
    "nodemon",
    "pm2",
    "@types/node",
    "typescript",
    "ts-node",
    "eslint",
    "jest",
    "mocha",
    "webpack",
];

pub const NODE_SCRIPT_INDICATORS: &[&str] = &["start", "dev", "server", "build", "test"];
