//! Project detection for session setup.
//!
//! Given a project directory, [`detect`] classifies it into a project type
//! with a confidence-weighted scoring pass over well-known marker files and
//! manifest contents, then fills in the auxiliary profile fields (package
//! manager, docker/tests/CI markers, database hints, sensitive files).
//! [`suggest_default_rules`] turns a profile into a ready-to-run rules
//! configuration for the engine.

#![deny(clippy::print_stdout, clippy::print_stderr)]

mod criteria;
mod defaults;
mod detector;

pub use criteria::Confidence;
pub use criteria::ProjectType;
pub use defaults::suggest_default_rules;
pub use detector::PackageManager;
pub use detector::ProjectProfile;
pub use detector::detect;
