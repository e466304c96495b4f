//! Static allow-list gating every child process the executor spawns.
//!
//! The list assumes direct `execvp`-style spawning: no shell is involved, so
//! there are no metacharacters to interpret and the only decision is whether
//! argv[0] names a permitted tool and the argument vector is well-formed.

use crate::error::Result;
use crate::error::SxnErr;

/// Executables a setup command may invoke. `bin/rails` is the conventional
/// binstub path inside a Rails checkout.
const ALLOWED_PROGRAMS: &[&str] = &[
    "bundle",
    "bin/rails",
    "npm",
    "yarn",
    "pnpm",
    "pip",
    "pipenv",
    "poetry",
    "cargo",
    "go",
    "python",
    "python3",
    "node",
    "make",
    "rake",
    "echo",
];

pub fn is_allowed(command: &[String]) -> bool {
    let Some(program) = command.first() else {
        return false;
    };
    if !ALLOWED_PROGRAMS.contains(&program.as_str()) {
        return false;
    }
    // Arguments must be non-empty and free of embedded NUL; anything else
    // cannot be passed through execvp faithfully.
    command.iter().all(|arg| !arg.is_empty() && !arg.contains('\0'))
}

pub fn assert_allowed(command: &[String]) -> Result<()> {
    if is_allowed(command) {
        Ok(())
    } else {
        let program = command.first().cloned().unwrap_or_else(|| "<empty>".to_string());
        Err(SxnErr::CommandNotAllowed { program })
    }
}
