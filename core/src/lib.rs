//! Root of the `sxn-core` library.
//!
//! The core is a transactional executor of per-session setup rules: file
//! copies, sandboxed shell commands, and rendered templates, all confined to
//! a declared project root (reads) and session root (writes). Callers hand
//! the [`engine::RulesEngine`] an already-parsed rules configuration plus the
//! two roots; everything else in this crate exists to serve that call.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the tracing stack.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod allowed_command;
pub mod cipher;
pub mod copier;
pub mod engine;
pub mod error;
pub mod exec;
pub mod rules;
pub mod sandbox;
mod schedule;
pub mod template;

pub use cipher::AesGcmCipher;
pub use cipher::Cipher;
pub use engine::EngineOptions;
pub use engine::ExecutionResult;
pub use engine::RulesEngine;
pub use error::Result;
pub use error::SxnErr;
pub use rules::RuleContext;
pub use sandbox::SandboxRoot;
