//! Durable session catalog on embedded SQLite.
//!
//! The store is the system's only cross-run state: a catalog of named
//! sessions with status, tags, worktrees, and free-form metadata, kept in a
//! single database file under `~/.sxn`. The rules engine itself never opens
//! the store; callers consult it to find session roots and record outcomes.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod error;
pub mod session;
mod store;

pub use error::Result;
pub use error::StoreErr;
pub use session::MaintenanceOptions;
pub use session::MaintenanceReport;
pub use session::NewSession;
pub use session::Session;
pub use session::SessionFilters;
pub use session::SessionSort;
pub use session::SessionStats;
pub use session::SessionStatus;
pub use session::SessionUpdate;
pub use session::WorktreeInfo;
pub use store::SessionStore;
