//! reposweep - bulk git working tree synchronization
//!
//! reposweep finds every git repository below a directory and brings each one
//! in sync with its remote, in parallel, escalating failed repositories through
//! progressively more forceful recovery.
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`scanner`]: Concurrent discovery of repository roots
//! - [`sync`]: Parallel synchronization with tiered recovery
//! - [`git`]: Invocation of the `git` executable
//! - [`shutdown`]: Interrupt handling and cancellation
//! - [`manifest`]: Export and import of repository remote URLs

pub mod config;
pub mod error;
pub mod git;
pub mod manifest;
pub mod scanner;
pub mod shutdown;
pub mod sync;

pub use config::Config;
pub use error::SyncError;
pub use git::{GitClient, GitOp, GitOutput, GitRunner};
pub use manifest::Manifest;
pub use scanner::{resolve_root, ScanReport, Scanner};
pub use shutdown::{Shutdown, ShutdownListener};
pub use sync::{FailureRecord, SyncEngine, SyncOutcome, SyncSummary, Tier};
