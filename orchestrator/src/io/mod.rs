//! Side-effecting operations: documents on disk, worker processes, the
//! oracle and the file watcher. Kept apart from `core` so the loop can be
//! exercised against fakes.

pub mod activity;
pub mod config;
pub mod fs_util;
pub mod init;
pub mod oracle;
pub mod process;
pub mod prompt;
pub mod runner_record;
pub mod schema;
pub mod state_store;
pub mod watch;
pub mod workflow;
