//! Supervisor for a multi-step agent workflow.
//!
//! An orchestration walks a feature through design, analyze, implement,
//! verify and merge. Each step is carried out by an external worker session;
//! this crate decides what should happen next, launches and watches those
//! sessions, and recovers when the record of the run is damaged or a worker
//! stalls. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (decisions, the batch state
//!   machine, validation, staleness). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (documents, worker processes, the
//!   diagnostic oracle, file watching). Isolated to enable fakes in tests.
//!
//! [`supervisor`] runs the loop, [`execute`] applies each decision,
//! [`spawner`] makes launches exclusive and [`recovery`] is the only path to
//! the oracle.

pub mod clock;
pub mod core;
pub mod execute;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod recovery;
pub mod spawner;
pub mod state;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod wakeup;
