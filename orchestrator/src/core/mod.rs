//! Deterministic, pure logic shared by the control loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! documents and return deterministic outputs suitable for tests.

pub mod activity;
pub mod batch;
pub mod decision;
pub mod heuristic;
pub mod settle;
pub mod staleness;
pub mod tasks;
pub mod validation;
