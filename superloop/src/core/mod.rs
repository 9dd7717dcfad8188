//! Deterministic, pure logic shared by the superloop core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values (output text, signatures, persisted state snapshots) and return
//! deterministic results suitable for tests.

pub mod checklist;
pub mod completion;
pub mod promise;
pub mod rate_limit;
pub mod recovery_policy;
pub mod session_program;
pub mod signature;
pub mod stuck;
pub mod types;
