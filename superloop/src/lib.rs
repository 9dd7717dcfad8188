//! Iteration orchestration engine for autonomous coding agents.
//!
//! A loop runs an ordered list of roles (planner, implementer, tester,
//! reviewer, ...) against a repository, then decides from a completion
//! promise and a set of gates whether the loop is done. Everything the
//! engine decides is persisted under `.superloop/`, so any run can be killed
//! and resumed from the recorded `(loop, iteration)`.
//!
//! - **[`core`]**: Pure, deterministic logic (promise parsing, completion rule,
//!   signatures, recovery policy, session programs). No I/O.
//! - **[`io`]**: Side-effecting operations (filesystem, git, process
//!   supervision, gate status files, ledgers).
//!
//! Orchestration modules ([`looping`], [`iteration`], [`gates`], [`recovery`],
//! [`session`], [`snapshot`], [`status`]) coordinate core logic with I/O to
//! implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod gates;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod looping;
pub mod recovery;
pub mod session;
pub mod snapshot;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
