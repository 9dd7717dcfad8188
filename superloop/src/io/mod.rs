//! Side-effecting helpers: filesystem state, processes, gates and ledgers.

pub mod approval;
pub mod atomic;
pub mod checklist;
pub mod config;
pub mod events;
pub mod evidence;
pub mod executor;
pub mod git;
pub mod init;
pub mod paths;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod recovery;
pub mod report;
pub mod run_state;
pub mod run_summary;
pub mod schema;
pub mod test_gate;
pub mod validation;
