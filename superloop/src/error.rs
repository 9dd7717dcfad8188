//! Typed failures the CLI maps to distinct exit codes.
//!
//! Everything else travels as `anyhow::Error` with context chains.

use thiserror::Error;

use crate::exit_codes;

#[derive(Debug, Error)]
pub enum SuperloopError {
    #[error("invalid config: {0}")]
    Config(String),
    #[error("role '{role}' failed with exit code {code}")]
    RoleProcessFailure { role: String, code: i32 },
    #[error("gate '{gate}' could not be evaluated: {message}")]
    GateEvaluation { gate: String, message: String },
}

impl SuperloopError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SuperloopError::RoleProcessFailure { .. } => exit_codes::ROLE_FAILED,
            SuperloopError::Config(_) | SuperloopError::GateEvaluation { .. } => {
                exit_codes::INVALID
            }
        }
    }
}

/// Exit code for an error chain; typed failures win, everything else is `INVALID`.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SuperloopError>())
        .map(SuperloopError::exit_code)
        .unwrap_or(exit_codes::INVALID)
}
