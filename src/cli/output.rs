//! CLI output: error mapping from domain errors to stable CLI surface.

use crate::error::ApiError;

/// Map domain errors to a single line for stderr.
///
/// Stage failures carry their machine code so scripts can match on it.
pub fn map_error(e: &ApiError) -> String {
    match e {
        ApiError::StageFailed { stage, source } => {
            format!("error[{}]: stage {} failed: {}", source.code, stage, source.message)
        }
        ApiError::RecoveryInProgress => {
            "error: a recovery run is already in progress; try again shortly".to_string()
        }
        other => format!("error: {}", other),
    }
}
