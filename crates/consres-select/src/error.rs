//! Selector error types.

use thiserror::Error;

use consres_core::{ConfigError, JobId, NodeIndex};

use crate::engine::PlaceStatus;

/// Errors that can occur during selection and bookkeeping.
#[derive(Debug, Error)]
pub enum SelectError {
    #[error("not enough free resources right now")]
    InfeasibleNow,

    #[error("request can never be satisfied by this cluster")]
    InfeasibleEver,

    #[error("required node {node} is unusable")]
    InfeasibleRequired { node: NodeIndex },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("unknown partition: {0}")]
    UnknownPartition(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("counter underflow while removing job {0}")]
    Underflow(JobId),

    #[error("node {0}: hardware changes are rejected while fast_schedule is set")]
    FastSchedule(String),

    #[error("node {0}: hardware cannot shrink while jobs occupy it")]
    ShrinkWithOccupants(String),

    #[error("job {job_id}: invalid task layout: {reason}")]
    InvalidLayout { job_id: JobId, reason: String },

    #[error("step {step_id} of job {job_id} uses nodes outside the job allocation")]
    InvalidStep { job_id: JobId, step_id: u32 },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl SelectError {
    /// Placement status reported to the scheduler for this error.
    pub fn status(&self) -> PlaceStatus {
        match self {
            SelectError::InfeasibleNow => PlaceStatus::InfeasibleNow,
            SelectError::InfeasibleEver
            | SelectError::UnknownPartition(_)
            | SelectError::UnknownNode(_)
            | SelectError::InvalidLayout { .. } => PlaceStatus::InfeasibleEver,
            SelectError::InfeasibleRequired { .. } => PlaceStatus::InfeasibleRequired,
            _ => PlaceStatus::InternalError,
        }
    }

    pub fn is_infeasible(&self) -> bool {
        matches!(
            self,
            SelectError::InfeasibleNow
                | SelectError::InfeasibleEver
                | SelectError::InfeasibleRequired { .. }
        )
    }
}

pub type SelectResult<T> = Result<T, SelectError>;
