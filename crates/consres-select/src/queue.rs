//! Job directory: the id-to-record side table the selector consults for
//! partition names, queue states, end times and node lists.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use consres_core::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Pending,
    Running,
    Suspended,
    Completed,
}

impl QueueState {
    /// Running or suspended: the job still owns its allocation.
    pub fn is_live(self) -> bool {
        matches!(self, QueueState::Running | QueueState::Suspended)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub partition: String,
    pub state: QueueState,
    /// Expected end, seconds since the epoch.
    pub end_time: u64,
    /// Allocated node names in node-table order.
    pub nodes: Vec<String>,
}

impl QueuedJob {
    pub fn running(job_id: JobId, partition: &str, end_time: u64, nodes: Vec<String>) -> Self {
        Self {
            job_id,
            partition: partition.to_string(),
            state: QueueState::Running,
            end_time,
            nodes,
        }
    }
}

/// Lookup from job id to the queue's record of it.
pub trait JobDirectory {
    fn lookup(&self, job_id: JobId) -> Option<&QueuedJob>;
}

/// In-memory job directory.
#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    jobs: HashMap<JobId, QueuedJob>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: QueuedJob) {
        self.jobs.insert(job.job_id, job);
    }

    pub fn get_mut(&mut self, job_id: JobId) -> Option<&mut QueuedJob> {
        self.jobs.get_mut(&job_id)
    }

    pub fn set_state(&mut self, job_id: JobId, state: QueueState) -> bool {
        match self.jobs.get_mut(&job_id) {
            Some(job) => {
                job.state = state;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, job_id: JobId) -> Option<QueuedJob> {
        self.jobs.remove(&job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl JobDirectory for JobQueue {
    fn lookup(&self, job_id: JobId) -> Option<&QueuedJob> {
        self.jobs.get(&job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_states() {
        assert!(QueueState::Running.is_live());
        assert!(QueueState::Suspended.is_live());
        assert!(!QueueState::Pending.is_live());
        assert!(!QueueState::Completed.is_live());
    }

    #[test]
    fn set_state_reports_unknown_ids() {
        let mut queue = JobQueue::new();
        queue.insert(QueuedJob::running(4, "batch", 10, vec![]));
        assert!(queue.set_state(4, QueueState::Suspended));
        assert!(!queue.set_state(5, QueueState::Suspended));
        assert_eq!(queue.lookup(4).unwrap().state, QueueState::Suspended);
    }
}
