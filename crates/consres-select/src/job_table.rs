//! Job table: insertion-ordered records of accepted jobs.

use std::collections::BTreeSet;

use tracing::error;

use consres_core::{JobId, NodeBitmap, NodeState};

use crate::node_table::PartitionId;
use crate::queue::{JobDirectory, QueueState};

/// Which halves of a job's allocation are currently applied to the node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppliedFlags {
    pub cpus: bool,
    pub memory: bool,
}

/// An accepted job and everything it holds on each of its nodes.
///
/// The per-host vectors are indexed by the job's hosts in ascending
/// node-table order, i.e. the order `node_bitmap.iter()` yields them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResources {
    pub job_id: JobId,
    pub nprocs: u32,
    pub nhosts: u32,
    pub node_req: NodeState,
    pub partition: PartitionId,
    pub node_bitmap: NodeBitmap,
    /// CPUs each node offered at selection time.
    pub cpus: Vec<u16>,
    pub alloc_cpus: Vec<u16>,
    /// Flat row offset into the partition's row matrix.
    pub node_offset: Vec<u16>,
    pub alloc_memory: Vec<u32>,
    /// Cores per socket, only at core and socket granularity.
    pub alloc_cores: Option<Vec<Vec<u16>>>,
    pub applied: AppliedFlags,
    pub steps: BTreeSet<u32>,
}

impl JobResources {
    /// Host position of node `i` within this job, if it holds it.
    pub fn host_of(&self, i: usize) -> Option<usize> {
        if !self.node_bitmap.test(i) {
            return None;
        }
        self.node_bitmap.iter().position(|n| n == i)
    }

    /// Move this job's row offset on node `i` from a stride of `old` sockets
    /// to `new`. Offsets that were already off a row boundary stay ghosted.
    pub fn restride(&mut self, i: usize, old: u16, new: u16) {
        if old == 0 || old == new {
            return;
        }
        let Some(offset) = self.host_of(i).and_then(|h| self.node_offset.get_mut(h)) else {
            return;
        };
        if *offset % old == 0 {
            let row = u32::from(*offset / old);
            *offset = u16::try_from(row * u32::from(new)).unwrap_or(u16::MAX);
        }
    }

    /// Whether the per-host vectors agree with the membership bitmap.
    pub fn is_consistent(&self) -> bool {
        let n = self.nhosts as usize;
        self.node_bitmap.count() == n
            && self.cpus.len() == n
            && self.alloc_cpus.len() == n
            && self.node_offset.len() == n
            && self.alloc_memory.len() == n
            && self.alloc_cores.as_ref().is_none_or(|c| c.len() == n)
    }
}

/// Allocation of one job in the form the state blob stores it: no bitmap,
/// no partition, no lifecycle flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedAllocation {
    pub job_id: JobId,
    pub nprocs: u32,
    pub nhosts: u32,
    pub node_req: NodeState,
    pub cpus: Vec<u16>,
    pub alloc_cpus: Vec<u16>,
    pub node_offset: Vec<u16>,
    pub alloc_cores: Option<Vec<Vec<u16>>>,
    pub alloc_memory: Vec<u32>,
}

impl From<&JobResources> for SavedAllocation {
    fn from(job: &JobResources) -> Self {
        Self {
            job_id: job.job_id,
            nprocs: job.nprocs,
            nhosts: job.nhosts,
            node_req: job.node_req,
            cpus: job.cpus.clone(),
            alloc_cpus: job.alloc_cpus.clone(),
            node_offset: job.node_offset.clone(),
            alloc_cores: job.alloc_cores.clone(),
            alloc_memory: job.alloc_memory.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobTable {
    jobs: Vec<JobResources>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `job` at the tail. An entry with the same id is taken out first
    /// and handed back so the caller can refund it.
    pub fn append(&mut self, job: JobResources) -> Option<JobResources> {
        let old = self.remove(job.job_id);
        self.jobs.push(job);
        old
    }

    pub fn find(&self, job_id: JobId) -> Option<&JobResources> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    pub fn find_mut(&mut self, job_id: JobId) -> Option<&mut JobResources> {
        self.jobs.iter_mut().find(|j| j.job_id == job_id)
    }

    pub fn remove(&mut self, job_id: JobId) -> Option<JobResources> {
        let pos = self.jobs.iter().position(|j| j.job_id == job_id)?;
        Some(self.jobs.remove(pos))
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobResources> {
        self.jobs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut JobResources> {
        self.jobs.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drop every entry the directory no longer knows as live and return
    /// them, in table order.
    pub fn sweep(&mut self, directory: &dyn JobDirectory) -> Vec<JobResources> {
        let (keep, gone): (Vec<_>, Vec<_>) = std::mem::take(&mut self.jobs)
            .into_iter()
            .partition(|j| directory.lookup(j.job_id).is_some_and(|q| q.state.is_live()));
        self.jobs = keep;
        for job in &gone {
            let state = directory.lookup(job.job_id).map(|q| q.state);
            if state != Some(QueueState::Completed) {
                error!(job_id = job.job_id, ?state, "dangling job record swept");
            }
        }
        gone
    }
}
