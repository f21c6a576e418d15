//! Select engine. Owns the node and job tables and exposes the placement,
//! event and query API.
//!
//! - `place` runs one of three modes: commit now, test only, or predict
//!   a start time by simulating completions on a copy of the node table.
//! - Job events move a job's resources in and out of the node table
//!   according to its lifecycle flags, so every event is idempotent.
//! - Every mutation bumps a change generation that the state store uses
//!   to decide whether a checkpoint is due.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info};

use consres_core::{
    ClusterConfig, JobId, JobRequest, MemoryRequest, NodeBitmap, NodeHardware, NodeIndex,
    NodeLimits, NodeState, SharedPolicy,
};

use crate::classify::{memory_demand, state_allows};
use crate::dist::build_job;
use crate::error::{SelectError, SelectResult};
use crate::job_table::{JobResources, JobTable, SavedAllocation};
use crate::node_table::{NodeTable, Partition};
use crate::queue::{JobDirectory, QueueState};
use crate::select::{JobContext, job_test, node_row_state};

/// Engine handle shared between the controller loop and event sources.
pub type SharedEngine = Arc<Mutex<SelectEngine>>;

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceMode {
    RunNow,
    TestOnly,
    WillRun,
}

/// Status codes reported to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceStatus {
    Ok,
    InfeasibleNow,
    InfeasibleEver,
    InfeasibleRequired,
    InternalError,
}

impl fmt::Display for PlaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlaceStatus::Ok => "OK",
            PlaceStatus::InfeasibleNow => "INFEASIBLE_NOW",
            PlaceStatus::InfeasibleEver => "INFEASIBLE_EVER",
            PlaceStatus::InfeasibleRequired => "INFEASIBLE_REQUIRED",
            PlaceStatus::InternalError => "INTERNAL_ERROR",
        })
    }
}

/// One placement request.
#[derive(Debug, Clone)]
pub struct PlaceRequest<'a> {
    pub job: &'a JobRequest,
    pub candidates: NodeBitmap,
    pub limits: NodeLimits,
    pub mode: PlaceMode,
}

/// Successful placement outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Committed to the node and job tables.
    Allocated { nodes: NodeBitmap },
    /// The job fits an idle cluster.
    Feasible,
    StartsNow { nodes: NodeBitmap },
    StartsAt { start_time: u64, nodes: NodeBitmap },
}

impl Placement {
    pub fn nodes(&self) -> Option<&NodeBitmap> {
        match self {
            Placement::Allocated { nodes }
            | Placement::StartsNow { nodes }
            | Placement::StartsAt { nodes, .. } => Some(nodes),
            Placement::Feasible => None,
        }
    }
}

/// A job step as reported by the step launcher.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub job_id: JobId,
    pub step_id: u32,
    pub nodes: NodeBitmap,
}

/// Node-request class of a job in `partition`.
pub fn node_request_class(partition: &Partition, shared: Option<bool>) -> NodeState {
    match partition.policy {
        SharedPolicy::Exclusive => NodeState::Reserved,
        SharedPolicy::Force => {
            if partition.is_single_row() {
                NodeState::OneRow
            } else {
                NodeState::Available
            }
        }
        _ if shared == Some(false) => NodeState::Reserved,
        _ if partition.is_single_row() => NodeState::OneRow,
        _ => NodeState::Available,
    }
}

#[derive(Debug, Clone)]
pub struct SelectEngine {
    config: ClusterConfig,
    nodes: NodeTable,
    jobs: JobTable,
    generation: u64,
    last_change: u64,
    completions: u32,
}

impl SelectEngine {
    pub fn new(config: ClusterConfig) -> SelectResult<Self> {
        let nodes = NodeTable::initialise(&config)?;
        Ok(Self {
            config,
            nodes,
            jobs: JobTable::new(),
            generation: 0,
            last_change: epoch_secs(),
            completions: 0,
        })
    }

    pub fn shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn node_table(&self) -> &NodeTable {
        &self.nodes
    }

    /// Monotonic change counter; bumped by every table mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wall-clock time of the last mutation.
    pub fn last_change(&self) -> u64 {
        self.last_change
    }

    fn touch(&mut self) {
        self.generation += 1;
        self.last_change = epoch_secs();
    }

    /// Resolve the demand side of a job against the current tables.
    pub fn resolve(&self, job: &JobRequest) -> SelectResult<JobContext> {
        let partition = self
            .nodes
            .partition_id(&job.partition)
            .ok_or_else(|| SelectError::UnknownPartition(job.partition.clone()))?;
        let class = node_request_class(self.nodes.partition(partition), job.shared);
        let required = self.nodes.bitmap_of(&job.required_nodes)?;
        Ok(JobContext {
            job_id: job.job_id,
            partition,
            class,
            num_procs: job.num_procs,
            contiguous: job.contiguous,
            memory: job.memory,
            multicore: job.multicore,
            dist: job.dist,
            task_layout: job.task_layout.clone(),
            required,
        })
    }

    /// Partition members minus excluded nodes.
    pub fn candidates(&self, job: &JobRequest) -> SelectResult<NodeBitmap> {
        let partition = self
            .nodes
            .partition_id(&job.partition)
            .ok_or_else(|| SelectError::UnknownPartition(job.partition.clone()))?;
        let mut map = self.nodes.partition(partition).nodes.clone();
        map.and_not(&self.nodes.bitmap_of(&job.excluded_nodes)?);
        Ok(map)
    }

    pub fn place(&mut self, req: &PlaceRequest<'_>, directory: &dyn JobDirectory) -> SelectResult<Placement> {
        self.place_at(req, directory, epoch_secs())
    }

    /// `place` with an explicit clock for start-time prediction.
    pub fn place_at(
        &mut self,
        req: &PlaceRequest<'_>,
        directory: &dyn JobDirectory,
        now: u64,
    ) -> SelectResult<Placement> {
        let ctx = self.resolve(req.job)?;
        let mut candidates = req.candidates.clone();
        candidates.and(&self.nodes.partition(ctx.partition).nodes);
        if let Some(missing) = ctx.required.iter().find(|i| !candidates.test(*i)) {
            debug!(job_id = ctx.job_id, node = missing, "required node is not a candidate");
            return Err(SelectError::InfeasibleRequired { node: missing });
        }
        if (candidates.count() as u32) < req.limits.min {
            debug!(job_id = ctx.job_id, min = req.limits.min, "fewer candidates than min_nodes");
            return Err(SelectError::InfeasibleEver);
        }

        match req.mode {
            PlaceMode::RunNow => self.run_now(&ctx, &candidates, req.limits),
            PlaceMode::TestOnly => self.test_only(ctx, &candidates, req.limits),
            PlaceMode::WillRun => self.will_run(&ctx, &candidates, req.limits, directory, now),
        }
    }

    fn run_now(&mut self, ctx: &JobContext, candidates: &NodeBitmap, limits: NodeLimits) -> SelectResult<Placement> {
        let selection = job_test(&self.nodes, ctx, candidates, limits, true)?;
        let mut job = build_job(&self.nodes, ctx, &selection)?;
        if let Some(mut old) = self.jobs.remove(job.job_id) {
            if let Err(e) = self.nodes.remove_job(&mut old, true) {
                error!(job_id = old.job_id, error = %e, "refund of replaced job failed");
            }
        }
        self.nodes.add_job(&mut job, false);
        let nodes = job.node_bitmap.clone();
        info!(
            job_id = job.job_id,
            nodes = %nodes,
            cpus = job.alloc_cpus.iter().map(|c| u32::from(*c)).sum::<u32>(),
            class = ?job.node_req,
            "job allocated"
        );
        self.jobs.append(job);
        self.touch();
        Ok(Placement::Allocated { nodes })
    }

    fn test_only(&self, mut ctx: JobContext, candidates: &NodeBitmap, limits: NodeLimits) -> SelectResult<Placement> {
        ctx.memory = MemoryRequest::None;
        let idle = self.nodes.idle_copy();
        let selection = job_test(&idle, &ctx, candidates, limits, false).map_err(|e| match e {
            SelectError::InfeasibleNow => SelectError::InfeasibleEver,
            other => other,
        })?;
        build_job(&idle, &ctx, &selection)?;
        Ok(Placement::Feasible)
    }

    fn will_run(
        &self,
        ctx: &JobContext,
        candidates: &NodeBitmap,
        limits: NodeLimits,
        directory: &dyn JobDirectory,
        now: u64,
    ) -> SelectResult<Placement> {
        match job_test(&self.nodes, ctx, candidates, limits, true) {
            Ok(selection) => return Ok(Placement::StartsNow { nodes: selection.nodes }),
            Err(SelectError::InfeasibleNow | SelectError::InfeasibleRequired { .. }) => {}
            Err(e) => return Err(e),
        }

        let mut ending: Vec<(u64, JobId)> = self
            .jobs
            .iter()
            .filter_map(|j| directory.lookup(j.job_id).map(|q| (q.end_time, j.job_id)))
            .collect();
        ending.sort_unstable();

        let mut sim = self.nodes.clone();
        for (end_time, job_id) in ending {
            let Some(job) = self.jobs.find(job_id) else {
                continue;
            };
            let mut job = job.clone();
            if let Err(e) = sim.remove_job(&mut job, true) {
                debug!(job_id, error = %e, "simulated removal underflowed");
            }
            if let Ok(selection) = job_test(&sim, ctx, candidates, limits, true) {
                let start_time = if end_time <= now { now + 1 } else { end_time };
                debug!(job_id = ctx.job_id, after = job_id, start_time, "start time predicted");
                return Ok(Placement::StartsAt {
                    start_time,
                    nodes: selection.nodes,
                });
            }
        }
        Err(SelectError::InfeasibleEver)
    }

    // ── Events ─────────────────────────────────────────────────────

    pub fn job_begin(&mut self, job_id: JobId) -> SelectResult<()> {
        let job = self
            .jobs
            .find_mut(job_id)
            .ok_or(SelectError::JobNotFound(job_id))?;
        self.nodes.add_job(job, false);
        self.touch();
        Ok(())
    }

    /// Release everything the job holds and forget it. Triggers a sweep
    /// every `sweep_interval` completions.
    pub fn job_end(&mut self, job_id: JobId, directory: &dyn JobDirectory) -> SelectResult<()> {
        let mut job = self.jobs.remove(job_id).ok_or(SelectError::JobNotFound(job_id))?;
        let result = self.nodes.remove_job(&mut job, true);
        self.touch();
        info!(job_id, "job ended");

        self.completions += 1;
        if self.completions >= self.config.sweep_interval() {
            self.completions = 0;
            self.sweep(directory);
        }
        result
    }

    pub fn job_suspend(&mut self, job_id: JobId) -> SelectResult<()> {
        let job = self
            .jobs
            .find_mut(job_id)
            .ok_or(SelectError::JobNotFound(job_id))?;
        let result = self.nodes.remove_job(job, false);
        self.touch();
        debug!(job_id, "job suspended");
        result
    }

    pub fn job_resume(&mut self, job_id: JobId) -> SelectResult<()> {
        let job = self
            .jobs
            .find_mut(job_id)
            .ok_or(SelectError::JobNotFound(job_id))?;
        self.nodes.add_job(job, false);
        self.touch();
        debug!(job_id, "job resumed");
        Ok(())
    }

    pub fn step_begin(&mut self, step: &StepRecord) -> SelectResult<()> {
        let job = self
            .jobs
            .find_mut(step.job_id)
            .ok_or(SelectError::JobNotFound(step.job_id))?;
        if step.nodes.len() != job.node_bitmap.len() || !step.nodes.is_subset_of(&job.node_bitmap) {
            return Err(SelectError::InvalidStep {
                job_id: step.job_id,
                step_id: step.step_id,
            });
        }
        job.steps.insert(step.step_id);
        Ok(())
    }

    pub fn step_end(&mut self, job_id: JobId, step_id: u32) -> SelectResult<()> {
        let job = self
            .jobs
            .find_mut(job_id)
            .ok_or(SelectError::JobNotFound(job_id))?;
        job.steps.remove(&step_id);
        Ok(())
    }

    /// Refund and drop job records the directory no longer knows as live.
    pub fn sweep(&mut self, directory: &dyn JobDirectory) -> usize {
        let gone = self.jobs.sweep(directory);
        for mut job in gone.iter().cloned() {
            if let Err(e) = self.nodes.remove_job(&mut job, true) {
                error!(job_id = job.job_id, error = %e, "refund during sweep failed");
            }
        }
        if !gone.is_empty() {
            self.touch();
            info!(removed = gone.len(), "job table swept");
        }
        gone.len()
    }

    /// Rebuild the node table from a new configuration and reapply every job
    /// that still maps onto it.
    pub fn reconfigure(&mut self, config: ClusterConfig) -> SelectResult<()> {
        let mut nodes = NodeTable::initialise(&config)?;
        let mut kept = JobTable::new();
        let mut dropped = 0usize;

        for old in self.jobs.iter() {
            match self.remap(old, &nodes) {
                Ok((partition, node_bitmap)) => {
                    let mut job = old.clone();
                    let suspend = !job.applied.cpus;
                    job.partition = partition;
                    job.node_bitmap = node_bitmap;
                    job.applied = Default::default();
                    nodes.add_job(&mut job, suspend);
                    kept.append(job);
                }
                Err(reason) => {
                    error!(job_id = old.job_id, reason = %reason, "job dropped at reconfigure");
                    dropped += 1;
                }
            }
        }

        info!(nodes = nodes.len(), jobs = kept.len(), dropped, "reconfigured");
        self.nodes = nodes;
        self.jobs = kept;
        self.config = config;
        self.touch();
        Ok(())
    }

    /// Partition and node bitmap of `job` in a rebuilt table. Host vectors
    /// are ordered by node index, so the nodes must keep their relative order.
    fn remap(&self, job: &JobResources, nodes: &NodeTable) -> Result<(usize, NodeBitmap), String> {
        let part_name = &self.nodes.partition(job.partition).name;
        let partition = nodes
            .partition_id(part_name)
            .ok_or_else(|| format!("partition {part_name} is gone"))?;
        let mut map = NodeBitmap::new(nodes.len());
        let mut last: Option<NodeIndex> = None;
        for i in job.node_bitmap.iter() {
            let name = self.nodes.node_name(i);
            let n = nodes
                .node_index(name)
                .ok_or_else(|| format!("node {name} is gone"))?;
            if last.is_some_and(|l| l >= n) {
                return Err(format!("node {name} changed position"));
            }
            last = Some(n);
            map.set(n);
        }
        Ok((partition, map))
    }

    /// Hardware reported by a node at check-in.
    pub fn update_node_config(&mut self, hw: NodeHardware) -> SelectResult<()> {
        let i = self
            .nodes
            .node_index(&hw.name)
            .ok_or_else(|| SelectError::UnknownNode(hw.name.clone()))?;
        let old = self.nodes.node(i).hw.sockets;
        self.nodes.update_node_config(i, hw)?;
        let new = self.nodes.node(i).hw.sockets;
        if old != new {
            for job in self.jobs.iter_mut() {
                job.restride(i, old, new);
            }
        }
        self.touch();
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────

    /// CPUs node `i` could give `job` right now.
    pub fn available_cpus(&self, i: NodeIndex, job: &JobRequest) -> SelectResult<u16> {
        let ctx = self.resolve(job)?;
        if !state_allows(&self.nodes, i, ctx.class) {
            return Ok(0);
        }
        let demand = memory_demand(ctx.memory, ctx.multicore.cpus_per_task());
        if self.nodes.granularity().tracks_memory() && self.nodes.node(i).free_memory() < demand {
            return Ok(0);
        }
        let state = node_row_state(&self.nodes, &ctx, i, true);
        if state.busy < 0 {
            return Ok(0);
        }
        Ok(state.share.max(state.all).min(u32::from(u16::MAX)) as u16)
    }

    pub fn allocated_cpus(&self, i: NodeIndex) -> u16 {
        self.nodes.allocated_cpus(i)
    }

    /// Nodes with no cores and no memory allocated.
    pub fn idle_node_bitmap(&self) -> NodeBitmap {
        NodeBitmap::from_indices(
            self.nodes.len(),
            (0..self.nodes.len()).filter(|i| {
                let node = self.nodes.node(*i);
                !node.has_allocated_cores() && node.alloc_memory == 0
            }),
        )
    }

    /// Nodes that can still offer something.
    pub fn partially_idle_bitmap(&self) -> NodeBitmap {
        NodeBitmap::from_indices(
            self.nodes.len(),
            (0..self.nodes.len()).filter(|i| self.nodes.free_count(*i) > 0),
        )
    }

    /// Cores job `job_id` holds on socket `socket` of node `i`.
    pub fn job_cores(&self, job_id: JobId, i: NodeIndex, socket: u16) -> Option<u16> {
        let job = self.jobs.find(job_id)?;
        let host = job.host_of(i)?;
        job.alloc_cores
            .as_ref()?
            .get(host)?
            .get(usize::from(socket))
            .copied()
    }

    pub fn node_state(&self, i: NodeIndex) -> NodeState {
        self.nodes.node(i).state
    }

    pub fn alloc_memory(&self, i: NodeIndex) -> u32 {
        self.nodes.node(i).alloc_memory
    }

    /// Raw row counter of node `i` in `partition`.
    pub fn alloc_cores(&self, i: NodeIndex, partition: &str, row: u16, socket: u16) -> Option<u16> {
        let pid = self.nodes.partition_id(partition)?;
        let rows = self.nodes.node(i).part(pid)?;
        if row >= rows.num_rows() || socket >= rows.stride() {
            return None;
        }
        Some(rows.cell(row, socket))
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobResources> {
        self.jobs.iter()
    }

    pub fn job(&self, job_id: JobId) -> Option<&JobResources> {
        self.jobs.find(job_id)
    }

    // ── Persistence hooks ──────────────────────────────────────────

    pub fn saved_allocations(&self) -> Vec<SavedAllocation> {
        self.jobs.iter().map(SavedAllocation::from).collect()
    }

    /// Reapply saved allocations to the (fresh) node table. Records are
    /// resolved through the directory; orphans, finished jobs and records
    /// whose node list no longer matches are dropped.
    pub fn restore(&mut self, saved: Vec<SavedAllocation>, directory: &dyn JobDirectory) -> usize {
        let mut restored = 0;
        for rec in saved {
            let Some(queued) = directory.lookup(rec.job_id) else {
                error!(job_id = rec.job_id, "saved job unknown to the queue, dropped");
                continue;
            };
            if !queued.state.is_live() {
                debug!(job_id = rec.job_id, state = ?queued.state, "saved job no longer running");
                continue;
            }
            let Some(partition) = self.nodes.partition_id(&queued.partition) else {
                error!(job_id = rec.job_id, partition = %queued.partition, "saved job partition unknown");
                continue;
            };
            let node_bitmap = match self.nodes.bitmap_of(&queued.nodes) {
                Ok(map) => map,
                Err(e) => {
                    error!(job_id = rec.job_id, error = %e, "saved job node list unresolvable");
                    continue;
                }
            };
            let mut job = JobResources {
                job_id: rec.job_id,
                nprocs: rec.nprocs,
                nhosts: rec.nhosts,
                node_req: rec.node_req,
                partition,
                node_bitmap,
                cpus: rec.cpus,
                alloc_cpus: rec.alloc_cpus,
                node_offset: rec.node_offset,
                alloc_memory: rec.alloc_memory,
                alloc_cores: rec.alloc_cores,
                applied: Default::default(),
                steps: Default::default(),
            };
            if !job.is_consistent() {
                error!(job_id = job.job_id, "saved job host count mismatch, dropped");
                continue;
            }
            let suspend = queued.state == QueueState::Suspended;
            self.nodes.add_job(&mut job, suspend);
            if let Some(mut old) = self.jobs.append(job) {
                if let Err(e) = self.nodes.remove_job(&mut old, true) {
                    error!(job_id = old.job_id, error = %e, "refund of duplicate saved job failed");
                }
            }
            restored += 1;
        }
        if restored > 0 {
            self.touch();
        }
        info!(restored, "job table restored");
        restored
    }
}
