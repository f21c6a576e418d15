//! Row search. Decides which row of which node a job may use, then hands
//! the admitted nodes to the consecutive selector.
//!
//! For every candidate node the search knows three numbers: how many rows
//! are busy, how many CPUs the least-loaded busy row still has, and how many
//! the first empty row has. Nodes sharing the same triple are run-length
//! compressed. The search then walks `row = 1..=num_rows` and three tries
//! per row, from "pack into existing rows" to "open a fresh row anywhere".

use tracing::debug;

use consres_core::{
    JobId, MemoryRequest, MultiCoreSpec, NodeBitmap, NodeIndex, NodeLimits, NodeState, TaskDist,
};

use crate::avail::{available_cpus, cap_by_memory};
use crate::classify::{memory_demand, verify_node_state};
use crate::consec::{ConsecParams, select_nodes};
use crate::error::{SelectError, SelectResult};
use crate::node_table::{NodeTable, PartitionId, pick_rows};

/// A job request resolved against the node table.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub partition: PartitionId,
    pub class: NodeState,
    pub num_procs: u32,
    pub contiguous: bool,
    pub memory: MemoryRequest,
    pub multicore: MultiCoreSpec,
    pub dist: TaskDist,
    pub task_layout: Option<Vec<u16>>,
    pub required: NodeBitmap,
}

/// Per-node row occupancy summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowState {
    /// Busy rows, or -1 for a node that is not a candidate.
    pub busy: i32,
    pub share: u32,
    pub all: u32,
}

impl RowState {
    pub const EXCLUDED: RowState = RowState {
        busy: -1,
        share: 0,
        all: 0,
    };
}

/// Run-length compressed row states, in node-table order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowRuns {
    pub busy_rows: Vec<i32>,
    pub share_tasks: Vec<u32>,
    pub all_tasks: Vec<u32>,
    pub freq: Vec<u32>,
}

impl RowRuns {
    pub fn push(&mut self, state: RowState) {
        if let Some(last) = self.busy_rows.len().checked_sub(1) {
            if self.busy_rows[last] == state.busy
                && self.share_tasks[last] == state.share
                && self.all_tasks[last] == state.all
            {
                self.freq[last] += 1;
                return;
            }
        }
        self.busy_rows.push(state.busy);
        self.share_tasks.push(state.share);
        self.all_tasks.push(state.all);
        self.freq.push(1);
    }

    /// Node count covered.
    pub fn len(&self) -> usize {
        self.freq.iter().map(|f| *f as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.freq.is_empty()
    }

    /// Expand back to one state per node.
    pub fn states(&self) -> impl Iterator<Item = RowState> + '_ {
        (0..self.freq.len()).flat_map(move |k| {
            let state = RowState {
                busy: self.busy_rows[k],
                share: self.share_tasks[k],
                all: self.all_tasks[k],
            };
            std::iter::repeat_n(state, self.freq[k] as usize)
        })
    }
}

/// Which row of a node a job goes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChoice {
    /// The least-loaded occupied row.
    Pack,
    /// The first empty row.
    Open,
}

/// Whether a node with `state` takes part in attempt `(row, attempt)`, and
/// with how many CPUs.
pub fn admission(state: RowState, row: u16, attempt: u8) -> Option<(u32, RowChoice)> {
    let busy = state.busy;
    if busy < 0 || busy > i32::from(row) {
        return None;
    }
    if attempt >= 2 && busy >= 1 && busy < i32::from(row) && state.all > 0 {
        return Some((state.all, RowChoice::Open));
    }
    if busy >= 1 && state.share > 0 {
        return Some((state.share, RowChoice::Pack));
    }
    if attempt >= 1 && busy == 0 && state.all > 0 {
        return Some((state.all, RowChoice::Open));
    }
    None
}

/// The nodes chosen for a job and where on each of them it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub nodes: NodeBitmap,
    /// CPUs each chosen node offered, by host.
    pub offered: Vec<u32>,
    /// Row index on each chosen node, by host.
    pub rows: Vec<u16>,
}

/// Row state of node `i` for this job, or `EXCLUDED` when the node is not
/// in the job's partition.
pub fn node_row_state(table: &NodeTable, ctx: &JobContext, i: NodeIndex, check_memory: bool) -> RowState {
    let node = table.node(i);
    let Some(rows) = node.part(ctx.partition) else {
        return RowState::EXCLUDED;
    };
    let unit = table.granularity().unit();
    let pick = pick_rows(rows, unit, node.hw.cores);
    let capacity = |row: Option<u16>| -> u32 {
        let Some(row) = row else {
            return 0;
        };
        let free = table.free_cores(i, ctx.partition, row);
        let mut avail = available_cpus(&node.hw, &free, unit, &ctx.multicore);
        if check_memory && table.granularity().tracks_memory() {
            avail = cap_by_memory(avail, node.free_memory(), ctx.memory, ctx.multicore.cpus_per_task());
        }
        u32::from(avail)
    };
    RowState {
        busy: i32::from(rows.busy_rows()),
        share: capacity(pick.least_loaded),
        all: capacity(pick.first_empty),
    }
}

/// Find nodes for the job within `candidates`.
///
/// `check_memory` off skips both the memory gate and the per-CPU memory cap.
pub fn job_test(
    table: &NodeTable,
    ctx: &JobContext,
    candidates: &NodeBitmap,
    limits: NodeLimits,
    check_memory: bool,
) -> SelectResult<Selection> {
    let mut cands = candidates.clone();
    let demand = if check_memory {
        memory_demand(ctx.memory, ctx.multicore.cpus_per_task())
    } else {
        0
    };
    verify_node_state(table, &mut cands, &ctx.required, ctx.class, demand)?;
    if (cands.count() as u32) < limits.min {
        debug!(job_id = ctx.job_id, candidates = cands.count(), min = limits.min, "too few usable nodes");
        return Err(SelectError::InfeasibleNow);
    }

    let mut runs = RowRuns::default();
    for i in 0..table.len() {
        if cands.test(i) {
            runs.push(node_row_state(table, ctx, i, check_memory));
        } else {
            runs.push(RowState::EXCLUDED);
        }
    }

    let params = ConsecParams {
        num_procs: ctx.num_procs,
        limits,
        required: &ctx.required,
        contiguous: ctx.contiguous,
    };
    let num_rows = table.partition(ctx.partition).num_rows;
    let mut attempted = false;
    let mut blocked: Option<NodeIndex> = None;

    for row in 1..=num_rows {
        for attempt in 0..3u8 {
            let mut map = NodeBitmap::new(table.len());
            let mut counts = vec![0u32; table.len()];
            let mut choices: Vec<Option<RowChoice>> = vec![None; table.len()];
            let mut abandoned = None;
            for (i, state) in runs.states().enumerate() {
                match admission(state, row, attempt) {
                    Some((count, choice)) => {
                        map.set(i);
                        counts[i] = count;
                        choices[i] = Some(choice);
                    }
                    None if ctx.required.test(i) => {
                        abandoned = Some(i);
                        break;
                    }
                    None => {}
                }
            }
            if let Some(node) = abandoned {
                blocked.get_or_insert(node);
                continue;
            }
            if (map.count() as u32) < limits.min {
                attempted = true;
                continue;
            }
            match select_nodes(&mut map, &counts, &params) {
                Ok(()) => {
                    debug!(job_id = ctx.job_id, row, attempt, nodes = %map, "row search succeeded");
                    return Ok(finish(table, ctx, map, &counts, &choices));
                }
                Err(SelectError::InfeasibleRequired { node }) => {
                    blocked.get_or_insert(node);
                }
                Err(SelectError::InfeasibleNow) => attempted = true,
                Err(e) => return Err(e),
            }
        }
    }

    debug!(job_id = ctx.job_id, "no row admits the job");
    match blocked {
        Some(node) if !attempted => Err(SelectError::InfeasibleRequired { node }),
        _ => Err(SelectError::InfeasibleNow),
    }
}

fn finish(
    table: &NodeTable,
    ctx: &JobContext,
    nodes: NodeBitmap,
    counts: &[u32],
    choices: &[Option<RowChoice>],
) -> Selection {
    let unit = table.granularity().unit();
    let mut offered = Vec::with_capacity(nodes.count());
    let mut rows = Vec::with_capacity(nodes.count());
    for i in nodes.iter() {
        offered.push(counts[i]);
        let node = table.node(i);
        let pick = node
            .part(ctx.partition)
            .map(|p| pick_rows(p, unit, node.hw.cores))
            .unwrap_or_default();
        let row = match choices[i] {
            Some(RowChoice::Pack) => pick.least_loaded,
            _ => pick.first_empty,
        };
        rows.push(row.unwrap_or(0));
    }
    Selection { nodes, offered, rows }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(busy: i32, share: u32, all: u32) -> RowState {
        RowState { busy, share, all }
    }

    #[test]
    fn runs_compress_identical_neighbours() {
        let mut runs = RowRuns::default();
        for s in [state(0, 0, 4), state(0, 0, 4), RowState::EXCLUDED, state(0, 0, 4)] {
            runs.push(s);
        }
        assert_eq!(runs.freq, vec![2, 1, 1]);
        assert_eq!(runs.busy_rows, vec![0, -1, 0]);
        assert_eq!(runs.len(), 4);
        assert_eq!(runs.states().nth(3), Some(state(0, 0, 4)));
    }

    #[test]
    fn first_attempt_only_packs() {
        assert_eq!(admission(state(0, 0, 4), 1, 0), None);
        assert_eq!(admission(state(1, 2, 0), 1, 0), Some((2, RowChoice::Pack)));
        assert_eq!(admission(state(1, 0, 4), 1, 0), None);
    }

    #[test]
    fn second_attempt_opens_idle_nodes() {
        assert_eq!(admission(state(0, 0, 4), 1, 1), Some((4, RowChoice::Open)));
        assert_eq!(admission(state(1, 0, 4), 2, 1), None);
    }

    #[test]
    fn third_attempt_opens_partially_loaded_nodes() {
        assert_eq!(admission(state(1, 0, 4), 2, 2), Some((4, RowChoice::Open)));
        // Already at the row limit: nothing to open.
        assert_eq!(admission(state(2, 0, 0), 2, 2), None);
        assert_eq!(admission(state(3, 1, 0), 2, 2), None);
        assert_eq!(admission(RowState::EXCLUDED, 4, 2), None);
    }
}
