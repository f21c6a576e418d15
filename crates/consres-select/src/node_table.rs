//! Node table: per-node occupancy, one row × socket matrix per partition.
//!
//! Each node carries a `PartRows` arena for every partition it belongs to.
//! The arena is a single contiguous block of `num_rows × stride` counters,
//! where the stride is the node's socket count. A job's row offset is a flat
//! index into that block (`row × stride`), so growing a node only has to
//! re-stride the block.

use std::collections::HashMap;

use tracing::{debug, error, info};

use consres_core::config::validate_hardware;
use consres_core::{
    ClusterConfig, Granularity, NodeBitmap, NodeHardware, NodeIndex, NodeState, ResourceUnit,
    SharedPolicy,
};

use crate::error::{SelectError, SelectResult};
use crate::job_table::JobResources;

/// Index into the partition list of a [`NodeTable`].
pub type PartitionId = usize;

/// A partition as the selector sees it.
#[derive(Debug, Clone)]
pub struct Partition {
    pub name: String,
    pub policy: SharedPolicy,
    /// Raw `max_share`, possibly carrying `SHARED_FORCE`.
    pub max_share: u16,
    pub num_rows: u16,
    pub nodes: NodeBitmap,
}

impl Partition {
    pub fn is_single_row(&self) -> bool {
        self.num_rows == 1
    }
}

/// Row × socket allocation counters for one partition on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRows {
    pub partition: PartitionId,
    num_rows: u16,
    stride: u16,
    cells: Vec<u16>,
}

impl PartRows {
    pub fn new(partition: PartitionId, num_rows: u16, sockets: u16) -> Self {
        let num_rows = num_rows.max(1);
        Self {
            partition,
            num_rows,
            stride: sockets,
            cells: vec![0; usize::from(num_rows) * usize::from(sockets)],
        }
    }

    pub fn num_rows(&self) -> u16 {
        self.num_rows
    }

    pub fn stride(&self) -> u16 {
        self.stride
    }

    pub fn row(&self, row: u16) -> &[u16] {
        let stride = usize::from(self.stride);
        let start = usize::from(row) * stride;
        &self.cells[start..start + stride]
    }

    pub fn cell(&self, row: u16, socket: u16) -> u16 {
        self.row(row)[usize::from(socket)]
    }

    pub fn is_idle(&self) -> bool {
        self.cells.iter().all(|c| *c == 0)
    }

    pub fn row_is_idle(&self, row: u16) -> bool {
        self.row(row).iter().all(|c| *c == 0)
    }

    /// Number of rows holding at least one allocation.
    pub fn busy_rows(&self) -> u16 {
        (0..self.num_rows).filter(|r| !self.row_is_idle(*r)).count() as u16
    }

    /// Flat offset of the first socket of `row`.
    pub fn row_offset(&self, row: u16) -> u16 {
        row * self.stride
    }

    /// Whether `offset` still names the start of a row.
    pub fn offset_valid(&self, offset: u16) -> bool {
        self.stride > 0
            && offset % self.stride == 0
            && u32::from(offset) + u32::from(self.stride)
                <= u32::from(self.num_rows) * u32::from(self.stride)
    }

    fn span_mut(&mut self, offset: u16, width: usize) -> Option<&mut [u16]> {
        if !self.offset_valid(offset) || width > usize::from(self.stride) {
            return None;
        }
        let start = usize::from(offset);
        Some(&mut self.cells[start..start + width])
    }

    /// Grow the row stride to `sockets`, zero-filling the new sockets.
    ///
    /// Existing `(row, socket)` counters keep their coordinates.
    pub fn grow_stride(&mut self, sockets: u16) {
        if sockets <= self.stride {
            return;
        }
        let (old, new) = (usize::from(self.stride), usize::from(sockets));
        let mut cells = vec![0; usize::from(self.num_rows) * new];
        for r in 0..usize::from(self.num_rows) {
            cells[r * new..r * new + old].copy_from_slice(&self.cells[r * old..r * old + old]);
        }
        self.cells = cells;
        self.stride = sockets;
    }
}

/// Result of scanning a partition's rows on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowPick {
    /// Occupied row with the lowest load, first occurrence on ties.
    pub least_loaded: Option<u16>,
    /// First row with no allocation at all.
    pub first_empty: Option<u16>,
}

/// Classify every row as empty or occupied and pick the two candidates
/// callers choose between: pack into an existing row, or open a fresh one.
///
/// At socket granularity an occupied socket counts as all of its cores.
pub fn pick_rows(rows: &PartRows, unit: ResourceUnit, cores_per_socket: u16) -> RowPick {
    let mut pick = RowPick::default();
    let mut lowest = u32::MAX;
    for r in 0..rows.num_rows() {
        let load: u32 = rows
            .row(r)
            .iter()
            .map(|&c| match unit {
                ResourceUnit::Socket if c > 0 => u32::from(cores_per_socket),
                _ => u32::from(c),
            })
            .sum();
        if load == 0 {
            if pick.first_empty.is_none() {
                pick.first_empty = Some(r);
            }
        } else if load < lowest {
            lowest = load;
            pick.least_loaded = Some(r);
        }
    }
    pick
}

/// One node: hardware, state tag, memory accumulator, partition rows.
#[derive(Debug, Clone)]
pub struct NodeCr {
    pub hw: NodeHardware,
    pub state: NodeState,
    pub alloc_memory: u32,
    parts: Vec<PartRows>,
}

impl NodeCr {
    pub fn parts(&self) -> &[PartRows] {
        &self.parts
    }

    pub fn part(&self, partition: PartitionId) -> Option<&PartRows> {
        self.parts.iter().find(|p| p.partition == partition)
    }

    fn part_mut(&mut self, partition: PartitionId) -> Option<&mut PartRows> {
        self.parts.iter_mut().find(|p| p.partition == partition)
    }

    pub fn free_memory(&self) -> u32 {
        self.hw.real_memory.saturating_sub(self.alloc_memory)
    }

    pub fn has_allocated_cores(&self) -> bool {
        self.parts.iter().any(|p| !p.is_idle())
    }
}

enum CoreAdjust {
    Applied,
    Ghosted,
    Clamped,
}

/// The in-memory node table.
#[derive(Debug, Clone)]
pub struct NodeTable {
    granularity: Granularity,
    fast_schedule: bool,
    nodes: Vec<NodeCr>,
    partitions: Vec<Partition>,
    names: HashMap<String, NodeIndex>,
}

impl NodeTable {
    /// Build the table from the configured topology. Every node starts
    /// `AVAILABLE` with zeroed counters.
    pub fn initialise(config: &ClusterConfig) -> SelectResult<Self> {
        let topology = config.topology()?;
        let mut names = HashMap::with_capacity(topology.len());
        for (i, hw) in topology.iter().enumerate() {
            names.insert(hw.name.clone(), i);
        }

        let mut partitions = Vec::with_capacity(config.partitions.len());
        for part in &config.partitions {
            let mut members = NodeBitmap::new(topology.len());
            for name in config.partition_nodes(part)? {
                let i = *names
                    .get(&name)
                    .ok_or_else(|| SelectError::UnknownNode(name.clone()))?;
                members.set(i);
            }
            partitions.push(Partition {
                name: part.name.clone(),
                policy: part.shared,
                max_share: part.max_share_raw(),
                num_rows: part.num_rows(),
                nodes: members,
            });
        }

        let nodes: Vec<NodeCr> = topology
            .into_iter()
            .enumerate()
            .map(|(i, hw)| {
                let parts = partitions
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.nodes.test(i))
                    .map(|(pid, p)| PartRows::new(pid, p.num_rows, hw.sockets))
                    .collect();
                NodeCr {
                    hw,
                    state: NodeState::Available,
                    alloc_memory: 0,
                    parts,
                }
            })
            .collect();

        info!(
            nodes = nodes.len(),
            partitions = partitions.len(),
            granularity = %config.select.granularity,
            "node table initialised"
        );

        Ok(Self {
            granularity: config.select.granularity,
            fast_schedule: config.select.fast_schedule,
            nodes,
            partitions,
            names,
        })
    }

    /// Same topology with every counter cleared.
    pub fn idle_copy(&self) -> Self {
        let mut copy = self.clone();
        for node in &mut copy.nodes {
            node.state = NodeState::Available;
            node.alloc_memory = 0;
            for part in &mut node.parts {
                part.cells.fill(0);
            }
        }
        copy
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn fast_schedule(&self) -> bool {
        self.fast_schedule
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, i: NodeIndex) -> &NodeCr {
        &self.nodes[i]
    }

    pub fn nodes(&self) -> &[NodeCr] {
        &self.nodes
    }

    pub fn node_index(&self, name: &str) -> Option<NodeIndex> {
        self.names.get(name).copied()
    }

    pub fn node_name(&self, i: NodeIndex) -> &str {
        &self.nodes[i].hw.name
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition(&self, id: PartitionId) -> &Partition {
        &self.partitions[id]
    }

    pub fn partition_id(&self, name: &str) -> Option<PartitionId> {
        self.partitions.iter().position(|p| p.name == name)
    }

    /// Resolve node names into a bitmap over this table.
    pub fn bitmap_of<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> SelectResult<NodeBitmap> {
        let mut map = NodeBitmap::new(self.len());
        for name in names {
            let i = self
                .node_index(name)
                .ok_or_else(|| SelectError::UnknownNode(name.clone()))?;
            map.set(i);
        }
        Ok(map)
    }

    /// Whether any multi-row partition has an allocation on the node.
    pub fn is_sharing(&self, i: NodeIndex) -> bool {
        self.nodes[i]
            .parts
            .iter()
            .any(|p| !self.partitions[p.partition].is_single_row() && !p.is_idle())
    }

    /// Whether every single-row partition on the node is unallocated.
    pub fn single_rows_idle(&self, i: NodeIndex) -> bool {
        self.nodes[i]
            .parts
            .iter()
            .filter(|p| self.partitions[p.partition].is_single_row())
            .all(PartRows::is_idle)
    }

    /// Apply a job's allocation. Memory is applied unless already applied;
    /// cores are applied unless `suspend` is set or they already are.
    ///
    /// A node whose row offset is no longer valid is skipped for cores
    /// (the job is ghosted there) but still charged memory.
    pub fn add_job(&mut self, job: &mut JobResources, suspend: bool) {
        let apply_mem = !job.applied.memory;
        let apply_cpus = !suspend && !job.applied.cpus;
        if !apply_mem && !apply_cpus {
            return;
        }
        let unit = self.granularity.unit();

        for (host, i) in job.node_bitmap.iter().enumerate() {
            let node = &mut self.nodes[i];
            if apply_mem {
                let mem = job.alloc_memory.get(host).copied().unwrap_or(0);
                node.alloc_memory = node.alloc_memory.saturating_add(mem);
            }
            if !apply_cpus {
                continue;
            }
            match adjust_cores(node, job, host, unit, true) {
                CoreAdjust::Applied => {}
                CoreAdjust::Ghosted => error!(
                    job_id = job.job_id,
                    node = %node.hw.name,
                    offset = job.node_offset.get(host).copied().unwrap_or(0),
                    "row offset no longer valid, job ghosted on node"
                ),
                CoreAdjust::Clamped => error!(
                    job_id = job.job_id,
                    node = %node.hw.name,
                    "core counter overflow clamped"
                ),
            }
            node.state = node.state.max(job.node_req);
        }

        if apply_mem {
            job.applied.memory = true;
        }
        if apply_cpus {
            job.applied.cpus = true;
        }
        debug!(job_id = job.job_id, suspend, "job applied to node table");
    }

    /// Undo a job's allocation. With `remove_all` unset (suspend) only
    /// cores are refunded. Underflow is clamped, logged, and reported.
    pub fn remove_job(&mut self, job: &mut JobResources, remove_all: bool) -> SelectResult<()> {
        let take_mem = remove_all && job.applied.memory;
        let take_cpus = job.applied.cpus;
        if !take_mem && !take_cpus {
            return Ok(());
        }
        let unit = self.granularity.unit();
        let partitions = &self.partitions;
        let mut underflow = false;

        for (host, i) in job.node_bitmap.iter().enumerate() {
            let node = &mut self.nodes[i];
            if take_mem {
                let mem = job.alloc_memory.get(host).copied().unwrap_or(0);
                if mem > node.alloc_memory {
                    error!(
                        job_id = job.job_id,
                        node = %node.hw.name,
                        alloc = node.alloc_memory,
                        mem,
                        "memory underflow"
                    );
                    node.alloc_memory = 0;
                    underflow = true;
                } else {
                    node.alloc_memory -= mem;
                }
            }
            if !take_cpus {
                continue;
            }
            match adjust_cores(node, job, host, unit, false) {
                CoreAdjust::Applied => {}
                CoreAdjust::Ghosted => debug!(
                    job_id = job.job_id,
                    node = %node.hw.name,
                    "ghosted job skipped for core refund"
                ),
                CoreAdjust::Clamped => {
                    error!(job_id = job.job_id, node = %node.hw.name, "core counter underflow");
                    underflow = true;
                }
            }
            let single_idle = node
                .parts
                .iter()
                .filter(|p| partitions[p.partition].is_single_row())
                .all(PartRows::is_idle);
            if single_idle {
                node.state = NodeState::Available;
            }
        }

        job.applied.cpus = false;
        if remove_all {
            job.applied.memory = false;
        }
        debug!(job_id = job.job_id, remove_all, "job removed from node table");

        if underflow {
            return Err(SelectError::Underflow(job.job_id));
        }
        Ok(())
    }

    /// Free capacity per socket that a job in `partition` would see in `row`.
    ///
    /// At CPU granularity the vector has one entry (free CPUs); with memory
    /// as the only consumable it is the full CPU count. Single-row
    /// partitions share one physical row, so their occupancy is combined.
    pub fn free_cores(&self, i: NodeIndex, partition: PartitionId, row: u16) -> Vec<u16> {
        let node = &self.nodes[i];
        let unit = self.granularity.unit();
        if unit == ResourceUnit::MemoryOnly {
            return vec![node.hw.cpus];
        }
        let Some(rows) = node.part(partition) else {
            return Vec::new();
        };
        let single = self.partitions[partition].is_single_row();
        let width = match unit {
            ResourceUnit::Cpu => 1,
            _ => rows.stride(),
        };
        (0..width)
            .map(|s| {
                let mut used = u32::from(rows.cell(row, s));
                if single {
                    used += node
                        .parts
                        .iter()
                        .filter(|o| {
                            o.partition != partition && self.partitions[o.partition].is_single_row()
                        })
                        .map(|o| u32::from(o.cell(0, s)))
                        .sum::<u32>();
                }
                match unit {
                    ResourceUnit::Cpu => clamp_u16(u32::from(node.hw.cpus).saturating_sub(used)),
                    ResourceUnit::Socket if used > 0 => 0,
                    _ => clamp_u16(u32::from(node.hw.cores).saturating_sub(used)),
                }
            })
            .collect()
    }

    /// The most CPUs (cores or sockets, per granularity) the node can still
    /// offer a single job.
    pub fn free_count(&self, i: NodeIndex) -> u32 {
        let node = &self.nodes[i];
        let unit = self.granularity.unit();
        let hw = &node.hw;
        let total = match unit {
            ResourceUnit::Cpu | ResourceUnit::MemoryOnly => u32::from(hw.cpus),
            ResourceUnit::Core => hw.total_cores(),
            ResourceUnit::Socket => u32::from(hw.sockets),
        };
        if node.state == NodeState::Reserved {
            return 0;
        }
        if unit == ResourceUnit::MemoryOnly {
            return total;
        }
        match node.state {
            NodeState::OneRow => {
                let single: Vec<&PartRows> = node
                    .parts
                    .iter()
                    .filter(|p| self.partitions[p.partition].is_single_row())
                    .collect();
                let used: u32 = match unit {
                    ResourceUnit::Cpu => single.iter().map(|p| u32::from(p.cell(0, 0))).sum(),
                    ResourceUnit::Core => (0..hw.sockets)
                        .map(|s| {
                            let per: u32 = single.iter().map(|p| u32::from(p.cell(0, s))).sum();
                            per.min(u32::from(hw.cores))
                        })
                        .sum(),
                    _ => (0..hw.sockets)
                        .filter(|s| single.iter().any(|p| p.cell(0, *s) > 0))
                        .count() as u32,
                };
                total.saturating_sub(used)
            }
            _ => {
                if node.parts.is_empty() {
                    return total;
                }
                node.parts
                    .iter()
                    .flat_map(|p| (0..p.num_rows()).map(move |r| row_free(hw, p, r, unit)))
                    .max()
                    .unwrap_or(0)
            }
        }
    }

    /// CPUs in use: the busiest row of each partition, summed, capped at the
    /// node's CPU count.
    pub fn allocated_cpus(&self, i: NodeIndex) -> u16 {
        let node = &self.nodes[i];
        let hw = &node.hw;
        let unit = self.granularity.unit();
        let used: u32 = node
            .parts
            .iter()
            .map(|p| {
                (0..p.num_rows())
                    .map(|r| {
                        let row = p.row(r);
                        match unit {
                            ResourceUnit::MemoryOnly => 0,
                            ResourceUnit::Cpu => u32::from(row[0]),
                            ResourceUnit::Core => {
                                row.iter().map(|c| u32::from(*c)).sum::<u32>() * u32::from(hw.threads)
                            }
                            ResourceUnit::Socket => {
                                row.iter().filter(|c| **c > 0).count() as u32
                                    * u32::from(hw.cores)
                                    * u32::from(hw.threads)
                            }
                        }
                    })
                    .max()
                    .unwrap_or(0)
            })
            .sum();
        clamp_u16(used.min(u32::from(hw.cpus)))
    }

    /// Accept new hardware reported by a node at check-in.
    ///
    /// Growth re-strides every row matrix on the node; the caller moves job
    /// offsets with [`JobResources::restride`]. Shrinking is only allowed
    /// while nothing occupies the node.
    pub fn update_node_config(&mut self, i: NodeIndex, hw: NodeHardware) -> SelectResult<()> {
        validate_hardware(&hw)?;
        let node = &mut self.nodes[i];
        if self.fast_schedule {
            return Err(SelectError::FastSchedule(node.hw.name.clone()));
        }
        let old = &node.hw;
        let shrinking = hw.sockets < old.sockets
            || hw.cores < old.cores
            || hw.threads < old.threads
            || hw.cpus < old.cpus
            || hw.real_memory < old.real_memory;
        let occupied = node.alloc_memory > 0 || node.has_allocated_cores();
        if shrinking && occupied {
            return Err(SelectError::ShrinkWithOccupants(old.name.clone()));
        }

        if shrinking {
            for part in &mut node.parts {
                *part = PartRows::new(part.partition, part.num_rows(), hw.sockets);
            }
        } else if hw.sockets > old.sockets {
            for part in &mut node.parts {
                part.grow_stride(hw.sockets);
            }
        }
        info!(
            node = %old.name,
            cpus = hw.cpus,
            sockets = hw.sockets,
            cores = hw.cores,
            "node hardware updated"
        );
        node.hw = NodeHardware {
            name: old.name.clone(),
            ..hw
        };
        Ok(())
    }
}

fn row_free(hw: &NodeHardware, part: &PartRows, row: u16, unit: ResourceUnit) -> u32 {
    let cells = part.row(row);
    match unit {
        ResourceUnit::Cpu => u32::from(hw.cpus).saturating_sub(u32::from(cells[0])),
        ResourceUnit::Socket => cells.iter().filter(|c| **c == 0).count() as u32,
        _ => cells
            .iter()
            .map(|c| u32::from(hw.cores).saturating_sub(u32::from(*c)))
            .sum(),
    }
}

fn adjust_cores(
    node: &mut NodeCr,
    job: &JobResources,
    host: usize,
    unit: ResourceUnit,
    add: bool,
) -> CoreAdjust {
    let capacity = match unit {
        ResourceUnit::MemoryOnly => return CoreAdjust::Applied,
        ResourceUnit::Cpu => node.hw.cpus,
        ResourceUnit::Core | ResourceUnit::Socket => node.hw.cores,
    };
    let amounts: &[u16] = match unit {
        ResourceUnit::Cpu => match job.alloc_cpus.get(host..=host) {
            Some(a) => a,
            None => return CoreAdjust::Ghosted,
        },
        _ => match job.alloc_cores.as_ref().and_then(|c| c.get(host)) {
            Some(a) => a,
            None => return CoreAdjust::Ghosted,
        },
    };
    let Some(offset) = job.node_offset.get(host).copied() else {
        return CoreAdjust::Ghosted;
    };
    let Some(part) = node.part_mut(job.partition) else {
        return CoreAdjust::Ghosted;
    };
    let Some(span) = part.span_mut(offset, amounts.len()) else {
        return CoreAdjust::Ghosted;
    };

    let mut clamped = false;
    for (cell, &amount) in span.iter_mut().zip(amounts) {
        if add {
            let total = u32::from(*cell) + u32::from(amount);
            if total > u32::from(capacity) {
                clamped = true;
                *cell = capacity;
            } else {
                *cell = total as u16;
            }
        } else if amount > *cell {
            clamped = true;
            *cell = 0;
        } else {
            *cell -= amount;
        }
    }
    if clamped {
        CoreAdjust::Clamped
    } else {
        CoreAdjust::Applied
    }
}

fn clamp_u16(v: u32) -> u16 {
    v.min(u32::from(u16::MAX)) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_table::AppliedFlags;
    use consres_core::{ClusterConfig, SHARED_FORCE};

    fn config(granularity: &str, shared: &str, max_share: u16) -> ClusterConfig {
        ClusterConfig::from_toml_str(&format!(
            r#"
[select]
granularity = "{granularity}"
fast_schedule = false

[[nodes]]
name = "n[0-3]"
cpus = 4
sockets = 2
cores = 2
threads = 1
real_memory = 4096

[[partitions]]
name = "batch"
nodes = ["n[0-3]"]
shared = "{shared}"
max_share = {max_share}
"#
        ))
        .unwrap()
    }

    fn core_job(job_id: u32, nodes: &[usize], row: u16, cores: Vec<u16>, mem: u32) -> JobResources {
        let n = nodes.len();
        JobResources {
            job_id,
            nprocs: cores.iter().map(|c| u32::from(*c)).sum::<u32>() * n as u32,
            nhosts: n as u32,
            node_req: NodeState::Available,
            partition: 0,
            node_bitmap: NodeBitmap::from_indices(4, nodes.iter().copied()),
            cpus: vec![4; n],
            alloc_cpus: vec![cores.iter().sum(); n],
            node_offset: vec![row * 2; n],
            alloc_memory: vec![mem; n],
            alloc_cores: Some(vec![cores; n]),
            applied: AppliedFlags::default(),
            steps: Default::default(),
        }
    }

    #[test]
    fn initialise_builds_rows_from_max_share() {
        let table = NodeTable::initialise(&config("CORE", "YES", 3)).unwrap();
        assert_eq!(table.len(), 4);
        let part = table.node(0).part(0).unwrap();
        assert_eq!(part.num_rows(), 3);
        assert_eq!(part.stride(), 2);
        assert!(part.is_idle());
        assert_eq!(table.node(0).state, NodeState::Available);
    }

    #[test]
    fn exclusive_partition_gets_one_row() {
        let table = NodeTable::initialise(&config("CORE", "EXCLUSIVE", 4)).unwrap();
        assert_eq!(table.node(2).part(0).unwrap().num_rows(), 1);
    }

    #[test]
    fn force_bit_is_kept_on_max_share() {
        let table = NodeTable::initialise(&config("CORE", "FORCE", 2)).unwrap();
        assert_eq!(table.partition(0).max_share, 2 | SHARED_FORCE);
        assert_eq!(table.partition(0).num_rows, 2);
    }

    #[test]
    fn pick_rows_prefers_lowest_load_and_first_empty() {
        let mut rows = PartRows::new(0, 4, 2);
        rows.span_mut(0, 2).unwrap().copy_from_slice(&[2, 1]);
        rows.span_mut(4, 2).unwrap().copy_from_slice(&[1, 0]);
        let pick = pick_rows(&rows, ResourceUnit::Core, 2);
        assert_eq!(pick.least_loaded, Some(2));
        assert_eq!(pick.first_empty, Some(1));

        // At socket granularity any non-zero socket counts as full.
        let pick = pick_rows(&rows, ResourceUnit::Socket, 2);
        assert_eq!(pick.least_loaded, Some(2));
    }

    #[test]
    fn add_then_remove_is_identity() {
        let mut table = NodeTable::initialise(&config("CORE_MEMORY", "YES", 2)).unwrap();
        let before = table.clone();
        let mut job = core_job(7, &[1, 2], 1, vec![1, 2], 1024);

        table.add_job(&mut job, false);
        assert_eq!(table.node(1).part(0).unwrap().row(1), &[1, 2]);
        assert_eq!(table.node(2).alloc_memory, 1024);
        assert!(job.applied.cpus && job.applied.memory);

        table.remove_job(&mut job, true).unwrap();
        for i in 0..4 {
            assert_eq!(table.node(i).parts(), before.node(i).parts());
            assert_eq!(table.node(i).alloc_memory, 0);
            assert_eq!(table.node(i).state, NodeState::Available);
        }
    }

    #[test]
    fn add_is_idempotent() {
        let mut table = NodeTable::initialise(&config("CORE_MEMORY", "YES", 2)).unwrap();
        let mut job = core_job(1, &[0], 0, vec![1, 1], 512);
        table.add_job(&mut job, false);
        table.add_job(&mut job, false);
        assert_eq!(table.node(0).part(0).unwrap().row(0), &[1, 1]);
        assert_eq!(table.node(0).alloc_memory, 512);
    }

    #[test]
    fn suspend_keeps_memory() {
        let mut table = NodeTable::initialise(&config("CORE_MEMORY", "YES", 2)).unwrap();
        let mut job = core_job(1, &[0], 0, vec![2, 2], 512);
        table.add_job(&mut job, false);
        table.remove_job(&mut job, false).unwrap();
        assert!(table.node(0).part(0).unwrap().is_idle());
        assert_eq!(table.node(0).alloc_memory, 512);
        assert!(!job.applied.cpus && job.applied.memory);

        table.add_job(&mut job, false);
        assert_eq!(table.node(0).part(0).unwrap().row(0), &[2, 2]);
        assert_eq!(table.node(0).alloc_memory, 512);
    }

    #[test]
    fn underflow_is_clamped_and_reported() {
        let mut table = NodeTable::initialise(&config("CORE_MEMORY", "YES", 2)).unwrap();
        let mut job = core_job(3, &[0], 0, vec![1, 0], 256);
        job.applied = AppliedFlags {
            cpus: true,
            memory: true,
        };
        let err = table.remove_job(&mut job, true).unwrap_err();
        assert!(matches!(err, SelectError::Underflow(3)));
        assert_eq!(table.node(0).alloc_memory, 0);
        assert!(table.node(0).part(0).unwrap().is_idle());
    }

    #[test]
    fn state_follows_single_row_occupancy() {
        let mut table = NodeTable::initialise(&config("CORE", "NO", 1)).unwrap();
        let mut a = core_job(1, &[0], 0, vec![1, 0], 0);
        a.node_req = NodeState::OneRow;
        let mut b = core_job(2, &[0], 0, vec![0, 1], 0);
        b.node_req = NodeState::OneRow;

        table.add_job(&mut a, false);
        table.add_job(&mut b, false);
        assert_eq!(table.node(0).state, NodeState::OneRow);
        assert_eq!(table.free_count(0), 2);

        table.remove_job(&mut a, true).unwrap();
        assert_eq!(table.node(0).state, NodeState::OneRow);
        table.remove_job(&mut b, true).unwrap();
        assert_eq!(table.node(0).state, NodeState::Available);
    }

    #[test]
    fn free_count_by_state() {
        let mut table = NodeTable::initialise(&config("CORE", "YES", 2)).unwrap();
        let mut job = core_job(1, &[0], 0, vec![2, 1], 0);
        table.add_job(&mut job, false);
        // Row 1 is still empty, so the node can offer all four cores.
        assert_eq!(table.free_count(0), 4);

        let mut reserved = core_job(2, &[1], 0, vec![2, 2], 0);
        reserved.node_req = NodeState::Reserved;
        table.add_job(&mut reserved, false);
        assert_eq!(table.free_count(1), 0);
        assert_eq!(table.allocated_cpus(1), 4);
    }

    #[test]
    fn cpu_granularity_uses_socket_zero() {
        let mut table = NodeTable::initialise(&config("CPU", "YES", 1)).unwrap();
        let mut job = core_job(1, &[3], 0, vec![], 0);
        job.alloc_cores = None;
        job.alloc_cpus = vec![3];
        table.add_job(&mut job, false);
        assert_eq!(table.node(3).part(0).unwrap().row(0), &[3, 0]);
        assert_eq!(table.free_cores(3, 0, 0), vec![1]);
        assert_eq!(table.allocated_cpus(3), 3);
    }

    #[test]
    fn socket_granularity_blocks_whole_sockets() {
        let mut table = NodeTable::initialise(&config("SOCKET", "YES", 1)).unwrap();
        let mut job = core_job(1, &[0], 0, vec![1, 0], 0);
        table.add_job(&mut job, false);
        assert_eq!(table.free_cores(0, 0, 0), vec![0, 2]);
        assert_eq!(table.free_count(0), 1);
    }

    #[test]
    fn growth_restrides_rows_and_offsets() {
        let mut table = NodeTable::initialise(&config("CORE", "YES", 2)).unwrap();
        let mut row0 = core_job(1, &[0], 0, vec![1, 1], 0);
        let mut row1 = core_job(2, &[0], 1, vec![2, 2], 0);
        table.add_job(&mut row0, false);
        table.add_job(&mut row1, false);

        let mut hw = table.node(0).hw.clone();
        hw.sockets = 4;
        hw.cpus = 8;
        table.update_node_config(0, hw).unwrap();
        let part = table.node(0).part(0).unwrap();
        assert_eq!(part.stride(), 4);
        assert_eq!(part.row(0), &[1, 1, 0, 0]);
        assert_eq!(part.row(1), &[2, 2, 0, 0]);

        for job in [&mut row0, &mut row1] {
            job.restride(0, 2, 4);
        }
        assert_eq!(row1.node_offset, vec![4]);
        table.remove_job(&mut row1, true).unwrap();
        table.remove_job(&mut row0, true).unwrap();
        assert!(table.node(0).part(0).unwrap().is_idle());
        assert_eq!(table.allocated_cpus(0), 0);
    }

    #[test]
    fn misaligned_offset_is_ghosted() {
        let mut table = NodeTable::initialise(&config("CORE", "YES", 2)).unwrap();
        let mut job = core_job(1, &[0], 0, vec![1, 1], 0);
        job.node_offset = vec![1];
        table.add_job(&mut job, false);
        assert!(table.node(0).part(0).unwrap().is_idle());
        table.remove_job(&mut job, true).unwrap();
        assert!(table.node(0).part(0).unwrap().is_idle());
    }

    #[test]
    fn shrink_rejected_while_occupied() {
        let mut table = NodeTable::initialise(&config("CORE", "YES", 2)).unwrap();
        let mut job = core_job(1, &[0], 0, vec![1, 0], 0);
        table.add_job(&mut job, false);
        let mut hw = table.node(0).hw.clone();
        hw.sockets = 1;
        hw.cpus = 2;
        assert!(matches!(
            table.update_node_config(0, hw.clone()),
            Err(SelectError::ShrinkWithOccupants(_))
        ));
        table.remove_job(&mut job, true).unwrap();
        table.update_node_config(0, hw).unwrap();
        assert_eq!(table.node(0).part(0).unwrap().stride(), 1);
    }

    #[test]
    fn fast_schedule_rejects_checkin() {
        let mut cfg = config("CORE", "YES", 2);
        cfg.select.fast_schedule = true;
        let mut table = NodeTable::initialise(&cfg).unwrap();
        let hw = table.node(0).hw.clone();
        assert!(matches!(
            table.update_node_config(0, hw),
            Err(SelectError::FastSchedule(_))
        ));
    }
}
