//! Shared types used across the consres crates.

use serde::{Deserialize, Serialize};

/// Job identifier assigned by the job queue.
pub type JobId = u32;

/// Position of a node in the node table (stable between reconfigurations).
pub type NodeIndex = usize;

/// Bit or-ed into `max_share` when a partition forces sharing.
pub const SHARED_FORCE: u16 = 0x8000;

/// Which counter the selector consults when measuring free capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
    Cpu,
    CpuMemory,
    Core,
    CoreMemory,
    Socket,
    SocketMemory,
    Memory,
}

/// The unit free capacity is counted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceUnit {
    Cpu,
    Core,
    Socket,
    /// Only memory is consumable; processors are never exhausted.
    MemoryOnly,
}

impl Granularity {
    pub fn unit(self) -> ResourceUnit {
        match self {
            Granularity::Cpu | Granularity::CpuMemory => ResourceUnit::Cpu,
            Granularity::Core | Granularity::CoreMemory => ResourceUnit::Core,
            Granularity::Socket | Granularity::SocketMemory => ResourceUnit::Socket,
            Granularity::Memory => ResourceUnit::MemoryOnly,
        }
    }

    /// Whether memory is a consumable dimension.
    pub fn tracks_memory(self) -> bool {
        matches!(
            self,
            Granularity::CpuMemory
                | Granularity::CoreMemory
                | Granularity::SocketMemory
                | Granularity::Memory
        )
    }

    /// Whether jobs carry a per-socket core allocation.
    pub fn per_socket(self) -> bool {
        matches!(self.unit(), ResourceUnit::Core | ResourceUnit::Socket)
    }

    /// Wire code used by the state blob.
    pub fn code(self) -> u16 {
        match self {
            Granularity::Cpu => 1,
            Granularity::Socket => 2,
            Granularity::Core => 3,
            Granularity::Memory => 4,
            Granularity::SocketMemory => 5,
            Granularity::CoreMemory => 6,
            Granularity::CpuMemory => 7,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1 => Granularity::Cpu,
            2 => Granularity::Socket,
            3 => Granularity::Core,
            4 => Granularity::Memory,
            5 => Granularity::SocketMemory,
            6 => Granularity::CoreMemory,
            7 => Granularity::CpuMemory,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Granularity::Cpu => "CPU",
            Granularity::CpuMemory => "CPU_MEMORY",
            Granularity::Core => "CORE",
            Granularity::CoreMemory => "CORE_MEMORY",
            Granularity::Socket => "SOCKET",
            Granularity::SocketMemory => "SOCKET_MEMORY",
            Granularity::Memory => "MEMORY",
        };
        f.write_str(name)
    }
}

/// Partition sharing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SharedPolicy {
    Exclusive,
    Force,
    Yes,
    No,
}

/// Node state tag, doubling as a job's node-request class.
///
/// Ordered by restrictiveness: adding a job never lowers a node's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Available,
    OneRow,
    Reserved,
}

impl NodeState {
    pub fn code(self) -> u16 {
        match self {
            NodeState::Available => 0,
            NodeState::OneRow => 1,
            NodeState::Reserved => 2,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(NodeState::Available),
            1 => Some(NodeState::OneRow),
            2 => Some(NodeState::Reserved),
            _ => None,
        }
    }
}

/// Static hardware description of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHardware {
    pub name: String,
    pub cpus: u16,
    pub sockets: u16,
    /// Cores per socket.
    pub cores: u16,
    /// Threads per core.
    pub threads: u16,
    /// Real memory in MB.
    pub real_memory: u32,
}

impl NodeHardware {
    pub fn total_cores(&self) -> u32 {
        u32::from(self.sockets) * u32::from(self.cores)
    }
}

/// Task layout requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskDist {
    #[default]
    Block,
    Cyclic,
    BlockBlock,
    CyclicBlock,
    BlockCyclic,
    CyclicCyclic,
    Arbitrary,
    Plane { size: u16 },
}

/// How cores are drawn from the sockets of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketLayout {
    /// Fill the lowest-numbered socket before moving on.
    Pack,
    /// One core per socket per pass.
    RoundRobin,
    /// `size` cores per socket per pass.
    Plane(u16),
}

impl TaskDist {
    pub fn socket_layout(self) -> SocketLayout {
        match self {
            TaskDist::BlockBlock | TaskDist::CyclicBlock => SocketLayout::Pack,
            TaskDist::Block
            | TaskDist::Cyclic
            | TaskDist::BlockCyclic
            | TaskDist::CyclicCyclic
            | TaskDist::Arbitrary => SocketLayout::RoundRobin,
            TaskDist::Plane { size } => SocketLayout::Plane(size.max(1)),
        }
    }
}

/// Memory demand of a job, in MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryRequest {
    #[default]
    None,
    PerNode(u32),
    PerCpu(u32),
}

impl MemoryRequest {
    /// Memory needed on a node that runs `cpus` of this job's CPUs.
    pub fn for_cpus(self, cpus: u32) -> u32 {
        match self {
            MemoryRequest::None => 0,
            MemoryRequest::PerNode(mb) => mb,
            MemoryRequest::PerCpu(mb) => mb.saturating_mul(cpus),
        }
    }
}

/// Multi-core placement constraints. Zero means "not specified".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiCoreSpec {
    pub min_sockets: u16,
    pub max_sockets: u16,
    pub min_cores: u16,
    pub max_cores: u16,
    pub min_threads: u16,
    pub max_threads: u16,
    pub ntasks_per_node: u16,
    pub ntasks_per_socket: u16,
    pub ntasks_per_core: u16,
    pub cpus_per_task: u16,
}

impl MultiCoreSpec {
    pub fn cpus_per_task(&self) -> u16 {
        self.cpus_per_task.max(1)
    }
}

/// Node-count bounds for one placement request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLimits {
    pub min: u32,
    pub max: u32,
    /// Desired node count; never below `min`.
    pub req: u32,
}

impl NodeLimits {
    pub fn new(min: u32, max: u32, req: u32) -> Self {
        Self {
            min,
            max: max.max(min),
            req: req.max(min),
        }
    }

    pub fn exactly(count: u32) -> Self {
        Self::new(count, count, count)
    }
}

/// Demand side of a queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub partition: String,
    /// Total CPUs requested.
    pub num_procs: u32,
    #[serde(default)]
    pub contiguous: bool,
    /// `Some(false)` requests whole nodes.
    #[serde(default)]
    pub shared: Option<bool>,
    #[serde(default)]
    pub memory: MemoryRequest,
    #[serde(default)]
    pub multicore: MultiCoreSpec,
    #[serde(default)]
    pub dist: TaskDist,
    /// Tasks per allocated node, in node-table order.
    #[serde(default)]
    pub task_layout: Option<Vec<u16>>,
    #[serde(default)]
    pub required_nodes: Vec<String>,
    #[serde(default)]
    pub excluded_nodes: Vec<String>,
    /// Wall-clock limit in seconds.
    #[serde(default)]
    pub time_limit: u32,
}

impl JobRequest {
    pub fn new(job_id: JobId, partition: &str, num_procs: u32) -> Self {
        Self {
            job_id,
            partition: partition.to_string(),
            num_procs,
            contiguous: false,
            shared: None,
            memory: MemoryRequest::None,
            multicore: MultiCoreSpec::default(),
            dist: TaskDist::default(),
            task_layout: None,
            required_nodes: Vec::new(),
            excluded_nodes: Vec::new(),
            time_limit: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_codes_round_trip() {
        for g in [
            Granularity::Cpu,
            Granularity::CpuMemory,
            Granularity::Core,
            Granularity::CoreMemory,
            Granularity::Socket,
            Granularity::SocketMemory,
            Granularity::Memory,
        ] {
            assert_eq!(Granularity::from_code(g.code()), Some(g));
        }
        assert_eq!(Granularity::from_code(99), None);
    }

    #[test]
    fn node_state_orders_by_restrictiveness() {
        assert!(NodeState::Available < NodeState::OneRow);
        assert!(NodeState::OneRow < NodeState::Reserved);
    }

    #[test]
    fn socket_layout_groups() {
        assert_eq!(TaskDist::CyclicBlock.socket_layout(), SocketLayout::Pack);
        assert_eq!(TaskDist::Block.socket_layout(), SocketLayout::RoundRobin);
        assert_eq!(TaskDist::Plane { size: 0 }.socket_layout(), SocketLayout::Plane(1));
    }

    #[test]
    fn per_cpu_memory_scales() {
        assert_eq!(MemoryRequest::PerCpu(512).for_cpus(3), 1536);
        assert_eq!(MemoryRequest::PerNode(512).for_cpus(3), 512);
        assert_eq!(MemoryRequest::None.for_cpus(3), 0);
    }

    #[test]
    fn node_limits_clamp_upward() {
        let limits = NodeLimits::new(2, 1, 0);
        assert_eq!(limits.max, 2);
        assert_eq!(limits.req, 2);
    }
}
