//! Node-state classifier: drops candidates a job may not use right now.

use tracing::debug;

use consres_core::{MemoryRequest, NodeBitmap, NodeIndex, NodeState};

use crate::error::{SelectError, SelectResult};
use crate::node_table::NodeTable;

/// Memory a job needs on every node it lands on, before distribution.
pub fn memory_demand(memory: MemoryRequest, cpus_per_task: u16) -> u32 {
    match memory {
        MemoryRequest::None => 0,
        MemoryRequest::PerNode(mb) => mb,
        MemoryRequest::PerCpu(mb) => mb.saturating_mul(u32::from(cpus_per_task.max(1))),
    }
}

/// Whether a job of class `class` may share node `i` with its current
/// occupants.
pub fn state_allows(table: &NodeTable, i: NodeIndex, class: NodeState) -> bool {
    let node = table.node(i);
    match node.state {
        NodeState::Reserved => false,
        NodeState::OneRow => class == NodeState::OneRow && !table.is_sharing(i),
        NodeState::Available => match class {
            NodeState::Available => true,
            NodeState::OneRow => !table.is_sharing(i),
            NodeState::Reserved => !node.has_allocated_cores() && node.alloc_memory == 0,
        },
    }
}

/// Clear every candidate that fails the memory gate or the state rules.
///
/// The memory gate only applies when memory is a consumable and
/// `memory_demand` is non-zero. Clearing a required node fails the whole
/// request.
pub fn verify_node_state(
    table: &NodeTable,
    candidates: &mut NodeBitmap,
    required: &NodeBitmap,
    class: NodeState,
    memory_demand: u32,
) -> SelectResult<()> {
    let check_memory = table.granularity().tracks_memory() && memory_demand > 0;
    let indices: Vec<NodeIndex> = candidates.iter().collect();
    for i in indices {
        let node = table.node(i);
        let reason = if check_memory && node.free_memory() < memory_demand {
            Some("insufficient memory")
        } else if !state_allows(table, i, class) {
            Some("node state")
        } else {
            None
        };
        let Some(reason) = reason else {
            continue;
        };
        candidates.clear(i);
        debug!(node = %node.hw.name, state = ?node.state, ?class, reason, "candidate cleared");
        if required.test(i) {
            return Err(SelectError::InfeasibleRequired { node: i });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_table::{AppliedFlags, JobResources};
    use consres_core::ClusterConfig;

    fn table(shared: &str, max_share: u16) -> NodeTable {
        let cfg = ClusterConfig::from_toml_str(&format!(
            r#"
[select]
granularity = "CORE_MEMORY"

[[nodes]]
name = "n[0-1]"
cpus = 4
sockets = 2
cores = 2
real_memory = 4096

[[partitions]]
name = "p"
nodes = ["n[0-1]"]
shared = "{shared}"
max_share = {max_share}
"#
        ))
        .unwrap();
        NodeTable::initialise(&cfg).unwrap()
    }

    fn occupy(table: &mut NodeTable, node: usize, class: NodeState, mem: u32) {
        let mut job = JobResources {
            job_id: 99,
            nprocs: 1,
            nhosts: 1,
            node_req: class,
            partition: 0,
            node_bitmap: NodeBitmap::from_indices(2, [node]),
            cpus: vec![4],
            alloc_cpus: vec![1],
            node_offset: vec![0],
            alloc_memory: vec![mem],
            alloc_cores: Some(vec![vec![1, 0]]),
            applied: AppliedFlags::default(),
            steps: Default::default(),
        };
        table.add_job(&mut job, false);
    }

    #[test]
    fn memory_gate_clears_node() {
        let mut t = table("YES", 2);
        occupy(&mut t, 0, NodeState::Available, 3072);
        let mut cands = NodeBitmap::full(2);
        verify_node_state(&t, &mut cands, &NodeBitmap::new(2), NodeState::Available, 2048).unwrap();
        assert_eq!(cands.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn required_node_cleared_is_fatal() {
        let mut t = table("YES", 2);
        occupy(&mut t, 0, NodeState::Available, 3072);
        let mut cands = NodeBitmap::full(2);
        let required = NodeBitmap::from_indices(2, [0]);
        let err = verify_node_state(&t, &mut cands, &required, NodeState::Available, 2048).unwrap_err();
        assert!(matches!(err, SelectError::InfeasibleRequired { node: 0 }));
    }

    #[test]
    fn reserved_nodes_are_unusable() {
        let mut t = table("NO", 1);
        occupy(&mut t, 1, NodeState::Reserved, 0);
        for class in [NodeState::Available, NodeState::OneRow, NodeState::Reserved] {
            assert!(!state_allows(&t, 1, class));
        }
        assert!(state_allows(&t, 0, NodeState::Reserved));
    }

    #[test]
    fn one_row_node_takes_only_one_row_jobs() {
        let mut t = table("NO", 1);
        occupy(&mut t, 0, NodeState::OneRow, 0);
        assert!(state_allows(&t, 0, NodeState::OneRow));
        assert!(!state_allows(&t, 0, NodeState::Available));
        assert!(!state_allows(&t, 0, NodeState::Reserved));
    }

    #[test]
    fn sharing_node_refuses_one_row_jobs() {
        let mut t = table("YES", 2);
        occupy(&mut t, 0, NodeState::Available, 0);
        assert!(t.is_sharing(0));
        assert!(state_allows(&t, 0, NodeState::Available));
        assert!(!state_allows(&t, 0, NodeState::OneRow));
        assert!(!state_allows(&t, 0, NodeState::Reserved));
    }
}
