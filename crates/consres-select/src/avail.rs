//! Available-procs: how many CPUs a node can give one job, given what is
//! free on it and the job's multi-core constraints.

use consres_core::{MemoryRequest, MultiCoreSpec, NodeHardware, ResourceUnit};

/// Threads per core the job may use on this hardware. Zero means the job's
/// minimum cannot be met.
pub fn threads_per_core(hw: &NodeHardware, mc: &MultiCoreSpec) -> u16 {
    if mc.min_threads > hw.threads {
        return 0;
    }
    let mut threads = hw.threads;
    if mc.max_threads > 0 {
        threads = threads.min(mc.max_threads);
    }
    if mc.ntasks_per_core > 0 {
        let per_core = u32::from(mc.ntasks_per_core) * u32::from(mc.cpus_per_task());
        threads = threads.min(per_core.min(u32::from(u16::MAX)) as u16);
    }
    threads
}

/// CPUs a job could be given from `free`.
///
/// `free` is what [`NodeTable::free_cores`](crate::node_table::NodeTable::free_cores)
/// returns: one entry of free CPUs at CPU granularity, otherwise free cores
/// per socket. The result is a whole number of tasks times `cpus_per_task`.
pub fn available_cpus(hw: &NodeHardware, free: &[u16], unit: ResourceUnit, mc: &MultiCoreSpec) -> u16 {
    let cpt = u32::from(mc.cpus_per_task());

    let cpus = match unit {
        ResourceUnit::Cpu | ResourceUnit::MemoryOnly => {
            u32::from(free.first().copied().unwrap_or(0))
        }
        ResourceUnit::Core | ResourceUnit::Socket => {
            let threads = u32::from(threads_per_core(hw, mc));
            if threads == 0 {
                return 0;
            }
            let mut usable: Vec<u32> = free
                .iter()
                .map(|&f| u32::from(f))
                .filter(|&f| f > 0 && f >= u32::from(mc.min_cores))
                .map(|f| match mc.max_cores {
                    0 => f,
                    max => f.min(u32::from(max)),
                })
                .collect();
            if usable.len() < usize::from(mc.min_sockets) {
                return 0;
            }
            if mc.max_sockets > 0 {
                usable.truncate(usize::from(mc.max_sockets));
            }
            usable
                .iter()
                .map(|cores| {
                    let socket_cpus = cores * threads;
                    match mc.ntasks_per_socket {
                        0 => socket_cpus,
                        n => (socket_cpus / cpt).min(u32::from(n)) * cpt,
                    }
                })
                .sum()
        }
    };

    let mut tasks = cpus / cpt;
    if mc.ntasks_per_node > 0 {
        let per_node = u32::from(mc.ntasks_per_node);
        if tasks < per_node {
            return 0;
        }
        tasks = per_node;
    }
    (tasks * cpt).min(u32::from(hw.cpus)) as u16
}

/// Cap `avail` by per-CPU memory demand, keeping whole tasks.
pub fn cap_by_memory(avail: u16, free_memory: u32, memory: MemoryRequest, cpus_per_task: u16) -> u16 {
    let MemoryRequest::PerCpu(mb) = memory else {
        return avail;
    };
    if mb == 0 {
        return avail;
    }
    let cpt = cpus_per_task.max(1);
    let fit = (free_memory / mb).min(u32::from(avail)) as u16;
    fit - fit % cpt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw(sockets: u16, cores: u16, threads: u16) -> NodeHardware {
        NodeHardware {
            name: "n0".into(),
            cpus: sockets * cores * threads,
            sockets,
            cores,
            threads,
            real_memory: 8192,
        }
    }

    #[test]
    fn cpu_granularity_counts_tasks() {
        let mc = MultiCoreSpec {
            cpus_per_task: 3,
            ..Default::default()
        };
        assert_eq!(available_cpus(&hw(1, 8, 1), &[7], ResourceUnit::Cpu, &mc), 6);
    }

    #[test]
    fn core_granularity_multiplies_threads() {
        let mc = MultiCoreSpec::default();
        assert_eq!(available_cpus(&hw(2, 2, 2), &[2, 1], ResourceUnit::Core, &mc), 6);

        let one_thread = MultiCoreSpec {
            max_threads: 1,
            ..Default::default()
        };
        assert_eq!(available_cpus(&hw(2, 2, 2), &[2, 1], ResourceUnit::Core, &one_thread), 3);
    }

    #[test]
    fn socket_filters_apply() {
        let min_cores = MultiCoreSpec {
            min_cores: 2,
            ..Default::default()
        };
        assert_eq!(available_cpus(&hw(2, 2, 1), &[2, 1], ResourceUnit::Core, &min_cores), 2);

        let two_sockets = MultiCoreSpec {
            min_sockets: 2,
            min_cores: 2,
            ..Default::default()
        };
        assert_eq!(available_cpus(&hw(2, 2, 1), &[2, 1], ResourceUnit::Core, &two_sockets), 0);

        let one_socket = MultiCoreSpec {
            max_sockets: 1,
            ..Default::default()
        };
        assert_eq!(available_cpus(&hw(2, 4, 1), &[3, 4], ResourceUnit::Core, &one_socket), 3);
    }

    #[test]
    fn tasks_per_node_is_a_floor_and_a_cap() {
        let mc = MultiCoreSpec {
            ntasks_per_node: 2,
            ..Default::default()
        };
        assert_eq!(available_cpus(&hw(2, 2, 1), &[2, 2], ResourceUnit::Core, &mc), 2);
        assert_eq!(available_cpus(&hw(2, 2, 1), &[1, 0], ResourceUnit::Core, &mc), 0);
    }

    #[test]
    fn tasks_per_socket_caps_each_socket() {
        let mc = MultiCoreSpec {
            ntasks_per_socket: 1,
            ..Default::default()
        };
        assert_eq!(available_cpus(&hw(2, 4, 1), &[4, 4], ResourceUnit::Core, &mc), 2);
    }

    #[test]
    fn min_threads_above_hardware_blocks() {
        let mc = MultiCoreSpec {
            min_threads: 2,
            ..Default::default()
        };
        assert_eq!(threads_per_core(&hw(1, 4, 1), &mc), 0);
        assert_eq!(available_cpus(&hw(1, 4, 1), &[4], ResourceUnit::Core, &mc), 0);
    }

    #[test]
    fn memory_cap_keeps_whole_tasks() {
        assert_eq!(cap_by_memory(8, 2500, MemoryRequest::PerCpu(500), 2), 4);
        assert_eq!(cap_by_memory(8, 2500, MemoryRequest::PerNode(500), 2), 8);
        assert_eq!(cap_by_memory(3, 100_000, MemoryRequest::PerCpu(1), 1), 3);
    }
}
