//! Task distribution. Turns a selection into a job record: CPUs per node,
//! cores per socket, row offsets and memory.

use consres_core::{NodeState, ResourceUnit, SocketLayout};

use crate::avail::threads_per_core;
use crate::error::{SelectError, SelectResult};
use crate::job_table::{AppliedFlags, JobResources};
use crate::node_table::NodeTable;
use crate::select::{JobContext, Selection};

/// Populate a job record for `selection`.
pub fn build_job(table: &NodeTable, ctx: &JobContext, selection: &Selection) -> SelectResult<JobResources> {
    let hosts: Vec<usize> = selection.nodes.iter().collect();
    let cpt = ctx.multicore.cpus_per_task();
    let offered: Vec<u16> = selection
        .offered
        .iter()
        .map(|c| (*c).min(u32::from(u16::MAX)) as u16)
        .collect();

    let alloc_cpus: Vec<u16> = if ctx.class == NodeState::Reserved {
        hosts.iter().map(|i| table.node(*i).hw.cpus).collect()
    } else if let Some(layout) = &ctx.task_layout {
        layout_cpus(ctx, layout, &offered, cpt)?
    } else {
        cyclic_cpus(ctx, &offered, cpt)?
    };

    let granularity = table.granularity();
    let unit = granularity.unit();
    let mut node_offset = Vec::with_capacity(hosts.len());
    let mut alloc_cores = Vec::with_capacity(hosts.len());
    let mut alloc_memory = Vec::with_capacity(hosts.len());

    for (host, &i) in hosts.iter().enumerate() {
        let node = table.node(i);
        let row = selection.rows[host];
        let offset = node
            .part(ctx.partition)
            .map(|p| p.row_offset(row))
            .unwrap_or(0);
        node_offset.push(offset);

        if granularity.per_socket() {
            let free = table.free_cores(i, ctx.partition, row);
            let cores = if ctx.class == NodeState::Reserved {
                free
            } else {
                let threads = threads_per_core(&node.hw, &ctx.multicore).max(1);
                let needed = alloc_cpus[host].div_ceil(threads);
                place_cores(&free, needed, unit, ctx.dist.socket_layout()).ok_or_else(|| {
                    SelectError::Internal(format!(
                        "job {}: node {} has fewer free cores than selected",
                        ctx.job_id, node.hw.name
                    ))
                })?
            };
            alloc_cores.push(cores);
        }

        alloc_memory.push(if granularity.tracks_memory() {
            ctx.memory.for_cpus(u32::from(alloc_cpus[host]))
        } else {
            0
        });
    }

    Ok(JobResources {
        job_id: ctx.job_id,
        nprocs: ctx.num_procs,
        nhosts: hosts.len() as u32,
        node_req: ctx.class,
        partition: ctx.partition,
        node_bitmap: selection.nodes.clone(),
        cpus: offered,
        alloc_cpus,
        node_offset,
        alloc_memory,
        alloc_cores: granularity.per_socket().then_some(alloc_cores),
        applied: AppliedFlags::default(),
        steps: Default::default(),
    })
}

fn layout_cpus(ctx: &JobContext, layout: &[u16], offered: &[u16], cpt: u16) -> SelectResult<Vec<u16>> {
    let invalid = |reason: String| SelectError::InvalidLayout {
        job_id: ctx.job_id,
        reason,
    };
    if layout.len() != offered.len() {
        return Err(invalid(format!(
            "{} entries for {} nodes",
            layout.len(),
            offered.len()
        )));
    }
    layout
        .iter()
        .zip(offered)
        .enumerate()
        .map(|(host, (&tasks, &avail))| {
            let cpus = u32::from(tasks) * u32::from(cpt);
            if cpus > u32::from(avail) {
                return Err(invalid(format!("host {host} asks {cpus} cpus, {avail} available")));
            }
            Ok(cpus as u16)
        })
        .collect()
}

/// One task per node first, then round-robin until the job is covered.
fn cyclic_cpus(ctx: &JobContext, offered: &[u16], cpt: u16) -> SelectResult<Vec<u16>> {
    let mut alloc = vec![0u16; offered.len()];
    let mut remaining = i64::from(ctx.num_procs);
    loop {
        let mut progressed = false;
        for (cpus, &avail) in alloc.iter_mut().zip(offered) {
            if remaining <= 0 && *cpus > 0 {
                continue;
            }
            if *cpus + cpt > avail {
                continue;
            }
            *cpus += cpt;
            remaining -= i64::from(cpt);
            progressed = true;
        }
        if remaining <= 0 && alloc.iter().all(|c| *c > 0) {
            return Ok(alloc);
        }
        if !progressed {
            return Err(SelectError::Internal(format!(
                "job {}: selected nodes cannot hold {} cpus",
                ctx.job_id, ctx.num_procs
            )));
        }
    }
}

/// Draw `needed` cores from the free cores of each socket. At socket
/// granularity whole sockets are taken.
pub fn place_cores(free: &[u16], needed: u16, unit: ResourceUnit, layout: SocketLayout) -> Option<Vec<u16>> {
    let mut taken = vec![0u16; free.len()];
    let mut remaining = needed;

    if unit == ResourceUnit::Socket {
        for (t, &f) in taken.iter_mut().zip(free) {
            if remaining == 0 {
                break;
            }
            if f > 0 {
                *t = f;
                remaining = remaining.saturating_sub(f);
            }
        }
        return (remaining == 0).then_some(taken);
    }

    let per_pass = match layout {
        SocketLayout::Pack => u16::MAX,
        SocketLayout::RoundRobin => 1,
        SocketLayout::Plane(size) => size.max(1),
    };
    while remaining > 0 {
        let mut progressed = false;
        for (t, &f) in taken.iter_mut().zip(free) {
            if remaining == 0 {
                break;
            }
            let step = (f - *t).min(per_pass).min(remaining);
            if step > 0 {
                *t += step;
                remaining -= step;
                progressed = true;
            }
        }
        if !progressed {
            return None;
        }
    }
    Some(taken)
}
