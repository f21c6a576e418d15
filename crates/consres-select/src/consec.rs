//! Consecutive-run node selector with a knapsack-style retry.
//!
//! The candidate bitmap is split into maximal runs of adjacent set bits.
//! Runs are consumed best-fit first until the CPU and node budgets are met.
//! When that greedy pass fails, low-capacity nodes are stripped one
//! threshold at a time and the pass is repeated.

use tracing::debug;

use consres_core::{NodeBitmap, NodeIndex, NodeLimits};

use crate::error::{SelectError, SelectResult};

/// Inputs of one selection pass.
#[derive(Debug, Clone, Copy)]
pub struct ConsecParams<'a> {
    pub num_procs: u32,
    pub limits: NodeLimits,
    pub required: &'a NodeBitmap,
    pub contiguous: bool,
}

#[derive(Debug, Clone)]
struct Run {
    start: NodeIndex,
    end: NodeIndex,
    cpus: i64,
    nodes: i64,
    first_req: Option<NodeIndex>,
}

/// Whether `avail` more nodes cover what is still needed.
fn enough_nodes(avail: i64, rem: i64, min: i64, req: i64) -> bool {
    let needed = if req > min { rem + min - req } else { rem };
    avail >= needed
}

/// One greedy pass. `map` holds the candidates on entry and the selection
/// on success; `counts[i]` is what node `i` can offer.
pub fn eval_nodes(map: &mut NodeBitmap, counts: &[u32], params: &ConsecParams<'_>) -> bool {
    let min_nodes = i64::from(params.limits.min);
    let req_nodes = i64::from(params.limits.req);
    let mut rem_cpus = i64::from(params.num_procs);
    let mut rem_nodes = min_nodes.max(req_nodes);
    let mut max_nodes = i64::from(params.limits.max);

    let mut runs: Vec<Run> = Vec::new();
    let mut current: Option<Run> = None;
    for i in 0..map.len() {
        if !map.test(i) {
            if let Some(run) = current.take() {
                runs.push(run);
            }
            continue;
        }
        let run = current.get_or_insert(Run {
            start: i,
            end: i,
            cpus: 0,
            nodes: 0,
            first_req: None,
        });
        run.end = i;
        let avail = i64::from(counts[i]);
        if params.required.test(i) && max_nodes > 0 {
            run.first_req.get_or_insert(i);
            rem_cpus -= avail;
            rem_nodes -= 1;
            max_nodes -= 1;
        } else {
            map.clear(i);
            run.cpus += avail;
            run.nodes += 1;
        }
    }
    if let Some(run) = current.take() {
        runs.push(run);
    }

    let has_required = !params.required.is_empty();
    let mut done = false;
    while !runs.is_empty() && max_nodes > 0 {
        let mut best: Option<(usize, bool)> = None;
        for (idx, run) in runs.iter().enumerate() {
            if run.nodes == 0 {
                continue;
            }
            if params.contiguous && has_required && run.first_req.is_none() {
                continue;
            }
            let sufficient =
                run.cpus >= rem_cpus && enough_nodes(run.nodes, rem_nodes, min_nodes, req_nodes);
            let better = match best {
                None => true,
                Some((b, b_sufficient)) => {
                    let b = &runs[b];
                    (b.first_req.is_none() && run.first_req.is_some())
                        || (sufficient && !b_sufficient)
                        || (sufficient && run.cpus < b.cpus)
                        || (!sufficient && run.cpus > b.cpus)
                }
            };
            if better {
                best = Some((idx, sufficient));
            }
            if params.contiguous
                && has_required
                && runs[idx + 1..].iter().any(|r| r.first_req.is_some())
            {
                // Required nodes span more than one run.
                best = None;
                break;
            }
        }
        let Some((idx, _)) = best else {
            break;
        };

        let run = runs[idx].clone();
        if params.contiguous
            && (run.cpus < rem_cpus || !enough_nodes(run.nodes, rem_nodes, min_nodes, req_nodes))
        {
            break;
        }

        let order: Vec<NodeIndex> = match run.first_req {
            Some(r) => (r..=run.end).chain((run.start..r).rev()).collect(),
            None => (run.start..=run.end).collect(),
        };
        for i in order {
            if max_nodes <= 0 || (rem_nodes <= 0 && rem_cpus <= 0) {
                break;
            }
            if map.test(i) {
                continue;
            }
            map.set(i);
            rem_nodes -= 1;
            max_nodes -= 1;
            rem_cpus -= i64::from(counts[i]);
        }

        if params.contiguous || (rem_nodes <= 0 && rem_cpus <= 0) {
            done = true;
            break;
        }
        runs[idx].cpus = 0;
        runs[idx].nodes = 0;
    }

    done || (rem_cpus <= 0 && enough_nodes(0, rem_nodes, min_nodes, req_nodes))
}

/// Choose nodes from `map` (in place) so that their `counts` cover
/// `num_procs` within the node limits.
pub fn select_nodes(map: &mut NodeBitmap, counts: &[u32], params: &ConsecParams<'_>) -> SelectResult<()> {
    let mut params = *params;
    params.limits.max = params.limits.max.min(params.num_procs.max(params.limits.min));

    let zero: Vec<NodeIndex> = map.iter().filter(|i| counts[*i] == 0).collect();
    for i in zero {
        if params.required.test(i) {
            return Err(SelectError::InfeasibleRequired { node: i });
        }
        map.clear(i);
    }
    if (map.count() as u32) < params.limits.min {
        return Err(SelectError::InfeasibleNow);
    }

    let mut orig = map.clone();
    if eval_nodes(map, counts, &params) {
        return Ok(());
    }

    let most = orig.iter().map(|i| counts[i]).max().unwrap_or(0);
    for count in 0..most {
        let strip: Vec<NodeIndex> = orig.iter().filter(|i| counts[*i] <= count).collect();
        if strip.is_empty() {
            continue;
        }
        for i in strip {
            if params.required.test(i) {
                return Err(SelectError::InfeasibleRequired { node: i });
            }
            orig.clear(i);
        }
        *map = orig.clone();
        if eval_nodes(map, counts, &params) {
            debug!(threshold = count, "knapsack retry succeeded");
            return Ok(());
        }
    }

    *map = NodeBitmap::new(map.len());
    Err(SelectError::InfeasibleNow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(num_procs: u32, limits: NodeLimits, required: &NodeBitmap) -> ConsecParams<'_> {
        ConsecParams {
            num_procs,
            limits,
            required,
            contiguous: false,
        }
    }

    fn picked(map: &NodeBitmap) -> Vec<usize> {
        map.iter().collect()
    }

    #[test]
    fn enough_nodes_accounts_for_desired_count() {
        assert!(enough_nodes(2, 2, 2, 2));
        assert!(!enough_nodes(1, 2, 2, 2));
        // Wanting 4 but needing only 2: two more nodes suffice out of 4.
        assert!(enough_nodes(2, 4, 2, 4));
    }

    #[test]
    fn first_sufficient_run_wins_left_to_right() {
        let none = NodeBitmap::new(6);
        let mut map = NodeBitmap::full(6);
        let counts = [2, 2, 2, 2, 2, 2];
        select_nodes(&mut map, &counts, &params(4, NodeLimits::new(1, 6, 1), &none)).unwrap();
        assert_eq!(picked(&map), vec![0, 1]);
    }

    #[test]
    fn tightest_sufficient_run_is_preferred() {
        let none = NodeBitmap::new(7);
        let mut map = NodeBitmap::from_indices(7, [0, 1, 2, 4, 5]);
        let counts = [4, 4, 4, 0, 4, 4, 0];
        select_nodes(&mut map, &counts, &params(8, NodeLimits::new(2, 2, 2), &none)).unwrap();
        assert_eq!(picked(&map), vec![4, 5]);
    }

    #[test]
    fn required_node_is_grown_outward() {
        let required = NodeBitmap::from_indices(6, [3]);
        let mut map = NodeBitmap::full(6);
        let counts = [1, 1, 1, 1, 1, 1];
        select_nodes(&mut map, &counts, &params(3, NodeLimits::new(3, 3, 3), &required)).unwrap();
        assert_eq!(picked(&map), vec![3, 4, 5]);
    }

    #[test]
    fn knapsack_strips_small_nodes() {
        let none = NodeBitmap::new(4);
        let mut map = NodeBitmap::full(4);
        let counts = [4, 4, 1, 4];
        select_nodes(&mut map, &counts, &params(12, NodeLimits::exactly(3), &none)).unwrap();
        assert_eq!(picked(&map), vec![0, 1, 3]);
    }

    #[test]
    fn knapsack_cannot_strip_required() {
        let required = NodeBitmap::from_indices(4, [2]);
        let mut map = NodeBitmap::full(4);
        let counts = [4, 4, 1, 4];
        let err = select_nodes(&mut map, &counts, &params(12, NodeLimits::exactly(3), &required))
            .unwrap_err();
        assert!(matches!(err, SelectError::InfeasibleRequired { node: 2 }));
    }

    #[test]
    fn contiguous_job_needs_one_hole() {
        let none = NodeBitmap::new(5);
        let mut map = NodeBitmap::from_indices(5, [0, 1, 3, 4]);
        let counts = [2, 2, 0, 2, 2];
        let p = ConsecParams {
            contiguous: true,
            ..params(6, NodeLimits::new(3, 3, 3), &none)
        };
        assert!(select_nodes(&mut map, &counts, &p).is_err());
    }

    #[test]
    fn not_enough_cpus_anywhere() {
        let none = NodeBitmap::new(3);
        let mut map = NodeBitmap::full(3);
        let err = select_nodes(&mut map, &[1, 1, 1], &params(5, NodeLimits::new(1, 3, 1), &none))
            .unwrap_err();
        assert!(matches!(err, SelectError::InfeasibleNow));
    }
}
