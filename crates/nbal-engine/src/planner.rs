//! Imbalance detection and round-robin affinity placement.
//!
//! The planner decides *whether* to rebalance from the collector's warmed-up
//! per-domain averages, and *where* to put each of the busiest processes by
//! cycling a cursor over the NUMA node list. Advancing the cursor after
//! every candidate spreads them across all domains, not only between the
//! most and least loaded ones.
//!
//! Every per-process and per-thread affinity change is attempted and logged
//! independently; one failed OS call never aborts the pass.

use ahash::AHashMap;

use nbal_core::types::NumaNode;
use tracing::{error, info, trace};

use crate::sampler::{ProcessRecord, ThreadRecord};
use crate::sys::SystemServices;

/// Decides when to rebalance and issues the affinity changes.
pub struct AffinityPlanner {
    maximum_cpu_value: f64,
    delta_cpu_values: f64,
    /// Re-apply affinity even when current and target already match.
    /// Diagnostic aid, off in production.
    force_reapply: bool,
}

impl AffinityPlanner {
    pub fn new(maximum_cpu_value: f64, delta_cpu_values: f64, force_reapply: bool) -> Self {
        Self { maximum_cpu_value, delta_cpu_values, force_reapply }
    }

    /// Trigger test over the collector averages.
    ///
    /// `avgs[0]` is total utilization and is ignored; the decision looks at
    /// the per-domain entries only: rebalance iff the busiest domain exceeds
    /// `maximum_cpu_value` and the busiest-to-idlest spread exceeds
    /// `delta_cpu_values`.
    pub fn is_need_to_set_affinity(&self, avgs: &[f64]) -> bool {
        let Some(domains) = avgs.get(1..) else { return false };
        if domains.len() < 2 {
            return false;
        }
        let max = domains.iter().copied().fold(f64::MIN, f64::max);
        let min = domains.iter().copied().fold(f64::MAX, f64::min);
        max > self.maximum_cpu_value && (max - min) > self.delta_cpu_values
    }

    /// One placement pass over the eligible candidates.
    ///
    /// Eligible are tracked processes with a fully warmed-up delta window,
    /// visited in descending order of windowed average. The trigger test is
    /// the caller's responsibility.
    pub fn set_affinity<S: SystemServices>(
        &self,
        sys: &S,
        nodes: &[NumaNode],
        tracked: &AHashMap<u32, ProcessRecord>,
    ) {
        if nodes.is_empty() {
            return;
        }

        let mut candidates: Vec<&ProcessRecord> =
            tracked.values().filter(|r| r.avg.is_warm()).collect();
        candidates.sort_by(|a, b| {
            let a = a.avg.avg().unwrap_or(0.0);
            let b = b.avg.avg().unwrap_or(0.0);
            b.total_cmp(&a)
        });
        trace!("{} eligible rebalance candidates", candidates.len());

        let mut cursor: Option<usize> = None;
        for record in candidates {
            if cursor.is_none() {
                cursor = match self.seed_cursor(record, nodes) {
                    Some(idx) => Some(idx),
                    // Without any domain data there is nothing to place
                    // against; the rest of the pass cannot proceed either.
                    None => {
                        error!(
                            "no scheduling-group data for {};pid={}; affinity pass aborted",
                            record.name, record.pid
                        );
                        return;
                    }
                };
            }
            let idx = cursor.unwrap_or(0);
            let target = &nodes[idx];

            self.place_process(sys, record, target);
            self.place_threads(sys, record, target);

            // Wrap after the last node so successive candidates spread over
            // every domain.
            cursor = Some((idx + 1) % nodes.len());
        }
    }

    /// Initial cursor position, derived from the first candidate.
    fn seed_cursor(&self, record: &ProcessRecord, nodes: &[NumaNode]) -> Option<usize> {
        match record.groups.as_slice() {
            [] => None,
            [only] => nodes
                .iter()
                .position(|n| n.group == *only)
                .or_else(|| Some(calculate_numa_weight(&record.threads, nodes))),
            _ => Some(calculate_numa_weight(&record.threads, nodes)),
        }
    }

    /// Process-level placement: issued when the process spans several
    /// domains or sits on a different one than the target.
    fn place_process<S: SystemServices>(
        &self,
        sys: &S,
        record: &ProcessRecord,
        target: &NumaNode,
    ) {
        let off_target =
            record.groups.len() != 1 || record.groups.first() != Some(&target.group);
        if !(off_target || self.force_reapply) {
            info!("{};pid={};numa={:?}", record.name, record.pid, record.groups);
            return;
        }
        if !sys.supports_process_affinity() {
            // Capability absence was logged once at startup.
            return;
        }
        match sys.set_process_affinity(record.pid, &target.affinity()) {
            Ok(()) => info!(
                "{};pid={};numa={:?};new numa=[{}]",
                record.name, record.pid, record.groups, target.group
            ),
            Err(e) => error!(
                "{};pid={};numa={:?};new numa=[{}];error={e}",
                record.name, record.pid, record.groups, target.group
            ),
        }
    }

    /// Thread-level placement: every thread off the target domain gets its
    /// own set call; each outcome is logged on its own.
    fn place_threads<S: SystemServices>(
        &self,
        sys: &S,
        record: &ProcessRecord,
        target: &NumaNode,
    ) {
        let mut any_moved = false;
        for thread in &record.threads {
            if thread.affinity.group == target.group && !self.force_reapply {
                continue;
            }
            any_moved = true;
            match sys.set_thread_affinity(thread.tid, &target.affinity()) {
                Ok(()) => info!(
                    "{};pid={};tid={};numa=[{}];new numa=[{}]",
                    record.name, record.pid, thread.tid, thread.affinity.group, target.group
                ),
                Err(e) => error!(
                    "{};pid={};tid={};numa=[{}];new numa=[{}];error={e}",
                    record.name, record.pid, thread.tid, thread.affinity.group, target.group
                ),
            }
        }
        if !any_moved {
            info!("{};pid={};no threads for new numa", record.name, record.pid);
        }
    }
}

/// Pick a domain for a process spanning several of them by counting its
/// threads per domain.
///
/// The reference count starts at zero, so a domain is selected only when its
/// thread count is strictly smaller than everything seen before; when no
/// domain wins, the first domain in topology order is used. This
/// first-domain default is long-standing placement behavior and is kept
/// as-is.
pub fn calculate_numa_weight(threads: &[ThreadRecord], nodes: &[NumaNode]) -> usize {
    let mut counts = vec![0u32; nodes.len()];
    for thread in threads {
        if let Some(pos) = nodes.iter().position(|n| n.group == thread.affinity.group) {
            counts[pos] += 1;
        }
    }

    let mut reference = 0u32;
    let mut winner: Option<usize> = None;
    for (i, &count) in counts.iter().enumerate() {
        if reference > count {
            winner = Some(i);
            reference = count;
        }
    }
    winner.unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockSystem;
    use nbal_core::ring::RollingAverage;
    use nbal_core::types::{GroupAffinity, ThreadState, WaitReason};

    fn planner() -> AffinityPlanner {
        AffinityPlanner::new(70.0, 30.0, false)
    }

    fn record(pid: u32, avg_value: f64, window: usize, groups: &[u16], tids_on: &[(u32, u16)]) -> ProcessRecord {
        let mut avg = RollingAverage::new(window);
        for _ in 0..window {
            avg.add(avg_value);
        }
        ProcessRecord {
            pid,
            name: format!("proc{pid}.exe"),
            create_time: 0,
            user_time: 0,
            kernel_time: 0,
            handle_count: 0,
            avg,
            threads: tids_on
                .iter()
                .map(|&(tid, group)| ThreadRecord {
                    tid,
                    state: ThreadState::Waiting,
                    wait_reason: WaitReason(6),
                    affinity: GroupAffinity { group, mask: 0xff },
                })
                .collect(),
            groups: groups.to_vec(),
        }
    }

    #[test]
    fn trigger_thresholds() {
        let p = AffinityPlanner::new(70.0, 30.0, false);
        assert!(p.is_need_to_set_affinity(&[50.0, 10.0, 90.0]));
        assert!(!p.is_need_to_set_affinity(&[50.0, 60.0, 65.0])); // max not above 70

        let p = AffinityPlanner::new(70.0, 90.0, false);
        assert!(!p.is_need_to_set_affinity(&[50.0, 10.0, 95.0])); // delta not above 90
    }

    #[test]
    fn trigger_needs_two_domains() {
        let p = planner();
        assert!(!p.is_need_to_set_affinity(&[]));
        assert!(!p.is_need_to_set_affinity(&[50.0]));
        assert!(!p.is_need_to_set_affinity(&[50.0, 99.0]));
    }

    #[test]
    fn weight_defaults_to_first_domain() {
        let nodes = [
            NumaNode { node: 0, group: 0, mask: 0xff },
            NumaNode { node: 1, group: 1, mask: 0xff },
        ];
        // Balanced spread: no count is strictly below the zero reference.
        let rec = record(1, 0.0, 1, &[0, 1], &[(10, 0), (11, 1)]);
        assert_eq!(calculate_numa_weight(&rec.threads, &nodes), 0);
        // Everything on one domain still defaults to the first.
        let rec = record(1, 0.0, 1, &[0], &[(10, 0), (11, 0)]);
        assert_eq!(calculate_numa_weight(&rec.threads, &nodes), 0);
    }

    #[test]
    fn cursor_cycles_over_all_domains() {
        let sys = MockSystem::with_nodes(&[(0, 0), (1, 1), (2, 2)]);
        let p = planner();

        // Five candidates, descending averages, all spanning two domains so
        // every one gets a process-level call; threads all on group 0 seed
        // the weight calculation at the first domain.
        let mut tracked = AHashMap::new();
        for (i, avg) in [100.0, 80.0, 60.0, 40.0, 20.0].iter().enumerate() {
            let pid = (i + 1) as u32;
            tracked.insert(pid, record(pid, *avg, 2, &[0, 1], &[(pid * 10, 0)]));
        }

        p.set_affinity(&sys, &sys.nodes, &tracked);

        let groups: Vec<u16> = sys.recorded_proc_sets().iter().map(|&(_, g)| g).collect();
        assert_eq!(groups, vec![0, 1, 2, 0, 1]);
        let pids: Vec<u32> = sys.recorded_proc_sets().iter().map(|&(pid, _)| pid).collect();
        assert_eq!(pids, vec![1, 2, 3, 4, 5]); // busiest first
    }

    #[test]
    fn only_warm_candidates_are_placed() {
        let sys = MockSystem::with_nodes(&[(0, 0), (1, 1)]);
        let p = planner();

        let mut tracked = AHashMap::new();
        tracked.insert(1, record(1, 100.0, 2, &[0, 1], &[(10, 0)]));
        let mut cold = record(2, 50.0, 2, &[0, 1], &[(20, 0)]);
        cold.avg = RollingAverage::new(2);
        cold.avg.add(50.0); // one of two samples
        tracked.insert(2, cold);

        p.set_affinity(&sys, &sys.nodes, &tracked);

        let pids: Vec<u32> = sys.recorded_proc_sets().iter().map(|&(pid, _)| pid).collect();
        assert_eq!(pids, vec![1]);
    }

    #[test]
    fn missing_group_data_aborts_the_pass() {
        let sys = MockSystem::with_nodes(&[(0, 0), (1, 1)]);
        let p = planner();

        let mut tracked = AHashMap::new();
        tracked.insert(1, record(1, 100.0, 1, &[], &[]));
        tracked.insert(2, record(2, 50.0, 1, &[0], &[(20, 0)]));

        p.set_affinity(&sys, &sys.nodes, &tracked);

        assert!(sys.recorded_proc_sets().is_empty());
        assert!(sys.recorded_thread_sets().is_empty());
    }

    #[test]
    fn empty_topology_is_a_noop() {
        let sys = MockSystem::with_nodes(&[]);
        let p = planner();
        let mut tracked = AHashMap::new();
        tracked.insert(1, record(1, 100.0, 1, &[0], &[(10, 0)]));

        p.set_affinity(&sys, &sys.nodes, &tracked);
        assert!(sys.recorded_proc_sets().is_empty());
    }

    #[test]
    fn absent_capability_still_moves_threads() {
        let sys = MockSystem::with_nodes(&[(0, 0), (1, 1)]).without_process_affinity();
        let p = planner();

        let mut tracked = AHashMap::new();
        tracked.insert(1, record(1, 100.0, 1, &[0, 1], &[(10, 0), (11, 1)]));

        p.set_affinity(&sys, &sys.nodes, &tracked);

        // Spans two domains, so a process-level call would normally be
        // issued; with the capability absent only the thread moves happen.
        assert!(sys.recorded_proc_sets().is_empty());
        assert_eq!(sys.recorded_thread_sets(), vec![(11, 0)]);
    }

    #[test]
    fn four_processes_cycle_across_two_domains() {
        let sys = MockSystem::with_nodes(&[(0, 0), (1, 1)]);
        let p = planner();

        // All four sit on domain 0 with one thread each.
        let mut tracked = AHashMap::new();
        for (i, avg) in [100.0, 80.0, 60.0, 40.0].iter().enumerate() {
            let pid = (i + 1) as u32;
            tracked.insert(pid, record(pid, *avg, 2, &[0], &[(pid * 10, 0)]));
        }
        assert!(p.is_need_to_set_affinity(&[50.0, 10.0, 90.0]));

        p.set_affinity(&sys, &sys.nodes, &tracked);

        // Targets cycle 0,1,0,1 seeded from the first candidate's domain;
        // process-level calls are issued for the two that must move, and
        // their threads follow.
        assert_eq!(sys.recorded_proc_sets(), vec![(2, 1), (4, 1)]);
        assert_eq!(sys.recorded_thread_sets(), vec![(20, 1), (40, 1)]);
    }

    #[test]
    fn one_thread_failure_does_not_block_the_rest() {
        let mut sys = MockSystem::with_nodes(&[(0, 0), (1, 1)]);
        sys.failing_thread_sets.insert(11);
        let p = planner();

        let mut tracked = AHashMap::new();
        // Spans both domains; weight calculation targets domain 0, so both
        // group-1 threads need a move and one of them fails.
        tracked.insert(1, record(1, 100.0, 1, &[0, 1], &[(10, 0), (11, 1), (12, 1)]));

        p.set_affinity(&sys, &sys.nodes, &tracked);

        assert_eq!(sys.recorded_proc_sets(), vec![(1, 0)]);
        assert_eq!(sys.recorded_thread_sets(), vec![(12, 0)]); // tid 11 failed, 12 still placed
    }
}
