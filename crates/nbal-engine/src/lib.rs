//! # nbal-engine
//!
//! The sampling and rebalancing engine for the NUMA load balancer:
//!
//! - **Snapshot decoding** (`snapshot`) — bounds-checked walk of the OS
//!   process-enumeration buffer
//! - **Process sampling** (`sampler`) — per-cycle enumeration + rolling
//!   CPU-delta tracking
//! - **Counter collection** (`counters`) — background 1-second sampling of
//!   total and per-domain CPU utilization
//! - **Placement** (`planner`) — imbalance trigger + round-robin affinity
//!   assignment
//! - **Topology** (`topology`) — one-shot NUMA domain discovery
//! - **OS seam** (`sys`) — the trait boundary to the native interfaces,
//!   with the Windows backend behind `cfg(windows)`
//!
//! [`Balancer`] ties the pieces together for the driver: construct it once,
//! then call [`Balancer::read`] and [`Balancer::set_affinity`] at the
//! configured cadence while the counter loop runs underneath.

pub mod counters;
pub mod planner;
pub mod sampler;
pub mod snapshot;
pub mod sys;
pub mod topology;

#[cfg(test)]
pub(crate) mod testutil;

use std::fmt::Write as _;

use nbal_core::config::Settings;
use nbal_core::types::NumaNode;
use tracing::{debug, info, trace, warn};

use counters::CounterCollector;
use planner::AffinityPlanner;
use sampler::ProcessSampler;
use sys::SystemServices;

/// Engine tunables, usually sourced from [`Settings`].
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Averaging window in seconds.
    pub analysis_period: u64,
    /// Rebalance cadence in seconds.
    pub switching_frequency: u64,
    /// Busiest-domain threshold (percent).
    pub maximum_cpu_value: f64,
    /// Busiest-to-idlest spread threshold (percentage points).
    pub delta_cpu_values: f64,
    /// Diagnostic: re-apply affinity even when it already matches.
    pub force_reapply: bool,
}

impl From<&Settings> for BalancerConfig {
    fn from(s: &Settings) -> Self {
        Self {
            analysis_period: s.analysis_period,
            switching_frequency: s.switching_frequency,
            maximum_cpu_value: s.maximum_cpu_value,
            delta_cpu_values: s.delta_cpu_values,
            force_reapply: false,
        }
    }
}

/// The assembled engine: topology, sampler, collector, and planner behind
/// one handle owned by the driver thread.
pub struct Balancer<S: SystemServices> {
    sys: S,
    nodes: Vec<NumaNode>,
    sampler: ProcessSampler,
    planner: AffinityPlanner,
    collector: CounterCollector,
}

impl<S: SystemServices> Balancer<S> {
    /// Discover topology, register and start the counter loop, and set up
    /// the sampler and planner.
    pub fn new(sys: S, config: &BalancerConfig) -> Self {
        let nodes = topology::discover(&sys);

        let mut collector = CounterCollector::new();
        collector.configure(&sys, &nodes, config.analysis_period as usize);
        collector.start();

        if !sys.supports_process_affinity() {
            // Logged once here; the planner silently skips process-level
            // calls from now on.
            warn!("process-level affinity capability unavailable; only threads will be moved");
        }

        let delta_window =
            (config.analysis_period / config.switching_frequency.max(1)) as usize;
        Self {
            sys,
            nodes,
            sampler: ProcessSampler::new(delta_window),
            planner: AffinityPlanner::new(
                config.maximum_cpu_value,
                config.delta_cpu_values,
                config.force_reapply,
            ),
            collector,
        }
    }

    /// Add an image name to the allow-list. No filter tracks everything.
    pub fn add_filter(&mut self, process_name: impl Into<String>) -> &mut Self {
        self.sampler.add_filter(process_name);
        self
    }

    /// The per-cycle sampling step.
    pub fn read(&mut self) {
        self.sampler.read(&self.sys);
    }

    /// The per-cycle placement step: evaluate the trigger over the counter
    /// averages and, when load is skewed, run a placement pass.
    pub fn set_affinity(&mut self) {
        if self.nodes.is_empty() {
            return;
        }

        let avgs = self.collector.get_averages();
        if avgs.is_empty() {
            trace!("counter collection disabled; skipping placement");
            return;
        }
        let Some(values) = avgs.into_iter().collect::<Option<Vec<f64>>>() else {
            debug!("counters still warming up; skipping placement");
            return;
        };
        trace!("counter averages: {values:?}");

        if !self.planner.is_need_to_set_affinity(&values) {
            trace!("load within thresholds; no rebalance");
            return;
        }

        info!("sustained imbalance detected; rebalancing");
        self.planner.set_affinity(&self.sys, &self.nodes, self.sampler.tracked());
    }

    /// Human-readable dump of the topology and tracked process state.
    pub fn status_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Numa nodes:");
        for node in &self.nodes {
            let _ = writeln!(out, "  node={};group={};mask={:#x}", node.node, node.group, node.mask);
        }

        let mut records: Vec<_> = self.sampler.tracked().values().collect();
        records.sort_by(|a, b| {
            b.avg.avg().unwrap_or(0.0).total_cmp(&a.avg.avg().unwrap_or(0.0))
        });

        let _ = writeln!(out, "Tracked processes:");
        for r in records {
            let _ = writeln!(
                out,
                "  pid={};name={};create time={};user time={};kernel time={};threads={};handles={};numa={:?}",
                r.pid,
                r.name,
                r.create_time,
                r.user_time,
                r.kernel_time,
                r.threads.len(),
                r.handle_count,
                r.groups
            );
        }
        out
    }

    /// NUMA nodes in discovery order.
    pub fn nodes(&self) -> &[NumaNode] {
        &self.nodes
    }

    /// Stop the counter loop; blocks until it has exited.
    pub fn shutdown(&mut self) {
        self.collector.stop();
    }

    #[cfg(test)]
    pub(crate) fn collector(&self) -> &CounterCollector {
        &self.collector
    }
}
