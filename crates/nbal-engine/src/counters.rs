//! Background CPU-utilization counter collection.
//!
//! One counter is registered for total CPU utilization plus one per NUMA
//! domain, in topology order. A dedicated thread polls all of them once per
//! second — independent of the much coarser rebalance cadence — and feeds
//! each sample into that counter's rolling window. The planner later reads
//! the warmed-up averages through [`CounterCollector::get_averages`].
//!
//! # Concurrency
//!
//! The rings are the only state shared between the collector thread and the
//! rebalance thread; both sides take the same mutex, so a reader never sees
//! a partially written sample. Shutdown is cooperative and synchronous:
//! [`CounterCollector::stop`] signals the loop and joins the thread before
//! returning, and the counter query is owned by the loop, so it is released
//! only after the last tick has finished with it.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, bounded};
use nbal_core::ring::RollingAverage;
use nbal_core::types::NumaNode;
use tracing::{debug, error, info, trace};

use crate::sys::{CounterQuery, SystemServices};

/// Interval between counter polls. Fixed; the configurable cadence belongs
/// to the rebalance cycle, not to collection.
const TICK: Duration = Duration::from_secs(1);

/// Counter path for total CPU utilization.
fn total_counter_name() -> String {
    r"\Processor Information(_Total)\% Processor Time".to_string()
}

/// Counter path for one NUMA domain's aggregate CPU utilization.
fn node_counter_name(node: &NumaNode) -> String {
    format!(r"\Processor Information({},_Total)\% Processor Time", node.node)
}

/// Samples total and per-domain CPU utilization on a 1-second tick.
pub struct CounterCollector {
    names: Vec<String>,
    rings: Arc<Mutex<Vec<RollingAverage>>>,
    /// Query staged by `configure`, handed to the loop by `start`.
    query: Option<Box<dyn CounterQuery>>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CounterCollector {
    pub fn new() -> Self {
        Self {
            names: Vec::new(),
            rings: Arc::new(Mutex::new(Vec::new())),
            query: None,
            stop_tx: None,
            handle: None,
        }
    }

    /// Register the counter set (total first, then one per node in topology
    /// order) and open the counter query.
    ///
    /// A failed open disables collection entirely — `get_averages` will
    /// return an empty vector from then on. There is no per-tick retry.
    pub fn configure<S: SystemServices>(
        &mut self,
        sys: &S,
        nodes: &[NumaNode],
        analysis_period_secs: usize,
    ) {
        let mut names = vec![total_counter_name()];
        names.extend(nodes.iter().map(node_counter_name));

        match sys.open_counters(&names) {
            Ok(query) => {
                let rings = names
                    .iter()
                    .map(|_| RollingAverage::new(analysis_period_secs))
                    .collect();
                *lock_rings(&self.rings) = rings;
                self.query = Some(Box::new(query));
                info!("registered {} CPU counters", names.len());
            }
            Err(e) => {
                error!("cannot open counter query, collection disabled: {e}");
            }
        }
        self.names = names;
    }

    /// Spawn the collection loop. No-op when `configure` failed.
    pub fn start(&mut self) {
        let Some(mut query) = self.query.take() else {
            return;
        };
        let rings = Arc::clone(&self.rings);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        self.stop_tx = Some(stop_tx);

        let handle = std::thread::Builder::new()
            .name("counter-collector".into())
            .spawn(move || {
                debug!("counter loop started");
                loop {
                    let tick_start = Instant::now();
                    match query.poll() {
                        Ok(values) => {
                            let mut rings = lock_rings(&rings);
                            for (ring, value) in rings.iter_mut().zip(values) {
                                // A failed individual read skips this tick's
                                // sample for that counter only.
                                if let Some(value) = value {
                                    ring.add(value);
                                }
                            }
                        }
                        Err(e) => trace!("counter poll failed: {e}"),
                    }

                    let wait = TICK.saturating_sub(tick_start.elapsed());
                    // Sleeping on the stop channel makes shutdown immediate
                    // instead of waiting out the remainder of the tick.
                    match stop_rx.recv_timeout(wait) {
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                debug!("counter loop exited");
            });

        match handle {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => {
                error!("cannot spawn counter thread: {e}");
                self.stop_tx = None;
            }
        }
    }

    /// Signal the loop and block until it has exited.
    ///
    /// After `stop` returns, no further sample is added to any ring and the
    /// counter query has been released.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("counter thread panicked");
            }
        }
    }

    /// Per-counter averages in registration order: `Some` only for counters
    /// whose window is fully warmed up. Empty when collection is disabled.
    pub fn get_averages(&self) -> Vec<Option<f64>> {
        lock_rings(&self.rings)
            .iter()
            .map(|ring| if ring.is_warm() { ring.avg() } else { None })
            .collect()
    }

    /// Registered counter names, in registration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[cfg(test)]
    pub(crate) fn rings_handle(&self) -> Arc<Mutex<Vec<RollingAverage>>> {
        Arc::clone(&self.rings)
    }
}

impl Default for CounterCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CounterCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Lock the ring set, recovering from a poisoned mutex — the rings hold
/// plain numeric state that stays consistent even if a holder panicked.
fn lock_rings(
    rings: &Arc<Mutex<Vec<RollingAverage>>>,
) -> std::sync::MutexGuard<'_, Vec<RollingAverage>> {
    rings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockSystem;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn counter_names_follow_topology_order() {
        let sys = MockSystem::with_nodes(&[(0, 0), (1, 1)]);
        let mut collector = CounterCollector::new();
        collector.configure(&sys, &sys.nodes, 5);

        assert_eq!(collector.names().len(), 3);
        assert!(collector.names()[0].contains("_Total"));
        assert!(collector.names()[1].contains("(0,_Total)"));
        assert!(collector.names()[2].contains("(1,_Total)"));
    }

    #[test]
    fn averages_gate_on_warmup() {
        let sys = MockSystem::with_nodes(&[(0, 0)]);
        let mut collector = CounterCollector::new();
        collector.configure(&sys, &sys.nodes, 3);

        {
            let rings = collector.rings_handle();
            let mut rings = rings.lock().unwrap();
            rings[0].add(50.0);
            rings[0].add(70.0);
            rings[1].add(10.0);
            rings[1].add(20.0);
            rings[1].add(30.0);
        }

        let avgs = collector.get_averages();
        assert_eq!(avgs.len(), 2);
        assert_eq!(avgs[0], None); // 2 of 3 samples, not warm
        assert_eq!(avgs[1], Some(20.0));
    }

    #[test]
    fn failed_open_disables_collection() {
        let sys = MockSystem::with_nodes(&[(0, 0)]).failing_counters();
        let mut collector = CounterCollector::new();
        collector.configure(&sys, &sys.nodes, 3);
        collector.start(); // must be a no-op

        assert!(collector.get_averages().is_empty());
        assert!(collector.handle.is_none());
        collector.stop();
    }

    #[test]
    fn stop_joins_and_freezes_rings() {
        let polls = Arc::new(AtomicUsize::new(0));
        let sys = MockSystem::with_nodes(&[(0, 0)])
            .counting_counters(Arc::clone(&polls))
            .with_counter_values(vec![Some(42.0), Some(7.0)]);
        let mut collector = CounterCollector::new();
        collector.configure(&sys, &sys.nodes, 10);
        collector.start();

        // First poll happens at loop entry.
        std::thread::sleep(Duration::from_millis(100));
        assert!(polls.load(Ordering::SeqCst) >= 1);

        collector.stop();
        let sizes_after_stop: Vec<usize> = {
            let rings = collector.rings_handle();
            let rings = rings.lock().unwrap();
            rings.iter().map(|r| r.len()).collect()
        };
        let polls_after_stop = polls.load(Ordering::SeqCst);
        assert!(sizes_after_stop.iter().all(|&s| s >= 1)); // samples landed before stop

        // Cross a full tick boundary; a straggling loop would poll again.
        std::thread::sleep(Duration::from_millis(1200));

        assert_eq!(polls.load(Ordering::SeqCst), polls_after_stop);
        let rings = collector.rings_handle();
        let rings = rings.lock().unwrap();
        let sizes_now: Vec<usize> = rings.iter().map(|r| r.len()).collect();
        assert_eq!(sizes_now, sizes_after_stop);
    }
}
