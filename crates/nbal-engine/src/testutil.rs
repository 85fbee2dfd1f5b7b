//! In-memory implementation of the OS seam for unit tests.
//!
//! `MockSystem` serves canned topology, snapshot buffers, counter values,
//! and affinity state, and records every affinity-set call so tests can
//! assert on the exact sequence the engine issued.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nbal_core::error::BalancerError;
use nbal_core::types::{GroupAffinity, NumaNode};

use crate::sys::{CounterQuery, FillOutcome, SystemServices};

pub(crate) struct MockCounterQuery {
    values: Vec<Option<f64>>,
    polls: Option<Arc<AtomicUsize>>,
}

impl CounterQuery for MockCounterQuery {
    fn poll(&mut self) -> Result<Vec<Option<f64>>, BalancerError> {
        if let Some(polls) = &self.polls {
            polls.fetch_add(1, Ordering::SeqCst);
        }
        Ok(self.values.clone())
    }
}

pub(crate) struct MockSystem {
    pub nodes: Vec<NumaNode>,
    pub topology_fails: bool,

    /// Snapshot buffers served in order; a fill pops the front once the
    /// caller's buffer is large enough.
    pub snapshots: Mutex<VecDeque<(Vec<u8>, u64)>>,
    /// Forces buffer-too-small until the caller's buffer reaches this size.
    pub min_fill_len: usize,

    counters_fail: bool,
    counter_values: Option<Vec<Option<f64>>>,
    poll_counter: Option<Arc<AtomicUsize>>,

    pub thread_affinities: Mutex<HashMap<u32, GroupAffinity>>,
    pub process_group_sets: Mutex<HashMap<u32, Vec<u16>>>,
    /// Threads whose queries fail with access-denied until escalation.
    pub denied_threads: Mutex<HashSet<u32>>,
    pub escalations: AtomicUsize,

    pub proc_sets: Mutex<Vec<(u32, u16)>>,
    pub thread_sets: Mutex<Vec<(u32, u16)>>,
    pub failing_thread_sets: HashSet<u32>,
    supports_proc_affinity: bool,
}

impl MockSystem {
    /// Build a mock with the given `(node, group)` topology; each node gets
    /// a full 8-processor mask.
    pub fn with_nodes(nodes: &[(u32, u16)]) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|&(node, group)| NumaNode { node, group, mask: 0xff })
                .collect(),
            topology_fails: false,
            snapshots: Mutex::new(VecDeque::new()),
            min_fill_len: 0,
            counters_fail: false,
            counter_values: None,
            poll_counter: None,
            thread_affinities: Mutex::new(HashMap::new()),
            process_group_sets: Mutex::new(HashMap::new()),
            denied_threads: Mutex::new(HashSet::new()),
            escalations: AtomicUsize::new(0),
            proc_sets: Mutex::new(Vec::new()),
            thread_sets: Mutex::new(Vec::new()),
            failing_thread_sets: HashSet::new(),
            supports_proc_affinity: true,
        }
    }

    pub fn failing_counters(mut self) -> Self {
        self.counters_fail = true;
        self
    }

    pub fn counting_counters(mut self, polls: Arc<AtomicUsize>) -> Self {
        self.poll_counter = Some(polls);
        self
    }

    /// Serve these values on every poll instead of the all-`None` default.
    pub fn with_counter_values(mut self, values: Vec<Option<f64>>) -> Self {
        self.counter_values = Some(values);
        self
    }

    pub fn without_process_affinity(mut self) -> Self {
        self.supports_proc_affinity = false;
        self
    }

    pub fn push_snapshot(&self, buf: Vec<u8>, base: u64) {
        self.snapshots.lock().unwrap().push_back((buf, base));
    }

    pub fn set_thread_location(&self, tid: u32, group: u16) {
        self.thread_affinities
            .lock()
            .unwrap()
            .insert(tid, GroupAffinity { group, mask: 0xff });
    }

    pub fn set_process_groups(&self, pid: u32, groups: &[u16]) {
        self.process_group_sets
            .lock()
            .unwrap()
            .insert(pid, groups.to_vec());
    }

    pub fn deny_thread(&self, tid: u32) {
        self.denied_threads.lock().unwrap().insert(tid);
    }

    pub fn recorded_proc_sets(&self) -> Vec<(u32, u16)> {
        self.proc_sets.lock().unwrap().clone()
    }

    pub fn recorded_thread_sets(&self) -> Vec<(u32, u16)> {
        self.thread_sets.lock().unwrap().clone()
    }
}

impl SystemServices for MockSystem {
    type Counters = MockCounterQuery;

    fn numa_topology(&self) -> Result<Vec<NumaNode>, BalancerError> {
        if self.topology_fails {
            return Err(BalancerError::Topology("mock topology failure".into()));
        }
        Ok(self.nodes.clone())
    }

    fn fill_process_snapshot(&self, buf: &mut [u8]) -> Result<FillOutcome, BalancerError> {
        let mut snapshots = self.snapshots.lock().unwrap();
        let Some((data, base)) = snapshots.front() else {
            return Err(BalancerError::Snapshot("no snapshot queued".into()));
        };
        if buf.len() < data.len().max(self.min_fill_len) {
            return Ok(FillOutcome::TooSmall);
        }
        buf[..data.len()].copy_from_slice(data);
        let outcome = FillOutcome::Filled { len: data.len(), base: *base };
        snapshots.pop_front();
        Ok(outcome)
    }

    fn open_counters(&self, names: &[String]) -> Result<Self::Counters, BalancerError> {
        if self.counters_fail {
            return Err(BalancerError::Counter("mock open failure".into()));
        }
        // All-`None` by default: a poll succeeds but adds no samples, so
        // tests drive the rings by hand without racing the collector thread.
        let values = self
            .counter_values
            .clone()
            .unwrap_or_else(|| names.iter().map(|_| None).collect());
        Ok(MockCounterQuery { values, polls: self.poll_counter.clone() })
    }

    fn thread_affinity(&self, tid: u32) -> Result<GroupAffinity, BalancerError> {
        if self.denied_threads.lock().unwrap().contains(&tid) {
            return Err(BalancerError::AccessDenied);
        }
        Ok(self
            .thread_affinities
            .lock()
            .unwrap()
            .get(&tid)
            .copied()
            .unwrap_or_default())
    }

    fn set_thread_affinity(
        &self,
        tid: u32,
        affinity: &GroupAffinity,
    ) -> Result<(), BalancerError> {
        if self.failing_thread_sets.contains(&tid) {
            return Err(BalancerError::Affinity(format!("mock failure for tid {tid}")));
        }
        self.thread_sets.lock().unwrap().push((tid, affinity.group));
        self.thread_affinities.lock().unwrap().insert(tid, *affinity);
        Ok(())
    }

    fn process_groups(&self, pid: u32) -> Result<Vec<u16>, BalancerError> {
        Ok(self
            .process_group_sets
            .lock()
            .unwrap()
            .get(&pid)
            .cloned()
            .unwrap_or_default())
    }

    fn set_process_affinity(
        &self,
        pid: u32,
        affinity: &GroupAffinity,
    ) -> Result<(), BalancerError> {
        self.proc_sets.lock().unwrap().push((pid, affinity.group));
        Ok(())
    }

    fn supports_process_affinity(&self) -> bool {
        self.supports_proc_affinity
    }

    fn enable_debug_privilege(&self) -> Result<(), BalancerError> {
        self.escalations.fetch_add(1, Ordering::SeqCst);
        self.denied_threads.lock().unwrap().clear();
        Ok(())
    }
}
