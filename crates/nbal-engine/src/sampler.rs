//! Per-cycle process enumeration and CPU-delta tracking.
//!
//! Each rebalance cycle, [`ProcessSampler::read`] takes a fresh snapshot of
//! all processes matching the name filter and merges it into the tracked
//! map: exited pids are dropped, surviving pids get the user-time delta
//! since the previous cycle added to their rolling window, and their thread
//! list is wholly replaced by the new observation. The planner later sorts
//! the warmed-up records by windowed average to find the busiest processes.
//!
//! Per-item OS failures (a thread handle that cannot be opened, a process
//! whose group set cannot be read) are logged and skipped; they never abort
//! the cycle. The first access-denied failure triggers a one-time
//! debug-privilege escalation of our own token followed by exactly one
//! retry of the failing query.

use ahash::AHashMap;
use std::collections::HashSet;

use nbal_core::error::BalancerError;
use nbal_core::ring::RollingAverage;
use nbal_core::types::{GroupAffinity, ThreadState, WaitReason};
use tracing::{debug, error, trace, warn};

use crate::snapshot::{ProcessEntry, SnapshotIter};
use crate::sys::{FillOutcome, SystemServices};

/// Starting size of the reusable enumeration buffer.
const INITIAL_BUF_LEN: usize = 64 * 1024;
/// Upper bound for buffer growth; a snapshot larger than this is refused.
const MAX_BUF_LEN: usize = 1 << 30;

/// A thread observation, wholly replaced each cycle.
#[derive(Debug, Clone, Copy)]
pub struct ThreadRecord {
    pub tid: u32,
    pub state: ThreadState,
    pub wait_reason: WaitReason,
    /// Current group affinity; default when the thread handle could not be
    /// opened.
    pub affinity: GroupAffinity,
}

/// A tracked process, keyed by pid, updated every cycle it stays visible.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    /// Creation timestamp in 100 ns units.
    pub create_time: u64,
    /// Last observed cumulative user-mode CPU time, 100 ns units.
    pub user_time: u64,
    pub kernel_time: u64,
    pub handle_count: u32,
    /// Window of per-cycle user-time deltas.
    pub avg: RollingAverage,
    pub threads: Vec<ThreadRecord>,
    /// Scheduling groups the process currently spans.
    pub groups: Vec<u16>,
}

/// One process as seen in a single snapshot, before merging.
#[derive(Debug, Clone)]
pub struct SampledProcess {
    pub name: String,
    pub create_time: u64,
    pub user_time: u64,
    pub kernel_time: u64,
    pub handle_count: u32,
    pub threads: Vec<ThreadRecord>,
    pub groups: Vec<u16>,
}

/// Enumerates matching processes and maintains their rolling CPU deltas.
pub struct ProcessSampler {
    filter: HashSet<String>,
    tracked: AHashMap<u32, ProcessRecord>,
    buf: Vec<u8>,
    delta_window: usize,
    escalated: bool,
}

impl ProcessSampler {
    /// `delta_window` is the number of per-cycle deltas averaged per process
    /// (analysis period divided by switching frequency).
    pub fn new(delta_window: usize) -> Self {
        Self {
            filter: HashSet::new(),
            tracked: AHashMap::new(),
            buf: vec![0u8; INITIAL_BUF_LEN],
            delta_window,
            escalated: false,
        }
    }

    /// Add an image name to the allow-list. No filter means every process
    /// is tracked.
    pub fn add_filter(&mut self, process_name: impl Into<String>) -> &mut Self {
        self.filter.insert(process_name.into());
        self
    }

    /// The tracked process map, for the planner.
    pub fn tracked(&self) -> &AHashMap<u32, ProcessRecord> {
        &self.tracked
    }

    /// Snapshot + merge. Per-item failures are logged and skipped; a failure
    /// to obtain or decode the snapshot buffer itself skips the whole cycle,
    /// and even that leaves the tracked state intact for the next one.
    pub fn read<S: SystemServices>(&mut self, sys: &S) {
        match self.snapshot(sys) {
            Ok(snapshot) => self.merge(snapshot),
            Err(e) => error!("process snapshot failed, cycle skipped: {e}"),
        }
    }

    /// Enumerate matching processes into a pid-keyed map.
    pub fn snapshot<S: SystemServices>(
        &mut self,
        sys: &S,
    ) -> Result<AHashMap<u32, SampledProcess>, BalancerError> {
        let (len, base) = self.fill_buffer(sys)?;

        let mut result = AHashMap::new();
        // The borrow checker will not let the iterator borrow `self.buf`
        // while affinity queries take `&mut self`, so decode fully first.
        let mut entries = Vec::new();
        for item in SnapshotIter::new(&self.buf[..len], base) {
            match item {
                Ok(entry) => {
                    if self.filter.is_empty() || self.filter.contains(&entry.name) {
                        entries.push(entry);
                    }
                }
                Err(e) => {
                    // A partial walk would make every process past the error
                    // point look exited, so the whole cycle is discarded and
                    // the tracked state carries over to the next one.
                    return Err(BalancerError::Snapshot(format!("decode stopped: {e}")));
                }
            }
        }

        for entry in entries {
            let sampled = self.sample_process(sys, entry);
            result.insert(sampled.0, sampled.1);
        }
        trace!("snapshot holds {} matching processes", result.len());
        Ok(result)
    }

    /// Fold a snapshot into the tracked map.
    ///
    /// Tracked pids absent from the snapshot are removed; every pid present
    /// gets its user-time delta added to the rolling window (a new pid's
    /// first delta is measured from zero).
    pub fn merge(&mut self, snapshot: AHashMap<u32, SampledProcess>) {
        self.tracked.retain(|pid, record| {
            let keep = snapshot.contains_key(pid);
            if !keep {
                debug!("process exited: {};pid={}", record.name, pid);
            }
            keep
        });

        for (pid, sampled) in snapshot {
            let record = self.tracked.entry(pid).or_insert_with(|| {
                debug!("tracking new process: {};pid={}", sampled.name, pid);
                ProcessRecord {
                    pid,
                    name: sampled.name.clone(),
                    create_time: sampled.create_time,
                    user_time: 0,
                    kernel_time: 0,
                    handle_count: 0,
                    avg: RollingAverage::new(self.delta_window),
                    threads: Vec::new(),
                    groups: Vec::new(),
                }
            });

            let delta = sampled.user_time.saturating_sub(record.user_time);
            record.avg.add(delta as f64);
            record.user_time = sampled.user_time;
            record.kernel_time = sampled.kernel_time;
            record.handle_count = sampled.handle_count;
            record.create_time = sampled.create_time;
            record.threads = sampled.threads;
            record.groups = sampled.groups;
        }
    }

    /// Fill the reusable buffer, doubling it on buffer-too-small.
    fn fill_buffer<S: SystemServices>(
        &mut self,
        sys: &S,
    ) -> Result<(usize, u64), BalancerError> {
        loop {
            match sys.fill_process_snapshot(&mut self.buf)? {
                FillOutcome::Filled { len, base } => return Ok((len, base)),
                FillOutcome::TooSmall => {
                    let grown = self.buf.len() * 2;
                    if grown > MAX_BUF_LEN {
                        return Err(BalancerError::Snapshot(format!(
                            "enumeration buffer would exceed {MAX_BUF_LEN} bytes"
                        )));
                    }
                    trace!("growing enumeration buffer to {grown} bytes");
                    self.buf.resize(grown, 0);
                }
            }
        }
    }

    /// Resolve thread affinities and the process group set for one decoded
    /// entry.
    fn sample_process<S: SystemServices>(
        &mut self,
        sys: &S,
        entry: ProcessEntry,
    ) -> (u32, SampledProcess) {
        let pid = entry.pid;

        let mut threads = Vec::with_capacity(entry.threads.len());
        for thr in &entry.threads {
            let affinity = match self.query_with_escalation(sys, |s| s.thread_affinity(thr.tid)) {
                Ok(affinity) => affinity,
                Err(e) => {
                    warn!("cannot query affinity of tid {}: {e}", thr.tid);
                    GroupAffinity::default()
                }
            };
            threads.push(ThreadRecord {
                tid: thr.tid,
                state: ThreadState::from_raw(thr.state),
                wait_reason: WaitReason(thr.wait_reason),
                affinity,
            });
        }

        let groups = match self.query_with_escalation(sys, |s| s.process_groups(pid)) {
            Ok(groups) => groups,
            Err(e) => {
                warn!("cannot query scheduling groups of pid {pid}: {e}");
                Vec::new()
            }
        };

        (
            pid,
            SampledProcess {
                name: entry.name,
                create_time: entry.create_time,
                user_time: entry.user_time,
                kernel_time: entry.kernel_time,
                handle_count: entry.handle_count,
                threads,
                groups,
            },
        )
    }

    /// Run a per-item query; on the first access-denied failure ever seen,
    /// escalate our own token once and retry that query exactly once.
    fn query_with_escalation<S, T>(
        &mut self,
        sys: &S,
        query: impl Fn(&S) -> Result<T, BalancerError>,
    ) -> Result<T, BalancerError>
    where
        S: SystemServices,
    {
        match query(sys) {
            Err(e) if e.is_access_denied() && !self.escalated => {
                self.escalated = true;
                match sys.enable_debug_privilege() {
                    Ok(()) => debug!("enabled debug privilege after access-denied"),
                    Err(esc) => warn!("privilege escalation failed: {esc}"),
                }
                query(sys)
            }
            other => other,
        }
    }
}
