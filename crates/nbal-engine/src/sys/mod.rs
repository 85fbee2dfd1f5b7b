//! The seam between the balancing engine and the operating system.
//!
//! Every native facility the engine consumes — topology discovery, the
//! process/thread enumeration buffer, performance counters, and affinity
//! get/set — goes through [`SystemServices`]. The engine itself never makes
//! an OS call directly, which keeps the sampler, collector, and planner
//! testable against in-memory mocks.
//!
//! The optional process-level affinity capability is modeled as a presence
//! flag resolved once at startup ([`SystemServices::supports_process_affinity`]),
//! not as a null check at each call site.

#[cfg(windows)]
pub mod windows;

use nbal_core::error::BalancerError;
use nbal_core::types::{GroupAffinity, NumaNode};

/// Outcome of filling the process-enumeration buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    /// The buffer now holds `len` bytes of process records. `base` is the
    /// virtual address the buffer occupied when the OS filled it; embedded
    /// name pointers are absolute and must be rebased against it.
    Filled { len: usize, base: u64 },
    /// The buffer was too small. The sampler grows it and retries; this is
    /// not an error.
    TooSmall,
}

/// An open performance-counter query.
///
/// One poll returns one slot per registered counter, in registration order.
/// A slot is `None` when that counter's read failed this tick — the other
/// counters are unaffected.
pub trait CounterQuery: Send + 'static {
    fn poll(&mut self) -> Result<Vec<Option<f64>>, BalancerError>;
}

/// All native OS facilities consumed by the engine.
pub trait SystemServices {
    type Counters: CounterQuery;

    /// Query the NUMA topology once. Order is OS-reported, not sorted.
    fn numa_topology(&self) -> Result<Vec<NumaNode>, BalancerError>;

    /// Fill `buf` with the variable-length process/thread records.
    fn fill_process_snapshot(&self, buf: &mut [u8]) -> Result<FillOutcome, BalancerError>;

    /// Open a counter query for the given counter names.
    fn open_counters(&self, names: &[String]) -> Result<Self::Counters, BalancerError>;

    /// Current group affinity of a thread, via a short-lived handle.
    fn thread_affinity(&self, tid: u32) -> Result<GroupAffinity, BalancerError>;

    /// Retarget a thread to the given group/mask.
    fn set_thread_affinity(&self, tid: u32, affinity: &GroupAffinity)
    -> Result<(), BalancerError>;

    /// Scheduling groups a process currently spans.
    fn process_groups(&self, pid: u32) -> Result<Vec<u16>, BalancerError>;

    /// Retarget a whole process to the given group/mask. Only valid when
    /// [`SystemServices::supports_process_affinity`] is `true`.
    fn set_process_affinity(
        &self,
        pid: u32,
        affinity: &GroupAffinity,
    ) -> Result<(), BalancerError>;

    /// Whether the process-level affinity capability resolved at startup.
    fn supports_process_affinity(&self) -> bool;

    /// Enable the debug privilege on our own token so handle opens on
    /// foreign processes stop failing with access-denied.
    fn enable_debug_privilege(&self) -> Result<(), BalancerError>;
}
