//! Shared domain types: NUMA topology descriptors, scheduling affinity, and
//! thread diagnostics.
//!
//! The thread state and wait-reason tables mirror the values reported by the
//! OS thread enumeration interface. They are diagnostic only — the planner
//! never branches on them — but they make trace output readable.

use std::fmt;

// ---------------------------------------------------------------------------
// Affinity + topology
// ---------------------------------------------------------------------------

/// A scheduling group plus a bitmask of logical processors within it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupAffinity {
    pub group: u16,
    pub mask: u64,
}

impl fmt::Display for GroupAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group={};mask={:#x}", self.group, self.mask)
    }
}

/// One NUMA domain as reported by the topology interface.
///
/// The discovery order of the nodes defines the planner's round-robin
/// cycling order; the set is immutable after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumaNode {
    /// Domain id in OS-reported order.
    pub node: u32,
    /// Scheduling group backing this domain.
    pub group: u16,
    /// Processor affinity mask within the group.
    pub mask: u64,
}

impl NumaNode {
    /// The group/mask pair used when retargeting a process or thread here.
    pub fn affinity(&self) -> GroupAffinity {
        GroupAffinity { group: self.group, mask: self.mask }
    }
}

// ---------------------------------------------------------------------------
// Thread diagnostics
// ---------------------------------------------------------------------------

/// Scheduling state of a thread at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Initialized,
    Ready,
    Running,
    Standby,
    Terminated,
    Waiting,
    Transition,
    DeferredReady,
    /// A value outside the documented table; preserved numerically.
    Other(u32),
}

impl ThreadState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => ThreadState::Initialized,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            3 => ThreadState::Standby,
            4 => ThreadState::Terminated,
            5 => ThreadState::Waiting,
            6 => ThreadState::Transition,
            7 => ThreadState::DeferredReady,
            other => ThreadState::Other(other),
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadState::Initialized => write!(f, "Initialized"),
            ThreadState::Ready => write!(f, "Ready"),
            ThreadState::Running => write!(f, "Running"),
            ThreadState::Standby => write!(f, "Standby"),
            ThreadState::Terminated => write!(f, "Terminated"),
            ThreadState::Waiting => write!(f, "Waiting"),
            ThreadState::Transition => write!(f, "Transition"),
            ThreadState::DeferredReady => write!(f, "DeferredReady"),
            ThreadState::Other(raw) => write!(f, "{raw}"),
        }
    }
}

/// Why a non-running thread is waiting. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitReason(pub u32);

const WAIT_REASON_NAMES: [&str; 38] = [
    "Executive",
    "FreePage",
    "PageIn",
    "PoolAllocation",
    "DelayExecution",
    "Suspended",
    "UserRequest",
    "WrExecutive",
    "WrFreePage",
    "WrPageIn",
    "WrPoolAllocation",
    "WrDelayExecution",
    "WrSuspended",
    "WrUserRequest",
    "WrEventPair",
    "WrQueue",
    "WrLpcReceive",
    "WrLpcReply",
    "WrVirtualMemory",
    "WrPageOut",
    "WrRendezvous",
    "WrKeyedEvent",
    "WrTerminated",
    "WrProcessInSwap",
    "WrCpuRateControl",
    "WrCalloutStack",
    "WrKernel",
    "WrResource",
    "WrPushLock",
    "WrMutex",
    "WrQuantumEnd",
    "WrDispatchInt",
    "WrPreempted",
    "WrYieldExecution",
    "WrFastMutex",
    "WrGuardedMutex",
    "WrRundown",
    "MaximumWaitReason",
];

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match WAIT_REASON_NAMES.get(self.0 as usize) {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "{}", self.0),
        }
    }
}
