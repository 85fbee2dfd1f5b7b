//! Windows implementation of the OS seam.
//!
//! - Process enumeration: `NtQuerySystemInformation(SystemProcessInformation)`,
//!   resolved by name from ntdll at startup (it is not in the import tables).
//! - Topology: `GetLogicalProcessorInformationEx(RelationNumaNode)`.
//! - Thread affinity: `OpenThread` + `Get/SetThreadGroupAffinity` over
//!   short-lived handles.
//! - Process affinity: `GetProcessGroupAffinity` for queries;
//!   `NtSetInformationProcess` (information class 0x15, `GROUP_AFFINITY`
//!   payload) for sets. The latter is the optional capability — when the
//!   export cannot be resolved, process-level retargeting stays disabled for
//!   the life of the process.
//! - Counters: a PDH query polled by the collector loop.
//! - Escalation: `AdjustTokenPrivileges(SeDebugPrivilege)` on our own token.

use std::ffi::c_void;

use nbal_core::error::BalancerError;
use nbal_core::types::{GroupAffinity, NumaNode};
use tracing::warn;

use windows::Win32::Foundation::{
    CloseHandle, ERROR_ACCESS_DENIED, HANDLE, HMODULE, LUID,
};
use windows::Win32::Security::{
    AdjustTokenPrivileges, LUID_AND_ATTRIBUTES, LookupPrivilegeValueW, SE_DEBUG_NAME,
    SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
};
use windows::Win32::System::Kernel::GROUP_AFFINITY as WIN_GROUP_AFFINITY;
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Performance::{
    PDH_FMT_DOUBLE, PDH_FMT_COUNTERVALUE, PdhAddEnglishCounterW, PdhCloseQuery,
    PdhCollectQueryData, PdhGetFormattedCounterValue, PdhOpenQueryW,
};
use windows::Win32::System::SystemInformation::{
    GetLogicalProcessorInformationEx, RelationNumaNode,
    SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX,
};
use windows::Win32::System::Threading::{
    GetCurrentProcess, GetProcessGroupAffinity, GetThreadGroupAffinity, OpenProcess,
    OpenProcessToken, OpenThread, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ,
    SetThreadGroupAffinity, THREAD_QUERY_INFORMATION, THREAD_SET_INFORMATION,
};
use windows::core::{PCWSTR, w};

use super::{CounterQuery, FillOutcome, SystemServices};

/// `SystemProcessInformation` class for `NtQuerySystemInformation`.
const SYSTEM_PROCESS_INFORMATION_CLASS: u32 = 5;
/// The caller's buffer was too small for the current process set.
const STATUS_INFO_LENGTH_MISMATCH: i32 = 0xC000_0004_u32 as i32;
/// `NtSetInformationProcess` information class carrying a `GROUP_AFFINITY`.
const PROCESS_AFFINITY_INFORMATION_CLASS: u32 = 0x15;

type NtQuerySystemInformationFn =
    unsafe extern "system" fn(u32, *mut c_void, u32, *mut u32) -> i32;
type NtSetInformationProcessFn =
    unsafe extern "system" fn(HANDLE, u32, *const c_void, u32) -> i32;

/// Closes the wrapped handle on drop.
struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was opened by us and is closed exactly once.
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn map_win_error(e: windows::core::Error, context: &str) -> BalancerError {
    if e.code() == windows::core::HRESULT::from_win32(ERROR_ACCESS_DENIED.0) {
        BalancerError::AccessDenied
    } else {
        BalancerError::Os { code: e.code().0, context: context.to_string() }
    }
}

fn to_wide_nul(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// The production backend.
pub struct WindowsSystem {
    query_system_information: NtQuerySystemInformationFn,
    set_information_process: Option<NtSetInformationProcessFn>,
}

impl WindowsSystem {
    /// Resolve the ntdll entry points. `NtQuerySystemInformation` is
    /// required; `NtSetInformationProcess` is the optional process-affinity
    /// capability.
    pub fn new() -> Result<Self, BalancerError> {
        // SAFETY: ntdll is mapped into every process; the resolved pointers
        // stay valid for the process lifetime.
        unsafe {
            let ntdll: HMODULE = GetModuleHandleW(w!("ntdll.dll"))
                .map_err(|e| map_win_error(e, "GetModuleHandleW(ntdll)"))?;

            let query = GetProcAddress(ntdll, windows::core::s!("NtQuerySystemInformation"))
                .ok_or_else(|| {
                    BalancerError::Unsupported("NtQuerySystemInformation not found".into())
                })?;
            let query_system_information: NtQuerySystemInformationFn =
                std::mem::transmute(query);

            let set_information_process = GetProcAddress(
                ntdll,
                windows::core::s!("NtSetInformationProcess"),
            )
            .map(|f| std::mem::transmute::<_, NtSetInformationProcessFn>(f));

            Ok(Self { query_system_information, set_information_process })
        }
    }

    fn open_thread(&self, tid: u32) -> Result<OwnedHandle, BalancerError> {
        // SAFETY: plain handle open; ownership goes to the guard.
        let handle = unsafe {
            OpenThread(THREAD_QUERY_INFORMATION | THREAD_SET_INFORMATION, false, tid)
        }
        .map_err(|e| map_win_error(e, "OpenThread"))?;
        Ok(OwnedHandle(handle))
    }

    fn open_process(&self, pid: u32) -> Result<OwnedHandle, BalancerError> {
        // SAFETY: plain handle open; ownership goes to the guard.
        let handle =
            unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid) }
                .map_err(|e| map_win_error(e, "OpenProcess"))?;
        Ok(OwnedHandle(handle))
    }
}

impl SystemServices for WindowsSystem {
    type Counters = PdhCounterQuery;

    fn numa_topology(&self) -> Result<Vec<NumaNode>, BalancerError> {
        let mut len = 0u32;
        // SAFETY: size-query call; the expected failure is length mismatch.
        let _ = unsafe { GetLogicalProcessorInformationEx(RelationNumaNode, None, &mut len) };
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = vec![0u8; len as usize];
        // SAFETY: buffer is len bytes as requested by the size query.
        unsafe {
            GetLogicalProcessorInformationEx(
                RelationNumaNode,
                Some(buffer.as_mut_ptr() as *mut SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX),
                &mut len,
            )
        }
        .map_err(|e| map_win_error(e, "GetLogicalProcessorInformationEx"))?;

        let mut nodes = Vec::new();
        let mut offset = 0usize;
        while offset + std::mem::size_of::<u32>() * 2 <= len as usize {
            // SAFETY: offset stays within the filled region; each entry
            // declares its own size.
            let info = unsafe {
                &*(buffer.as_ptr().add(offset) as *const SYSTEM_LOGICAL_PROCESSOR_INFORMATION_EX)
            };
            if info.Size == 0 {
                break;
            }
            if info.Relationship == RelationNumaNode {
                // SAFETY: RelationNumaNode selects the NumaNode union arm;
                // the node's primary group mask sits in the inner union.
                let (node, group, mask) = unsafe {
                    let numa = &info.Anonymous.NumaNode;
                    let gm = numa.Anonymous.GroupMask;
                    (numa.NodeNumber, gm.Group, gm.Mask as u64)
                };
                nodes.push(NumaNode { node, group, mask });
            }
            offset += info.Size as usize;
        }
        Ok(nodes)
    }

    fn fill_process_snapshot(&self, buf: &mut [u8]) -> Result<FillOutcome, BalancerError> {
        let mut needed = 0u32;
        // SAFETY: buf is valid for buf.len() bytes; the call writes at most
        // that much and reports the used length.
        let status = unsafe {
            (self.query_system_information)(
                SYSTEM_PROCESS_INFORMATION_CLASS,
                buf.as_mut_ptr() as *mut c_void,
                buf.len() as u32,
                &mut needed,
            )
        };
        if status == STATUS_INFO_LENGTH_MISMATCH {
            return Ok(FillOutcome::TooSmall);
        }
        if status != 0 {
            return Err(BalancerError::Os {
                code: status,
                context: "NtQuerySystemInformation".to_string(),
            });
        }
        Ok(FillOutcome::Filled { len: needed as usize, base: buf.as_ptr() as u64 })
    }

    fn open_counters(&self, names: &[String]) -> Result<Self::Counters, BalancerError> {
        PdhCounterQuery::open(names)
    }

    fn thread_affinity(&self, tid: u32) -> Result<GroupAffinity, BalancerError> {
        let handle = self.open_thread(tid)?;
        let mut affinity = WIN_GROUP_AFFINITY::default();
        // SAFETY: handle is open with query access; affinity is out-only.
        unsafe { GetThreadGroupAffinity(handle.0, &mut affinity) }
            .map_err(|e| map_win_error(e, "GetThreadGroupAffinity"))?;
        Ok(GroupAffinity { group: affinity.Group, mask: affinity.Mask as u64 })
    }

    fn set_thread_affinity(
        &self,
        tid: u32,
        affinity: &GroupAffinity,
    ) -> Result<(), BalancerError> {
        let handle = self.open_thread(tid)?;
        let target = WIN_GROUP_AFFINITY {
            Mask: affinity.mask as usize,
            Group: affinity.group,
            ..Default::default()
        };
        // SAFETY: handle is open with set access; previous affinity is not
        // needed.
        unsafe { SetThreadGroupAffinity(handle.0, &target, None) }
            .map_err(|e| map_win_error(e, "SetThreadGroupAffinity"))?;
        Ok(())
    }

    fn process_groups(&self, pid: u32) -> Result<Vec<u16>, BalancerError> {
        let handle = self.open_process(pid)?;
        let mut groups = vec![0u16; 128];
        let mut count = groups.len() as u16;
        // SAFETY: the array length is passed alongside the pointer and the
        // call shrinks count to what it wrote.
        unsafe { GetProcessGroupAffinity(handle.0, &mut count, groups.as_mut_ptr()) }
            .map_err(|e| map_win_error(e, "GetProcessGroupAffinity"))?;
        groups.truncate(count as usize);
        Ok(groups)
    }

    fn set_process_affinity(
        &self,
        pid: u32,
        affinity: &GroupAffinity,
    ) -> Result<(), BalancerError> {
        let Some(set_information_process) = self.set_information_process else {
            return Err(BalancerError::Unsupported(
                "NtSetInformationProcess not resolved".into(),
            ));
        };
        let handle = self.open_process(pid)?;
        let target = WIN_GROUP_AFFINITY {
            Mask: affinity.mask as usize,
            Group: affinity.group,
            ..Default::default()
        };
        // SAFETY: the information class expects exactly one GROUP_AFFINITY.
        let status = unsafe {
            set_information_process(
                handle.0,
                PROCESS_AFFINITY_INFORMATION_CLASS,
                &target as *const WIN_GROUP_AFFINITY as *const c_void,
                std::mem::size_of::<WIN_GROUP_AFFINITY>() as u32,
            )
        };
        if status != 0 {
            return Err(BalancerError::Os {
                code: status,
                context: "NtSetInformationProcess".to_string(),
            });
        }
        Ok(())
    }

    fn supports_process_affinity(&self) -> bool {
        self.set_information_process.is_some()
    }

    fn enable_debug_privilege(&self) -> Result<(), BalancerError> {
        let mut token = HANDLE::default();
        // SAFETY: our own process token, closed by the guard.
        unsafe {
            OpenProcessToken(
                GetCurrentProcess(),
                TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
                &mut token,
            )
        }
        .map_err(|e| map_win_error(e, "OpenProcessToken"))?;
        let token = OwnedHandle(token);

        let mut luid = LUID::default();
        // SAFETY: out-only lookup of the debug privilege LUID.
        unsafe { LookupPrivilegeValueW(PCWSTR::null(), SE_DEBUG_NAME, &mut luid) }
            .map_err(|e| map_win_error(e, "LookupPrivilegeValueW"))?;

        let privileges = TOKEN_PRIVILEGES {
            PrivilegeCount: 1,
            Privileges: [LUID_AND_ATTRIBUTES { Luid: luid, Attributes: SE_PRIVILEGE_ENABLED }],
        };
        // SAFETY: a single-entry privilege array sized by the struct itself.
        unsafe { AdjustTokenPrivileges(token.0, false, Some(&privileges), 0, None, None) }
            .map_err(|e| map_win_error(e, "AdjustTokenPrivileges"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PDH counter query
// ---------------------------------------------------------------------------

/// An open PDH query plus its counters, in registration order.
pub struct PdhCounterQuery {
    query: isize,
    counters: Vec<isize>,
}

// The handles are used only by the collector loop that owns the query.
unsafe impl Send for PdhCounterQuery {}

impl PdhCounterQuery {
    fn open(names: &[String]) -> Result<Self, BalancerError> {
        let mut query = 0isize;
        // SAFETY: out-only query open.
        let status = unsafe { PdhOpenQueryW(PCWSTR::null(), 0, &mut query) };
        if status != 0 {
            return Err(BalancerError::Counter(format!("PdhOpenQueryW failed: {status:#x}")));
        }

        let mut counters = Vec::with_capacity(names.len());
        for name in names {
            let wide = to_wide_nul(name);
            let mut counter = 0isize;
            // SAFETY: wide outlives the call; counter is out-only.
            let status = unsafe {
                PdhAddEnglishCounterW(query, PCWSTR(wide.as_ptr()), 0, &mut counter)
            };
            if status != 0 {
                // A single unknown counter path disables the whole set; the
                // collector treats this as collection-unavailable.
                // SAFETY: query was opened above.
                unsafe {
                    let _ = PdhCloseQuery(query);
                }
                return Err(BalancerError::Counter(format!(
                    "PdhAddEnglishCounterW({name}) failed: {status:#x}"
                )));
            }
            counters.push(counter);
        }
        Ok(Self { query, counters })
    }
}

impl CounterQuery for PdhCounterQuery {
    fn poll(&mut self) -> Result<Vec<Option<f64>>, BalancerError> {
        // SAFETY: the query owns its counters; this refreshes their values.
        let status = unsafe { PdhCollectQueryData(self.query) };
        if status != 0 {
            return Err(BalancerError::Counter(format!(
                "PdhCollectQueryData failed: {status:#x}"
            )));
        }

        let mut values = Vec::with_capacity(self.counters.len());
        for &counter in &self.counters {
            let mut value = PDH_FMT_COUNTERVALUE::default();
            // SAFETY: value is out-only; the counter handle is live.
            let status = unsafe {
                PdhGetFormattedCounterValue(counter, PDH_FMT_DOUBLE, None, &mut value)
            };
            if status == 0 {
                // SAFETY: PDH_FMT_DOUBLE selects the doubleValue union arm.
                values.push(Some(unsafe { value.Anonymous.doubleValue }));
            } else {
                // This counter had no fresh value this tick; the others are
                // unaffected.
                values.push(None);
            }
        }
        Ok(values)
    }
}

impl Drop for PdhCounterQuery {
    fn drop(&mut self) {
        // SAFETY: closing the query releases its counters too.
        let status = unsafe { PdhCloseQuery(self.query) };
        if status != 0 {
            warn!("PdhCloseQuery failed: {status:#x}");
        }
    }
}
