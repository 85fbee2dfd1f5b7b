//! Bounds-checked decoder for the process-enumeration buffer.
//!
//! The enumeration interface fills a caller-owned buffer with variable-length
//! process records. Each record starts with the distance to the next record
//! (`next_offset`, 0 terminates the walk) and embeds an array of fixed-size
//! thread records after a fixed 64-bit header. The image name is stored as a
//! counted UTF-16 string referenced by an absolute pointer into the same
//! buffer, so decoding needs the base address the buffer occupied when the
//! OS filled it.
//!
//! [`SnapshotIter`] walks the records lazily and never trusts an offset or
//! pointer without checking it against the buffer bounds.
//!
//! # Process record header (64-bit layout, 256 bytes)
//!
//! | Offset | Size | Field          |
//! |--------|------|----------------|
//! | 0      | 4    | next_offset    |
//! | 4      | 4    | thread_count   |
//! | 32     | 8    | create_time    |
//! | 40     | 8    | user_time      |
//! | 48     | 8    | kernel_time    |
//! | 56     | 2    | name_len (bytes) |
//! | 64     | 8    | name_ptr (absolute) |
//! | 80     | 4    | pid            |
//! | 96     | 4    | handle_count   |
//!
//! # Thread record (80 bytes each, starting at offset 256)
//!
//! | Offset | Size | Field        |
//! |--------|------|--------------|
//! | 8      | 8    | user_time    |
//! | 48     | 4    | tid          |
//! | 68     | 4    | state        |
//! | 72     | 4    | wait_reason  |

use thiserror::Error;

/// Fixed header size of one process record.
pub const PROCESS_HEADER_LEN: usize = 256;
/// Size of one embedded thread record.
pub const THREAD_RECORD_LEN: usize = 80;

/// Name reported for pid 0, which carries no image name of its own.
pub const IDLE_PROCESS_NAME: &str = "System Idle Process";
/// Placeholder for records with no image name pointer.
pub const UNKNOWN_PROCESS_NAME: &str = "unknown";

const OFF_NEXT_OFFSET: usize = 0;
const OFF_THREAD_COUNT: usize = 4;
const OFF_CREATE_TIME: usize = 32;
const OFF_USER_TIME: usize = 40;
const OFF_KERNEL_TIME: usize = 48;
const OFF_NAME_LEN: usize = 56;
const OFF_NAME_PTR: usize = 64;
const OFF_PID: usize = 80;
const OFF_HANDLE_COUNT: usize = 96;

const THR_OFF_TID: usize = 48;
const THR_OFF_STATE: usize = 68;
const THR_OFF_WAIT_REASON: usize = 72;

/// A structurally invalid snapshot buffer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record at offset {offset} needs {needed} bytes but only {available} remain")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("record at offset {offset} advances backwards or not at all")]
    BadAdvance { offset: usize },

    #[error("image name of pid {pid} points outside the snapshot buffer")]
    NameOutOfBounds { pid: u32 },
}

/// One decoded process record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
    /// Creation timestamp in 100 ns units.
    pub create_time: u64,
    /// Cumulative user-mode CPU time in 100 ns units.
    pub user_time: u64,
    /// Cumulative kernel-mode CPU time in 100 ns units.
    pub kernel_time: u64,
    pub handle_count: u32,
    pub threads: Vec<ThreadEntry>,
}

/// One decoded thread record. State and wait reason stay raw here; the
/// sampler maps them to the diagnostic enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadEntry {
    pub tid: u32,
    pub state: u32,
    pub wait_reason: u32,
}

#[inline]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(data[offset..offset + 2].try_into().unwrap_or([0; 2]))
}

#[inline]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap_or([0; 4]))
}

#[inline]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap_or([0; 8]))
}

/// Lazy iterator over the process records of a filled snapshot buffer.
///
/// Yields `Err` once on the first structural problem and then stops; a
/// partially decoded snapshot is never silently extended past bad data.
pub struct SnapshotIter<'a> {
    buf: &'a [u8],
    /// Virtual address of `buf[0]` at fill time, for rebasing name pointers.
    base: u64,
    offset: usize,
    done: bool,
}

impl<'a> SnapshotIter<'a> {
    pub fn new(buf: &'a [u8], base: u64) -> Self {
        // An empty buffer is a valid, empty snapshot.
        Self { buf, base, offset: 0, done: buf.is_empty() }
    }

    fn decode_name(&self, record: &[u8], pid: u32) -> Result<String, DecodeError> {
        if pid == 0 {
            return Ok(IDLE_PROCESS_NAME.to_string());
        }
        let name_ptr = read_u64_le(record, OFF_NAME_PTR);
        if name_ptr == 0 {
            return Ok(UNKNOWN_PROCESS_NAME.to_string());
        }
        let name_len = read_u16_le(record, OFF_NAME_LEN) as usize;

        let start = name_ptr
            .checked_sub(self.base)
            .map(|o| o as usize)
            .ok_or(DecodeError::NameOutOfBounds { pid })?;
        let end = start
            .checked_add(name_len)
            .ok_or(DecodeError::NameOutOfBounds { pid })?;
        if end > self.buf.len() || name_len % 2 != 0 {
            return Err(DecodeError::NameOutOfBounds { pid });
        }

        let units: Vec<u16> = self.buf[start..end]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    fn decode_record(&mut self) -> Result<ProcessEntry, DecodeError> {
        let offset = self.offset;
        let available = self.buf.len() - offset;
        if available < PROCESS_HEADER_LEN {
            return Err(DecodeError::Truncated {
                offset,
                needed: PROCESS_HEADER_LEN,
                available,
            });
        }
        let record = &self.buf[offset..];

        let thread_count = read_u32_le(record, OFF_THREAD_COUNT) as usize;
        let needed = PROCESS_HEADER_LEN + thread_count * THREAD_RECORD_LEN;
        if available < needed {
            return Err(DecodeError::Truncated { offset, needed, available });
        }

        let pid = read_u32_le(record, OFF_PID);
        let name = self.decode_name(record, pid)?;

        let mut threads = Vec::with_capacity(thread_count);
        for i in 0..thread_count {
            let thr = &record[PROCESS_HEADER_LEN + i * THREAD_RECORD_LEN..];
            threads.push(ThreadEntry {
                tid: read_u32_le(thr, THR_OFF_TID),
                state: read_u32_le(thr, THR_OFF_STATE),
                wait_reason: read_u32_le(thr, THR_OFF_WAIT_REASON),
            });
        }

        let entry = ProcessEntry {
            pid,
            name,
            create_time: read_u64_le(record, OFF_CREATE_TIME),
            user_time: read_u64_le(record, OFF_USER_TIME),
            kernel_time: read_u64_le(record, OFF_KERNEL_TIME),
            handle_count: read_u32_le(record, OFF_HANDLE_COUNT),
            threads,
        };

        // Advance by the cumulative offset; zero terminates the walk.
        let next_offset = read_u32_le(record, OFF_NEXT_OFFSET) as usize;
        if next_offset == 0 {
            self.done = true;
        } else if next_offset < needed || offset + next_offset >= self.buf.len() {
            return Err(DecodeError::BadAdvance { offset });
        } else {
            self.offset = offset + next_offset;
        }

        Ok(entry)
    }
}

impl Iterator for SnapshotIter<'_> {
    type Item = Result<ProcessEntry, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let result = self.decode_record();
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

// ---------------------------------------------------------------------------
// Test-only snapshot builder
// ---------------------------------------------------------------------------
