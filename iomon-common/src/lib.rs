//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines the record layout and map/global names shared between the pre-built
//! kernel-side artifacts and userspace. All types use `#[repr(C)]` so the
//! layout matches the C `struct event` emitted by the block I/O programs.
//!
//! ## Key Types
//!
//! - [`BioEvent`] - One completed block request, delivered via the `EVENTS` ring buffer
//! - [`FsEvent`] - One slow filesystem operation, delivered the same way
//! - [`TopKey`] / [`TopValue`] - Per-process block I/O totals in the `COUNTS` hash map
//!
//! ## Artifact Contract
//!
//! The snoop and fsslower artifacts must expose the [`EVENTS_MAP`] ring buffer and
//! may expose the [`DROPPED_MAP`] per-CPU counter. The histogram artifact exposes
//! [`HIST_MAP`], the top artifact [`COUNTS_MAP`].

#![no_std]

// ============================================================================
// Map and Global Names
// ============================================================================

/// Ring buffer carrying [`BioEvent`] records
pub const EVENTS_MAP: &str = "EVENTS";

/// Per-CPU `u64` array, index 0 counts records dropped on ring reservation failure
pub const DROPPED_MAP: &str = "DROPPED";

/// Array of [`MAX_SLOTS`] `u64` counters, one per log2 microsecond bucket
pub const HIST_MAP: &str = "HIST";

/// Hash map of [`TopKey`] → [`TopValue`], drained by userspace every interval
pub const COUNTS_MAP: &str = "COUNTS";

/// Minimum latency in nanoseconds for a request to be reported (`u64`)
pub const GLOBAL_MIN_NS: &str = "min_ns";

/// Non-zero to collect insert → issue queue time (`u8`)
pub const GLOBAL_TARG_QUEUED: &str = "targ_queued";

/// Non-zero to only report requests for [`GLOBAL_TARG_DEV`] (`u8`)
pub const GLOBAL_FILTER_DEV: &str = "filter_dev";

/// Device number in kernel `MKDEV` encoding (`u32`)
pub const GLOBAL_TARG_DEV: &str = "targ_dev";

// ============================================================================
// Constants
// ============================================================================

/// Width of the kernel `comm` field
pub const TASK_COMM_LEN: usize = 16;

/// Number of log2 slots in the latency histogram
pub const MAX_SLOTS: u32 = 27;

/// Mask selecting the `REQ_OP_*` opcode from `cmd_flags`
pub const REQ_OP_MASK: u32 = 0xff;

pub const REQ_OP_READ: u32 = 0;
pub const REQ_OP_WRITE: u32 = 1;
pub const REQ_OP_FLUSH: u32 = 2;
pub const REQ_OP_DISCARD: u32 = 3;
pub const REQ_OP_SECURE_ERASE: u32 = 5;
pub const REQ_OP_WRITE_ZEROES: u32 = 9;

/// Filesystem operation codes carried in [`FsEvent::op`]
pub const FS_OP_READ: u32 = 0;
pub const FS_OP_WRITE: u32 = 1;
pub const FS_OP_OPEN: u32 = 2;
pub const FS_OP_FSYNC: u32 = 3;

/// Width of the file name captured from the dentry (`DNAME_INLINE_LEN`)
pub const FILE_NAME_LEN: usize = 32;

/// Bits used for the minor number in the kernel's internal `dev_t`
pub const MINORBITS: u32 = 20;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Completed block request, emitted by `block_rq_complete`
///
/// **Memory Layout**: `#[repr(C)]`, 72 bytes, no implicit padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BioEvent {
    /// Command name of the task that queued the request
    ///
    /// NUL padded; a full 16 byte name has no terminator. `'?'` when the
    /// issuing task was not captured.
    pub comm: [u8; TASK_COMM_LEN],

    /// Issue (or insert) → completion latency in nanoseconds
    pub delta_ns: u64,

    /// Insert → issue queue time in nanoseconds, `-1` when the insert was missed
    pub qdelta_ns: i64,

    /// Completion timestamp from `bpf_ktime_get_ns()` (monotonic, since boot)
    pub ts_ns: u64,

    /// Starting sector of the request
    pub sector: u64,

    /// Mount namespace inode of the task that queued the request
    pub mntns_id: u64,

    /// Request length in bytes
    pub len: u32,

    /// Process ID (TGID) of the task that queued the request
    pub pid: u32,

    /// `rq->cmd_flags`; the low byte is the `REQ_OP_*` opcode
    pub cmd_flags: u32,

    /// Device number, `major << MINORBITS | minor`
    pub dev: u32,
}

impl BioEvent {
    /// Size of one record as written by the kernel
    pub const SIZE: usize = core::mem::size_of::<BioEvent>();
}

/// Slow filesystem operation, emitted on return from the ext4 file operation
///
/// **Memory Layout**: `#[repr(C)]`, 96 bytes, no implicit padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FsEvent {
    /// Command name of the calling task, NUL padded
    pub comm: [u8; TASK_COMM_LEN],

    /// Final path component, NUL padded; empty for fsync
    pub file: [u8; FILE_NAME_LEN],

    /// Return timestamp from `bpf_ktime_get_ns()`
    pub ts_ns: u64,

    /// Entry → return latency in nanoseconds
    pub delta_ns: u64,

    /// File offset of a read or write, `0` otherwise
    pub offset: i64,

    /// Bytes requested by a read or write, `0` otherwise
    pub size: u64,

    /// Mount namespace inode of the calling task
    pub mntns_id: u64,

    /// Process ID (TGID)
    pub pid: u32,

    /// One of the `FS_OP_*` codes
    pub op: u32,
}

impl FsEvent {
    /// Size of one record as written by the kernel
    pub const SIZE: usize = core::mem::size_of::<FsEvent>();
}

/// Key of the `COUNTS` map: one process, device and direction
///
/// **Memory Layout**: `#[repr(C)]`, 32 bytes, no implicit padding.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TopKey {
    pub pid: u32,
    /// Non-zero for writes
    pub rwflag: u32,
    pub major: u32,
    pub minor: u32,
    pub comm: [u8; TASK_COMM_LEN],
}

/// Totals accumulated for a [`TopKey`] since the map was last drained
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TopValue {
    pub bytes: u64,
    /// Summed request latency in microseconds
    pub us: u64,
    /// Completed requests
    pub io: u64,
}

#[cfg(feature = "user")]
use aya::Pod;

// Map keys and values are copied to and from the kernel as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for TopKey {}

#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for TopValue {}
