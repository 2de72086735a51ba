//! # Event Translation
//!
//! Converts a decoded [`RawEvent`] into a [`DomainEvent`]: relative time since
//! the first record of this run, latency in milliseconds, the operation, and
//! optional mount-namespace metadata.
//!
//! The baseline clock is owned by each [`Translator`], so two tracers never
//! share (or corrupt) each other's time origin. Records from different CPUs can
//! reach the ring buffer slightly out of timestamp order; relative time is
//! clamped to the latest one already emitted so it never goes backwards.

// Timestamps and latencies are converted to f64 for display
#![allow(clippy::cast_precision_loss)]

use iomon_common::{
    BioEvent, FsEvent, FS_OP_FSYNC, FS_OP_OPEN, FS_OP_READ, FS_OP_WRITE, REQ_OP_DISCARD,
    REQ_OP_FLUSH, REQ_OP_MASK, REQ_OP_READ, REQ_OP_SECURE_ERASE, REQ_OP_WRITE,
    REQ_OP_WRITE_ZEROES,
};
use serde::Serialize;
use std::fmt;

use super::decoder::{comm_to_string, RawEvent};
use crate::domain::{DeviceId, Duration, MountNsId, Pid, Timestamp};

/// Operation of a block request (`REQ_OP_*`) or a filesystem call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IoOp {
    Read,
    Write,
    Flush,
    Discard,
    SecureErase,
    WriteZeroes,
    Open,
    Fsync,
    Other,
}

impl IoOp {
    pub fn from_cmd_flags(cmd_flags: u32) -> Self {
        match cmd_flags & REQ_OP_MASK {
            REQ_OP_READ => IoOp::Read,
            REQ_OP_WRITE => IoOp::Write,
            REQ_OP_FLUSH => IoOp::Flush,
            REQ_OP_DISCARD => IoOp::Discard,
            REQ_OP_SECURE_ERASE => IoOp::SecureErase,
            REQ_OP_WRITE_ZEROES => IoOp::WriteZeroes,
            _ => IoOp::Other,
        }
    }

    pub fn from_fs_op(op: u32) -> Self {
        match op {
            FS_OP_READ => IoOp::Read,
            FS_OP_WRITE => IoOp::Write,
            FS_OP_OPEN => IoOp::Open,
            FS_OP_FSYNC => IoOp::Fsync,
            _ => IoOp::Other,
        }
    }

    /// One-letter label, as in `rwbs` and `fsslower`
    pub fn label(self) -> &'static str {
        match self {
            IoOp::Read => "R",
            IoOp::Write => "W",
            IoOp::Flush => "F",
            IoOp::Discard => "D",
            IoOp::SecureErase => "E",
            IoOp::WriteZeroes => "Z",
            IoOp::Open => "O",
            IoOp::Fsync => "S",
            IoOp::Other => "?",
        }
    }
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

/// Container-level context for a mount namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceMetadata {
    pub mntns_id: MountNsId,
    /// Lowest PID found in the namespace
    pub leader_pid: Pid,
    /// Command name of that process
    pub leader_comm: String,
    /// `false` for the host (PID 1's) namespace
    pub containerized: bool,
}

/// Looks up metadata for a mount namespace; best effort and non-blocking
pub trait Enricher: Send {
    fn lookup(&mut self, mntns_id: MountNsId) -> Option<NamespaceMetadata>;
}

/// Where an operation landed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "layer", rename_all = "lowercase")]
pub enum IoLocation {
    Block {
        dev: DeviceId,
        sector: u64,
        /// Insert → issue queue time, when collected
        #[serde(skip_serializing_if = "Option::is_none")]
        queue_ms: Option<f64>,
    },
    File {
        file: String,
        offset: i64,
    },
}

/// One completed block request or slow filesystem call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IoEvent {
    pub pid: Pid,
    pub comm: String,
    /// Seconds since the first record of this tracer run
    pub time_s: f64,
    pub latency_ms: f64,
    pub op: IoOp,
    pub bytes: u64,
    pub location: IoLocation,
    pub mntns_id: MountNsId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<NamespaceMetadata>,
}

impl IoEvent {
    /// Queue time of a block request, if collected
    pub fn queue_ms(&self) -> Option<f64> {
        match self.location {
            IoLocation::Block { queue_ms, .. } => queue_ms,
            IoLocation::File { .. } => None,
        }
    }
}

/// Pipeline output: an operation or a synthesized marker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DomainEvent {
    Io(IoEvent),
    /// The kernel dropped `count` records since the previous read
    Lost { count: u64 },
    /// The stream failed; no further events follow from this tracer
    Error { message: String },
}

/// Per-tracer translation state
pub struct Translator {
    baseline: Option<Timestamp>,
    latest: Option<Timestamp>,
    collect_queue_time: bool,
    enricher: Option<Box<dyn Enricher>>,
}

impl Translator {
    #[must_use]
    pub fn new(collect_queue_time: bool, enricher: Option<Box<dyn Enricher>>) -> Self {
        Self { baseline: None, latest: None, collect_queue_time, enricher }
    }

    /// Timestamp of the first record seen, if any
    pub fn baseline(&self) -> Option<Timestamp> {
        self.baseline
    }

    pub fn translate(&mut self, raw: &RawEvent) -> DomainEvent {
        match raw {
            RawEvent::Block(event) => self.translate_block(event),
            RawEvent::Fs(event) => self.translate_fs(event),
        }
    }

    /// Seconds since the baseline, never below the previous result
    fn relative_time(&mut self, ts_ns: u64) -> f64 {
        let ts = self.latest.map_or(Timestamp(ts_ns), |latest| latest.max(Timestamp(ts_ns)));
        self.latest = Some(ts);
        let baseline = *self.baseline.get_or_insert(ts);
        ts.seconds_since(baseline)
    }

    fn namespace(&mut self, mntns_id: MountNsId) -> Option<NamespaceMetadata> {
        self.enricher.as_mut().and_then(|enricher| enricher.lookup(mntns_id))
    }

    fn translate_block(&mut self, raw: &BioEvent) -> DomainEvent {
        let queue_ms = match u64::try_from(raw.qdelta_ns) {
            Ok(qdelta) if self.collect_queue_time => Some(Duration(qdelta).as_millis()),
            _ => None,
        };
        let mntns_id = MountNsId(raw.mntns_id);

        DomainEvent::Io(IoEvent {
            pid: Pid(raw.pid),
            comm: comm_to_string(&raw.comm),
            time_s: self.relative_time(raw.ts_ns),
            latency_ms: Duration(raw.delta_ns).as_millis(),
            op: IoOp::from_cmd_flags(raw.cmd_flags),
            bytes: u64::from(raw.len),
            location: IoLocation::Block { dev: DeviceId(raw.dev), sector: raw.sector, queue_ms },
            mntns_id,
            namespace: self.namespace(mntns_id),
        })
    }

    fn translate_fs(&mut self, raw: &FsEvent) -> DomainEvent {
        let mntns_id = MountNsId(raw.mntns_id);

        DomainEvent::Io(IoEvent {
            pid: Pid(raw.pid),
            comm: comm_to_string(&raw.comm),
            time_s: self.relative_time(raw.ts_ns),
            latency_ms: Duration(raw.delta_ns).as_millis(),
            op: IoOp::from_fs_op(raw.op),
            bytes: raw.size,
            location: IoLocation::File { file: comm_to_string(&raw.file), offset: raw.offset },
            mntns_id,
            namespace: self.namespace(mntns_id),
        })
    }
}
