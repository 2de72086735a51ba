//! # Record Decoding
//!
//! Turns one ring buffer sample into a typed [`BioEvent`] or [`FsEvent`]. Each
//! read yields exactly one complete record, so there is no partial-record
//! handling: a sample of any other width is rejected.

use iomon_common::{BioEvent, FsEvent};
use serde::Serialize;

use crate::domain::TracerError;

/// Which record layout a ring buffer carries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// [`BioEvent`] from the block snoop artifact
    #[default]
    Block,
    /// [`FsEvent`] from the fsslower artifact
    Filesystem,
}

impl RecordKind {
    pub fn label(self) -> &'static str {
        match self {
            RecordKind::Block => "block",
            RecordKind::Filesystem => "filesystem",
        }
    }

    /// Decode one sample of this kind
    ///
    /// # Errors
    /// Returns [`TracerError::RecordSize`] if `bytes` is not exactly one record
    pub fn decode(self, bytes: &[u8]) -> Result<RawEvent, TracerError> {
        match self {
            RecordKind::Block => decode(bytes).map(RawEvent::Block),
            RecordKind::Filesystem => decode_fs(bytes).map(RawEvent::Fs),
        }
    }
}

/// A decoded record of either kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEvent {
    Block(BioEvent),
    Fs(FsEvent),
}

/// Records made only of integer fields, with no padding, so any byte
/// pattern of the right width is a valid value
trait PlainRecord: Copy {}

impl PlainRecord for BioEvent {}
impl PlainRecord for FsEvent {}

fn read_record<T: PlainRecord>(bytes: &[u8]) -> Result<T, TracerError> {
    let expected = std::mem::size_of::<T>();
    if bytes.len() != expected {
        return Err(TracerError::RecordSize { expected, actual: bytes.len() });
    }
    // SAFETY: the length matches T exactly, every bit pattern is a valid
    // PlainRecord and read_unaligned tolerates the ring buffer's 8-byte
    // sample alignment.
    #[allow(unsafe_code)]
    let record = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<T>()) };
    Ok(record)
}

/// Decode a raw `BioEvent` sample
///
/// # Errors
/// Returns [`TracerError::RecordSize`] if `bytes` is not exactly one record
pub fn decode(bytes: &[u8]) -> Result<BioEvent, TracerError> {
    read_record(bytes)
}

/// Decode a raw `FsEvent` sample
///
/// # Errors
/// Returns [`TracerError::RecordSize`] if `bytes` is not exactly one record
pub fn decode_fs(bytes: &[u8]) -> Result<FsEvent, TracerError> {
    read_record(bytes)
}

/// Command name from a fixed-width, possibly unterminated C string
pub fn comm_to_string(comm: &[u8]) -> String {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..end]).into_owned()
}

/// Fixed-width command name, truncated to 16 bytes
pub fn comm_from_str(name: &str) -> [u8; iomon_common::TASK_COMM_LEN] {
    let mut comm = [0u8; iomon_common::TASK_COMM_LEN];
    let bytes = name.as_bytes();
    let copy_len = bytes.len().min(comm.len());
    comm[..copy_len].copy_from_slice(&bytes[..copy_len]);
    comm
}

fn record_bytes<T: PlainRecord>(record: &T) -> Vec<u8> {
    // SAFETY: PlainRecord types have no padding, so all size_of::<T>() bytes
    // behind the reference are initialized.
    #[allow(unsafe_code)]
    let bytes = unsafe {
        std::slice::from_raw_parts(std::ptr::from_ref(record).cast::<u8>(), std::mem::size_of::<T>())
    };
    bytes.to_vec()
}

/// Serialize a record the way the kernel writes it
pub fn encode(event: &BioEvent) -> Vec<u8> {
    record_bytes(event)
}

/// Serialize a filesystem record the way the kernel writes it
pub fn encode_fs(event: &FsEvent) -> Vec<u8> {
    record_bytes(event)
}
