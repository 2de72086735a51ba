//! # Hook Descriptor Sets
//!
//! Static description of where each tracer attaches: the program name inside
//! the pre-built artifact and the kernel hook point it binds to.
//!
//! Attachment order is part of the contract. Every hook needed to correlate one
//! request (merge/start accounting plus the three queue lifecycle tracepoints)
//! is attached before the ring buffer is opened, so no record references a
//! code path that is not instrumented yet. For the filesystem set each kretprobe
//! goes in before the matching kprobe: an entry that records a start time
//! always has its return instrumented.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fmt;
use std::io::BufRead;

/// Kernel attachment point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// Function-entry kprobe. Candidates are tried in order against
    /// `/proc/kallsyms`; the first one present wins.
    Kprobe(&'static [&'static str]),
    /// Function-return kprobe, with the same candidate rules
    Kretprobe(&'static [&'static str]),
    /// Raw tracepoint, by name (e.g. `block_rq_complete`)
    RawTracepoint(&'static str),
}

impl HookPoint {
    /// Pick the kprobe symbol to attach to.
    ///
    /// Without a symbol table (e.g. `/proc/kallsyms` unreadable) the last
    /// candidate, the long-standing exported name, is used.
    pub fn kprobe_symbol(&self, symbols: Option<&KernelSymbols>) -> Option<&'static str> {
        let (HookPoint::Kprobe(candidates) | HookPoint::Kretprobe(candidates)) = self else {
            return None;
        };
        match symbols {
            Some(symbols) => candidates.iter().copied().find(|name| symbols.contains(name)),
            None => candidates.last().copied(),
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPoint::Kprobe(candidates) => write!(f, "kprobe:{}", candidates.join("|")),
            HookPoint::Kretprobe(candidates) => write!(f, "kretprobe:{}", candidates.join("|")),
            HookPoint::RawTracepoint(name) => write!(f, "raw_tp:{name}"),
        }
    }
}

/// One program → hook binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookDescriptor {
    /// Program (function) name inside the artifact
    pub program: &'static str,
    pub point: HookPoint,
}

impl fmt::Display for HookDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.program, self.point)
    }
}

/// Block I/O snoop tracer: per-request records through the `EVENTS` ring buffer
pub const BIOSNOOP_HOOKS: &[HookDescriptor] = &[
    HookDescriptor {
        program: "blk_account_io_merge_bio",
        point: HookPoint::Kprobe(&["blk_account_io_merge_bio"]),
    },
    HookDescriptor {
        program: "blk_account_io_start",
        point: HookPoint::Kprobe(&["__blk_account_io_start", "blk_account_io_start"]),
    },
    HookDescriptor {
        program: "block_rq_complete",
        point: HookPoint::RawTracepoint("block_rq_complete"),
    },
    HookDescriptor {
        program: "z_block_rq_insert",
        point: HookPoint::RawTracepoint("block_rq_insert"),
    },
    HookDescriptor { program: "z_block_rq_issue", point: HookPoint::RawTracepoint("block_rq_issue") },
];

/// Block I/O latency histogram: in-kernel aggregation into the `HIST` map
pub const BIOLATENCY_HOOKS: &[HookDescriptor] = &[
    HookDescriptor { program: "block_rq_insert", point: HookPoint::RawTracepoint("block_rq_insert") },
    HookDescriptor { program: "block_rq_issue", point: HookPoint::RawTracepoint("block_rq_issue") },
    HookDescriptor {
        program: "block_rq_complete",
        point: HookPoint::RawTracepoint("block_rq_complete"),
    },
];

/// ext4 slow file operations: `FsEvent` records through the `EVENTS` ring buffer
pub const EXT4_SLOWER_HOOKS: &[HookDescriptor] = &[
    HookDescriptor {
        program: "file_read_exit",
        point: HookPoint::Kretprobe(&["ext4_file_read_iter"]),
    },
    HookDescriptor { program: "file_read_entry", point: HookPoint::Kprobe(&["ext4_file_read_iter"]) },
    HookDescriptor {
        program: "file_write_exit",
        point: HookPoint::Kretprobe(&["ext4_file_write_iter"]),
    },
    HookDescriptor {
        program: "file_write_entry",
        point: HookPoint::Kprobe(&["ext4_file_write_iter"]),
    },
    HookDescriptor { program: "file_open_exit", point: HookPoint::Kretprobe(&["ext4_file_open"]) },
    HookDescriptor { program: "file_open_entry", point: HookPoint::Kprobe(&["ext4_file_open"]) },
    HookDescriptor { program: "file_sync_exit", point: HookPoint::Kretprobe(&["ext4_sync_file"]) },
    HookDescriptor { program: "file_sync_entry", point: HookPoint::Kprobe(&["ext4_sync_file"]) },
];

/// Per-process block I/O totals: in-kernel accumulation into the `COUNTS` map
pub const BIOTOP_HOOKS: &[HookDescriptor] = &[
    HookDescriptor {
        program: "blk_account_io_start",
        point: HookPoint::Kprobe(&["__blk_account_io_start", "blk_account_io_start"]),
    },
    HookDescriptor {
        program: "blk_mq_start_request",
        point: HookPoint::Kprobe(&["blk_mq_start_request"]),
    },
    HookDescriptor {
        program: "blk_account_io_done",
        point: HookPoint::Kprobe(&["__blk_account_io_done", "blk_account_io_done"]),
    },
];

/// Kernel symbol names from `/proc/kallsyms`
#[derive(Debug, Default)]
pub struct KernelSymbols {
    names: HashSet<String>,
}

impl KernelSymbols {
    /// Parse `/proc/kallsyms`
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or a line is malformed
    pub fn load() -> Result<Self> {
        let file = std::fs::File::open("/proc/kallsyms").context("Failed to open /proc/kallsyms")?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Parse kallsyms-formatted lines: `<addr> <type> <name>[\t[module]]`
    ///
    /// # Errors
    /// Returns an error on read failure or a line with fewer than three fields
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut names = HashSet::new();
        for line in reader.lines() {
            let line = line.context("Failed to read kallsyms")?;
            if line.is_empty() {
                continue;
            }
            let name = line
                .split_whitespace()
                .nth(2)
                .with_context(|| format!("Invalid kallsyms line: {line}"))?;
            names.insert(name.to_string());
        }
        Ok(Self { names })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
