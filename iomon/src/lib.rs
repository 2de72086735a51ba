//! # iomon - eBPF Block I/O and Filesystem Monitor
//!
//! iomon watches the block I/O and filesystem activity of one command (by
//! default `etcd`) through four panels:
//!
//! - **fsslower**: ext4 read, write, open and fsync calls slower than a
//!   threshold (10 ms by default), with live count, latest and slowest call
//! - **top**: per-process block I/O totals of the target, once per round
//! - **snoop**: every completed block request of the target, with the same
//!   live statistics as fsslower
//! - **latency**: a system-wide block latency histogram, once per round
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 eBPF Programs (Kernel, pre-built)               │
//! │  • fsslower: ext4 kprobes/kretprobes       → EVENTS ring        │
//! │  • snoop: block kprobes + rq tracepoints   → EVENTS ring        │
//! │  • top: accounting kprobes                 → COUNTS hash        │
//! │  • latency: rq tracepoints                 → HIST array         │
//! └──────────────┬───────────────────────────────┬──────────────────┘
//!                │ ring buffers                  │ maps
//!                ▼                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      iomon (This Crate)                         │
//! │                                                                 │
//! │  ┌──────────┐  ┌─────────┐  ┌────────────┐  ┌────────────┐      │
//! │  │ Channel  │─▶│ Decoder │─▶│ Translator │─▶│ Aggregator │──┐   │
//! │  └──────────┘  └─────────┘  └────────────┘  └────────────┘  │   │
//! │                                                             ▼   │
//! │  ┌──────────────────┐   ┌─────────┐                  ┌────────┐ │
//! │  │ Top / histogram  │──▶│ Sampler │─────────────────▶│  Sink  │ │
//! │  └──────────────────┘   └─────────┘                  └────┬───┘ │
//! │                                                           ▼     │
//! │                                                      ┌─────────┐│
//! │                                                      │ Display ││
//! │                                                      └─────────┘│
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`tracer`]: hook lifecycle, ring buffer consumer, decoding, translation,
//!   aggregation, and the bounded-round sampler with its top and histogram
//!   engines
//! - [`sink`]: message passing from tracers to the display
//! - [`display`]: headless text / JSON output
//! - [`preflight`]: privilege, kernel and artifact checks
//! - [`cli`]: command-line arguments
//! - [`domain`]: newtypes (Pid, `DeviceId`, `MountNsId`) and error enums
//!
//! ## Lifecycle
//!
//! A tracer attaches every hook before it opens the ring buffer, and on
//! shutdown detaches hooks, closes the ring buffer, waits for its reader and
//! only then releases programs and maps.
//!
//! ## Typical Usage
//!
//! ```bash
//! # Watch etcd with every panel and the default artifacts
//! sudo ./iomon
//!
//! # Every request from postgres, as JSON lines
//! sudo ./iomon postgres --panels snoop --events --json
//!
//! # Filesystem calls slower than 25ms
//! sudo ./iomon --panels fsslower --fs-min-latency-ms 25
//! ```

pub mod cli;
pub mod display;
pub mod domain;
pub mod preflight;
pub mod sink;
pub mod tracer;
