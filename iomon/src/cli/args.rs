//! CLI argument definitions

use clap::{Parser, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::DeviceId;
use crate::tracer::{LoaderOptions, DEFAULT_MAX_ROWS};

/// One of the pipelines iomon can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Panel {
    /// Slow ext4 operations (read, write, open, fsync) of the target command
    Fsslower,
    /// Per-process block I/O totals of the target command, per round
    Top,
    /// Per-request block I/O tracing of the target command
    Snoop,
    /// System-wide block latency histogram, per round
    Latency,
}

#[derive(Parser, Debug)]
#[command(
    name = "iomon",
    about = "Watch block I/O latency of a process with eBPF",
    after_help = "\
EXAMPLES:
    sudo iomon                                     Trace etcd with every panel
    sudo iomon postgres --panels snoop --events    Print every request issued by postgres
    sudo iomon --panels fsslower,top               Slow ext4 calls and busiest etcd processes
    sudo iomon --device 259:0 --min-latency-ms 5   Only slow requests on nvme0n1"
)]
pub struct Args {
    /// Command name to watch (as in /proc/<pid>/comm)
    #[arg(value_name = "COMM", default_value = "etcd")]
    pub comm: String,

    /// Pipelines to run
    #[arg(
        long,
        value_enum,
        value_delimiter = ',',
        default_values_t = [Panel::Fsslower, Panel::Top, Panel::Snoop, Panel::Latency]
    )]
    pub panels: Vec<Panel>,

    /// Pre-built snoop eBPF object
    #[arg(long, value_name = "FILE", default_value = "/usr/lib/iomon/biosnoop.bpf.o")]
    pub artifact: PathBuf,

    /// Pre-built latency histogram eBPF object
    #[arg(long, value_name = "FILE", default_value = "/usr/lib/iomon/biolatency.bpf.o")]
    pub hist_artifact: PathBuf,

    /// Pre-built ext4 slow-operation eBPF object
    #[arg(long, value_name = "FILE", default_value = "/usr/lib/iomon/fsslower.bpf.o")]
    pub fs_artifact: PathBuf,

    /// Pre-built per-process top eBPF object
    #[arg(long, value_name = "FILE", default_value = "/usr/lib/iomon/biotop.bpf.o")]
    pub top_artifact: PathBuf,

    /// Only report filesystem calls slower than N milliseconds
    #[arg(long, value_name = "N", default_value = "10")]
    pub fs_min_latency_ms: u64,

    /// Rows per top round
    #[arg(long, value_name = "N", default_value = "20", value_parser = clap::value_parser!(u32).range(1..))]
    pub top_rows: u32,

    /// Only report requests slower than N milliseconds
    #[arg(long, value_name = "N", default_value = "0")]
    pub min_latency_ms: u64,

    /// Include queue time (insert → issue)
    #[arg(long)]
    pub queued: bool,

    /// Only trace this device
    #[arg(long, value_name = "MAJ:MIN")]
    pub device: Option<DeviceId>,

    /// Ring buffer size in pages (power of two)
    #[arg(long, value_name = "N", default_value = "64", value_parser = parse_ring_pages)]
    pub ring_pages: u32,

    /// Length of one histogram or top round in milliseconds
    #[arg(long, value_name = "MS", default_value = "1000", value_parser = clap::value_parser!(u64).range(1..))]
    pub round_ms: u64,

    /// Resolve mount namespaces to their leading process
    #[arg(long)]
    pub enrich: bool,

    /// Print updates as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Also print every decoded request, not only stats
    #[arg(long)]
    pub events: bool,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

fn parse_ring_pages(value: &str) -> Result<u32, String> {
    let pages: u32 = value.parse().map_err(|e| format!("{e}"))?;
    if pages.is_power_of_two() {
        Ok(pages)
    } else {
        Err(format!("{pages} is not a power of two"))
    }
}

impl Args {
    pub fn has(&self, panel: Panel) -> bool {
        self.panels.contains(&panel)
    }

    pub fn snoop_options(&self) -> LoaderOptions {
        LoaderOptions {
            artifact: self.artifact.clone(),
            min_latency_ns: self.min_latency_ms.saturating_mul(1_000_000),
            queued: self.queued,
            device: self.device,
            ring_pages: Some(self.ring_pages),
        }
    }

    pub fn hist_options(&self) -> LoaderOptions {
        LoaderOptions { queued: self.queued, device: self.device, ..LoaderOptions::new(&self.hist_artifact) }
    }

    pub fn fs_options(&self) -> LoaderOptions {
        LoaderOptions {
            min_latency_ns: self.fs_min_latency_ms.saturating_mul(1_000_000),
            ring_pages: Some(self.ring_pages),
            ..LoaderOptions::new(&self.fs_artifact)
        }
    }

    pub fn top_options(&self) -> LoaderOptions {
        LoaderOptions::new(&self.top_artifact)
    }

    pub fn max_top_rows(&self) -> usize {
        usize::try_from(self.top_rows).unwrap_or(DEFAULT_MAX_ROWS)
    }

    /// Artifacts of the selected panels, in start order
    pub fn artifacts(&self) -> Vec<&Path> {
        let mut paths = Vec::new();
        for (panel, artifact) in [
            (Panel::Fsslower, &self.fs_artifact),
            (Panel::Top, &self.top_artifact),
            (Panel::Snoop, &self.artifact),
            (Panel::Latency, &self.hist_artifact),
        ] {
            if self.has(panel) {
                paths.push(artifact.as_path());
            }
        }
        paths
    }

    pub fn round_budget(&self) -> Duration {
        Duration::from_millis(self.round_ms)
    }

    pub fn duration_limit(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }
}
