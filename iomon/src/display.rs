//! Headless display thread
//!
//! Drains [`Update`]s from the crossbeam channel and prints them as text or,
//! with `--json`, one JSON object per line. Returns when every sender is gone.

// Bar widths are scaled in f64 for display
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

use crossbeam_channel::Receiver;
use log::warn;
use std::io::{self, Write};

use crate::sink::Update;
use crate::tracer::{
    AggregateState, BarChart, DomainEvent, EventSummary, IoEvent, IoLocation, RecordKind,
    TopReport,
};

/// Width of the longest histogram bar
const BAR_WIDTH: usize = 40;

/// What the display printed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DisplayStats {
    pub stats: u64,
    pub events: u64,
    pub lost: u64,
    pub errors: u64,
    pub histograms: u64,
    pub tops: u64,
}

fn summary_line(label: &str, summary: &EventSummary) -> String {
    format!(
        "{label}: {:.2}ms {} {}B at {:.3}s",
        summary.latency_ms, summary.op, summary.bytes, summary.time_s
    )
}

fn ops_label(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Block => "block ops",
        RecordKind::Filesystem => "slow fs ops",
    }
}

/// Text form of an aggregate snapshot
pub fn format_stats(state: &AggregateState) -> String {
    let mut out = format!("[{}] {} {}", state.target, state.count, ops_label(state.kind));
    if let Some(last) = &state.last {
        out.push_str(" | ");
        out.push_str(&summary_line("last", last));
    }
    if let Some(max) = &state.max {
        out.push_str(" | ");
        out.push_str(&summary_line("slowest", max));
    }
    out
}

fn format_io(io: &IoEvent) -> String {
    let mut line = match &io.location {
        IoLocation::Block { dev, sector, .. } => format!(
            "{:<12.6} {:<16} {:<7} {:<6} {:<2} {:<12} {:<8} {:>8.2}ms",
            io.time_s, io.comm, io.pid.0, dev, io.op, sector, io.bytes, io.latency_ms
        ),
        IoLocation::File { file, offset } => format!(
            "{:<12.6} {:<16} {:<7} {:<2} {:<8} {:<10} {:>8.2}ms {file}",
            io.time_s, io.comm, io.pid.0, io.op, io.bytes, offset, io.latency_ms
        ),
    };
    if let Some(queue_ms) = io.queue_ms() {
        line.push_str(&format!(" (queued {queue_ms:.2}ms)"));
    }
    if let Some(ns) = &io.namespace {
        if ns.containerized {
            line.push_str(&format!(" [{} {}]", ns.leader_comm, ns.mntns_id));
        }
    }
    line
}

/// Text form of an event or marker
pub fn format_event(event: &DomainEvent) -> String {
    match event {
        DomainEvent::Io(io) => format_io(io),
        DomainEvent::Lost { count } => format!("warning: lost {count} events"),
        DomainEvent::Error { message } => format!("error: {message}"),
    }
}

/// Table of a top round; just the header when the target did no I/O
pub fn format_top(report: &TopReport) -> Vec<String> {
    let mut lines = vec![format!(
        "{:<7} {:<16} {:<3} {:<7} {:>10} {:>10} {:>6}",
        "PID", "COMM", "R/W", "DEV", "BYTES", "TIME(us)", "IO"
    )];
    for row in &report.rows {
        lines.push(format!(
            "{:<7} {:<16} {:<3} {:<7} {:>10} {:>10} {:>6}",
            row.pid.0,
            row.comm,
            row.direction(),
            row.dev,
            row.bytes,
            row.us,
            row.io
        ));
    }
    lines
}

/// ASCII bar chart, one line per bucket, scaled by `max_value`
pub fn format_histogram(chart: &BarChart) -> Vec<String> {
    let label_width = chart.labels.iter().map(String::len).max().unwrap_or(0);
    let mut lines = vec![format!("latency ({})", if chart.unit.is_empty() { "?" } else { chart.unit.as_str() })];
    for (value, label) in chart.values.iter().zip(&chart.labels) {
        let width = if chart.max_value == 0 {
            0
        } else {
            ((*value as f64 / chart.max_value as f64) * BAR_WIDTH as f64).round() as usize
        };
        lines.push(format!(
            "{label:>label_width$} | {:<BAR_WIDTH$} | {value}",
            "*".repeat(width.min(BAR_WIDTH))
        ));
    }
    lines
}

fn write_update<W: Write>(out: &mut W, update: &Update, json: bool) -> io::Result<()> {
    if json {
        let line = serde_json::to_string(update).map_err(io::Error::other)?;
        return writeln!(out, "{line}");
    }
    match update {
        Update::Stats(state) => writeln!(out, "{}", format_stats(state)),
        Update::Event(event) => writeln!(out, "{}", format_event(event)),
        Update::Histogram(chart) => {
            for line in format_histogram(chart) {
                writeln!(out, "{line}")?;
            }
            Ok(())
        }
        Update::Top(report) => {
            for line in format_top(report) {
                writeln!(out, "{line}")?;
            }
            Ok(())
        }
    }
}

/// Print updates until the channel is closed
pub fn run<W: Write>(rx: &Receiver<Update>, json: bool, mut out: W) -> DisplayStats {
    let mut stats = DisplayStats::default();
    for update in rx {
        match &update {
            Update::Stats(_) => stats.stats += 1,
            Update::Event(DomainEvent::Lost { .. }) => stats.lost += 1,
            Update::Event(DomainEvent::Error { .. }) => stats.errors += 1,
            Update::Event(DomainEvent::Io(_)) => stats.events += 1,
            Update::Histogram(_) => stats.histograms += 1,
            Update::Top(_) => stats.tops += 1,
        }
        if let Err(e) = write_update(&mut out, &update, json).and_then(|()| out.flush()) {
            warn!("Display output failed: {e}");
            break;
        }
    }
    stats
}
