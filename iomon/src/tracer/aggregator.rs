//! # Streaming Aggregation
//!
//! Running statistics for one target command over the lifetime of a tracer
//! run: accepted event count, the latest event and the slowest event. The
//! pipeline traces system-wide activity; everything not issued by the target
//! is discarded here without touching state.
//!
//! There is no windowing or decay. A fresh aggregate requires a new tracer.

use serde::Serialize;

use super::decoder::RecordKind;
use super::translator::{DomainEvent, IoEvent, IoOp};

/// What the display shows for one operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventSummary {
    pub latency_ms: f64,
    pub op: IoOp,
    pub time_s: f64,
    pub bytes: u64,
}

impl From<&IoEvent> for EventSummary {
    fn from(event: &IoEvent) -> Self {
        Self { latency_ms: event.latency_ms, op: event.op, time_s: event.time_s, bytes: event.bytes }
    }
}

/// Snapshot of the running aggregate
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateState {
    pub target: String,
    /// Block requests or filesystem calls
    pub kind: RecordKind,
    pub count: u64,
    pub last: Option<EventSummary>,
    pub max: Option<EventSummary>,
}

impl AggregateState {
    pub fn max_latency_ms(&self) -> Option<f64> {
        self.max.as_ref().map(|m| m.latency_ms)
    }

    pub fn last_latency_ms(&self) -> Option<f64> {
        self.last.as_ref().map(|l| l.latency_ms)
    }
}

/// Single writer of an [`AggregateState`]
pub struct Aggregator {
    state: AggregateState,
}

impl Aggregator {
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self { state: AggregateState { target: target.into(), ..AggregateState::default() } }
    }

    /// Label the snapshots with the record kind they summarize
    #[must_use]
    pub fn with_kind(mut self, kind: RecordKind) -> Self {
        self.state.kind = kind;
        self
    }

    pub fn target(&self) -> &str {
        &self.state.target
    }

    pub fn kind(&self) -> RecordKind {
        self.state.kind
    }

    /// Fold one event in. Returns `true` if the state changed.
    ///
    /// Markers (`Lost`, `Error`) and events from other commands are ignored.
    pub fn observe(&mut self, event: &DomainEvent) -> bool {
        let DomainEvent::Io(io) = event else {
            return false;
        };
        if io.comm != self.state.target {
            return false;
        }

        self.state.count += 1;
        let summary = EventSummary::from(io);
        if self.state.max_latency_ms().is_none_or(|max| summary.latency_ms > max) {
            self.state.max = Some(summary.clone());
        }
        self.state.last = Some(summary);
        true
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> AggregateState {
        self.state.clone()
    }
}
