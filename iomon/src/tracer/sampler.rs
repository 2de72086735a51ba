//! # Bounded-Round Sampler
//!
//! Repeatedly runs a time-boxed round against a [`SamplingEngine`] and
//! publishes the decoded interval report.
//!
//! ```text
//! Idle → RoundStarting → RoundRunning → RoundComplete → RoundStarting → …
//!              └──────────────┴───────────────┴──→ Stopped (stop signal)
//! ```
//!
//! The engine lives on a worker thread owned by the sampler. Entering
//! `RoundRunning` hands the round to the worker; leaving it waits for the
//! result until the deadline plus [`LATE_TOLERANCE`] and no longer. A worker
//! stuck in an engine call is left behind, and its late result is discarded
//! by round id.
//!
//! The stop signal is observed between transitions only. Failed rounds
//! (engine error, timeout or a malformed report) are logged, counted and
//! followed immediately by the next round.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use log::{debug, error, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::domain::RoundError;
use crate::sink::{Sink, Update};

/// Minimum `max_value` of a chart so small counts don't fill the scale
pub const MIN_CHART_MAX: u64 = 20;

/// How far past its deadline a round may still return a result
pub const LATE_TOLERANCE: Duration = Duration::from_millis(100);

/// Time box of one round
#[derive(Debug, Clone, Copy)]
pub struct RoundContext {
    pub deadline: Instant,
    pub budget: Duration,
}

impl RoundContext {
    pub fn new(budget: Duration) -> Self {
        Self { deadline: Instant::now() + budget, budget }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Last instant a result is still accepted
    pub fn cutoff(&self) -> Instant {
        self.deadline + LATE_TOLERANCE
    }
}

/// A report format the sampler can decode and publish
pub trait RoundReport: DeserializeOwned {
    fn into_update(self) -> Update;
}

/// Produces one serialized report per round
pub trait SamplingEngine: Send + 'static {
    /// Report format of [`run_once`](Self::run_once)
    type Report: RoundReport;

    /// Run a round; should return by `ctx.deadline` (a late result is discarded)
    ///
    /// # Errors
    /// [`RoundError::Engine`] when the round could not be run
    fn run_once(&mut self, ctx: &RoundContext) -> Result<Vec<u8>, RoundError>;
}

/// One histogram bin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub count: u64,
    pub start: u64,
    pub end: u64,
}

/// Histogram engine output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    #[serde(default)]
    pub val_type: String,
    #[serde(default)]
    pub intervals: Vec<Interval>,
}

impl RoundReport for Report {
    fn into_update(self) -> Update {
        Update::Histogram(BarChart::from(&self))
    }
}

/// Display-ready form of a [`Report`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarChart {
    pub values: Vec<u64>,
    pub labels: Vec<String>,
    pub max_value: u64,
    pub unit: String,
}

impl From<&Report> for BarChart {
    fn from(report: &Report) -> Self {
        let values: Vec<u64> = report.intervals.iter().map(|i| i.count).collect();
        let labels = report.intervals.iter().map(|i| format!("{}-{}", i.start, i.end)).collect();
        let max_value = values.iter().copied().max().unwrap_or(0).max(MIN_CHART_MAX);
        Self { values, labels, max_value, unit: report.val_type.clone() }
    }
}

/// Sampler position in its round cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    RoundStarting,
    RoundRunning,
    RoundComplete,
    Stopped,
}

/// Shared stop flag
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Round counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub rounds: u64,
    pub published: u64,
    pub failed: u64,
}

struct RoundRequest {
    id: u64,
    ctx: RoundContext,
}

struct RoundResult {
    id: u64,
    report: Result<Vec<u8>, RoundError>,
}

type DecodeFn = fn(&[u8]) -> Result<Update, RoundError>;

fn decode_report<R: RoundReport>(bytes: &[u8]) -> Result<Update, RoundError> {
    Ok(serde_json::from_slice::<R>(bytes)?.into_update())
}

/// Run rounds for `engine` until the sampler hangs up
fn spawn_worker<E: SamplingEngine>(
    mut engine: E,
) -> std::io::Result<(Sender<RoundRequest>, Receiver<RoundResult>)> {
    let (requests, worker_requests) = bounded::<RoundRequest>(1);
    let (worker_results, results) = bounded(1);

    std::thread::Builder::new().name("iomon-round".to_string()).spawn(move || {
        for request in worker_requests {
            let report = engine.run_once(&request.ctx);
            if worker_results.send(RoundResult { id: request.id, report }).is_err() {
                break;
            }
        }
    })?;
    Ok((requests, results))
}

pub struct Sampler<S: Sink> {
    requests: Sender<RoundRequest>,
    results: Receiver<RoundResult>,
    decode: DecodeFn,
    sink: S,
    budget: Duration,
    stop: StopSignal,
    state: SamplerState,
    round: Option<RoundContext>,
    stats: SamplerStats,
}

impl<S: Sink> Sampler<S> {
    /// Move `engine` onto its worker thread
    ///
    /// # Errors
    /// Returns an error if the worker thread cannot be spawned
    pub fn new<E: SamplingEngine>(
        engine: E,
        sink: S,
        budget: Duration,
        stop: StopSignal,
    ) -> std::io::Result<Self> {
        let (requests, results) = spawn_worker(engine)?;
        Ok(Self {
            requests,
            results,
            decode: decode_report::<E::Report>,
            sink,
            budget,
            stop,
            state: SamplerState::Idle,
            round: None,
            stats: SamplerStats::default(),
        })
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    /// Advance one transition and return the new state
    pub fn step(&mut self) -> SamplerState {
        if self.stop.is_stopped() {
            self.state = SamplerState::Stopped;
            return self.state;
        }

        self.state = match self.state {
            SamplerState::Idle | SamplerState::RoundComplete => {
                self.round = Some(RoundContext::new(self.budget));
                SamplerState::RoundStarting
            }
            SamplerState::RoundStarting => {
                self.stats.rounds += 1;
                let ctx = *self.round.get_or_insert_with(|| RoundContext::new(self.budget));
                match self.dispatch(ctx) {
                    Ok(()) => SamplerState::RoundRunning,
                    Err(e) => self.abandon(&e),
                }
            }
            SamplerState::RoundRunning => {
                match self.collect().and_then(|bytes| self.publish(&bytes)) {
                    Ok(()) => SamplerState::RoundComplete,
                    Err(e) => self.abandon(&e),
                }
            }
            SamplerState::Stopped => SamplerState::Stopped,
        };
        self.state
    }

    fn dispatch(&self, ctx: RoundContext) -> Result<(), RoundError> {
        let request = RoundRequest { id: self.stats.rounds, ctx };
        // Only waits while a request for an abandoned round is still queued
        let wait = ctx.cutoff().saturating_duration_since(Instant::now());
        match self.requests.send_timeout(request, wait) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(RoundError::Timeout(ctx.budget)),
            Err(SendTimeoutError::Disconnected(_)) => Err(RoundError::WorkerExited),
        }
    }

    fn collect(&self) -> Result<Vec<u8>, RoundError> {
        let ctx = self.round.ok_or(RoundError::WorkerExited)?;
        loop {
            match self.results.recv_deadline(ctx.cutoff()) {
                Ok(result) if result.id == self.stats.rounds => return result.report,
                Ok(stale) => debug!("Discarding late result of round {}", stale.id),
                Err(RecvTimeoutError::Timeout) => return Err(RoundError::Timeout(ctx.budget)),
                Err(RecvTimeoutError::Disconnected) => return Err(RoundError::WorkerExited),
            }
        }
    }

    fn publish(&mut self, bytes: &[u8]) -> Result<(), RoundError> {
        let update = (self.decode)(bytes)?;
        self.sink.publish(update);
        self.stats.published += 1;
        Ok(())
    }

    fn abandon(&mut self, error: &RoundError) -> SamplerState {
        self.stats.failed += 1;
        self.round = None;
        if matches!(error, RoundError::WorkerExited) {
            error!("Sampling stopped: {error}");
            return SamplerState::Stopped;
        }
        debug!("Sampling round abandoned: {error}");
        SamplerState::RoundComplete
    }

    /// Run rounds until stopped, or until `max_rounds` rounds have run
    pub fn run(&mut self, max_rounds: Option<u64>) -> SamplerStats {
        loop {
            let state = self.step();
            if state == SamplerState::Stopped {
                break;
            }
            if state == SamplerState::RoundComplete
                && max_rounds.is_some_and(|max| self.stats.rounds >= max)
            {
                self.state = SamplerState::Stopped;
                break;
            }
        }
        info!(
            "Sampler stopped after {} rounds ({} published, {} failed)",
            self.stats.rounds, self.stats.published, self.stats.failed
        );
        self.stats
    }

    /// Run on a named thread until `stop` is raised
    ///
    /// The engine worker is not joined; one stuck in a round exits with the
    /// process.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned
    pub fn spawn(self, name: &str) -> std::io::Result<JoinHandle<SamplerStats>> {
        let mut sampler = self;
        std::thread::Builder::new().name(name.to_string()).spawn(move || sampler.run(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<Update>>>);

    impl Sink for RecordingSink {
        fn publish(&self, update: Update) {
            self.0.lock().unwrap().push(update);
        }
    }

    struct FixedEngine(&'static str);

    impl SamplingEngine for FixedEngine {
        type Report = Report;

        fn run_once(&mut self, _ctx: &RoundContext) -> Result<Vec<u8>, RoundError> {
            Ok(self.0.as_bytes().to_vec())
        }
    }

    #[test]
    fn test_chart_from_report() {
        let report = Report {
            val_type: "usecs".to_string(),
            intervals: vec![
                Interval { count: 5, start: 0, end: 1 },
                Interval { count: 30, start: 1, end: 2 },
            ],
        };
        let chart = BarChart::from(&report);
        assert_eq!(chart.values, [5, 30]);
        assert_eq!(chart.labels, ["0-1", "1-2"]);
        assert_eq!(chart.max_value, 30);
    }

    #[test]
    fn test_empty_report_uses_floor() {
        let chart = BarChart::from(&Report { val_type: String::new(), intervals: vec![] });
        assert_eq!(chart.max_value, MIN_CHART_MAX);
        assert!(chart.values.is_empty());
        assert!(chart.labels.is_empty());
    }

    #[test]
    fn test_state_cycle() {
        let mut sampler = Sampler::new(
            FixedEngine(r#"{"valType":"usecs","intervals":[]}"#),
            RecordingSink::default(),
            Duration::from_secs(1),
            StopSignal::new(),
        )
        .unwrap();
        assert_eq!(sampler.state(), SamplerState::Idle);
        assert_eq!(sampler.step(), SamplerState::RoundStarting);
        assert_eq!(sampler.step(), SamplerState::RoundRunning);
        assert_eq!(sampler.step(), SamplerState::RoundComplete);
        assert_eq!(sampler.step(), SamplerState::RoundStarting);
    }

    #[test]
    fn test_stop_between_transitions() {
        let stop = StopSignal::new();
        let mut sampler = Sampler::new(
            FixedEngine("{}"),
            RecordingSink::default(),
            Duration::from_secs(1),
            stop.clone(),
        )
        .unwrap();
        sampler.step();
        stop.stop();
        assert_eq!(sampler.step(), SamplerState::Stopped);
        assert_eq!(sampler.step(), SamplerState::Stopped);
        assert_eq!(sampler.stats().rounds, 0);
    }

    #[test]
    fn test_malformed_report_is_retried() {
        let sink = RecordingSink::default();
        let mut sampler = Sampler::new(
            FixedEngine("not json"),
            sink.clone(),
            Duration::from_secs(1),
            StopSignal::new(),
        )
        .unwrap();
        let stats = sampler.run(Some(3));
        assert_eq!(stats, SamplerStats { rounds: 3, published: 0, failed: 3 });
        assert!(sink.0.lock().unwrap().is_empty());
    }

    /// Never returns within any reasonable round budget
    struct HangingEngine;

    impl SamplingEngine for HangingEngine {
        type Report = Report;

        fn run_once(&mut self, _ctx: &RoundContext) -> Result<Vec<u8>, RoundError> {
            std::thread::sleep(Duration::from_secs(2));
            Ok(b"{}".to_vec())
        }
    }

    #[test]
    fn test_engine_runs_while_round_running() {
        let (entered, engine_entered) = bounded(1);
        struct SignallingEngine(Sender<()>);
        impl SamplingEngine for SignallingEngine {
            type Report = Report;

            fn run_once(&mut self, _ctx: &RoundContext) -> Result<Vec<u8>, RoundError> {
                let _ = self.0.send(());
                Ok(b"{}".to_vec())
            }
        }

        let mut sampler = Sampler::new(
            SignallingEngine(entered),
            RecordingSink::default(),
            Duration::from_secs(1),
            StopSignal::new(),
        )
        .unwrap();
        assert_eq!(sampler.step(), SamplerState::RoundStarting);
        assert!(engine_entered.try_recv().is_err());
        assert_eq!(sampler.step(), SamplerState::RoundRunning);
        assert!(engine_entered.recv_timeout(Duration::from_secs(1)).is_ok());
        assert_eq!(sampler.step(), SamplerState::RoundComplete);
    }

    #[test]
    fn test_hanging_engine_times_out_at_deadline() {
        let mut sampler = Sampler::new(
            HangingEngine,
            RecordingSink::default(),
            Duration::from_millis(50),
            StopSignal::new(),
        )
        .unwrap();

        let started = Instant::now();
        let stats = sampler.run(Some(2));
        assert!(started.elapsed() < Duration::from_secs(1), "waited {:?}", started.elapsed());
        assert_eq!(stats, SamplerStats { rounds: 2, published: 0, failed: 2 });
    }

    #[test]
    fn test_report_without_intervals_field() {
        let report: Report = serde_json::from_str(r#"{"valType":"usecs"}"#).unwrap();
        assert!(report.intervals.is_empty());
    }
}
