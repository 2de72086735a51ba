//! # Kernel → Userspace Event Channel
//!
//! [`EventChannel::read`] blocks until the next record, a loss report, or the
//! channel being closed from outside. Closing (via [`ChannelCloser`]) is the
//! only way to unblock a waiting reader.
//!
//! [`RingChannel`] is the aya implementation over a BPF ring buffer map. BPF
//! ring buffers do not report drops by themselves; the artifact counts failed
//! reservations in a per-CPU `DROPPED` array and the reader turns increases
//! of that counter into [`ReadOutcome::Lost`]. The counter is checked whenever
//! the ring drains and, while it stays busy, every [`LOSS_CHECK_RECORDS`]
//! records or [`LOSS_CHECK_INTERVAL`], whichever comes first.

use aya::maps::{MapData, PerCpuArray, RingBuf};
use log::debug;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;

use crate::domain::TracerError;

/// Result of one read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One complete raw record
    Record(Vec<u8>),
    /// Records dropped by the kernel since the previous read
    Lost(u64),
    /// The channel was closed from outside; expected termination
    Closed,
}

/// A blocking source of raw records
pub trait EventChannel: Send {
    /// Wait for the next outcome
    ///
    /// # Errors
    /// Any failure other than an orderly close. The stream is unusable afterwards.
    fn read(&mut self) -> impl Future<Output = Result<ReadOutcome, TracerError>> + Send;
}

/// Closes the paired [`ClosedSignal`]; dropping the closer closes it too
#[derive(Debug)]
pub struct ChannelCloser(watch::Sender<bool>);

impl ChannelCloser {
    pub fn close(&self) {
        self.0.send_replace(true);
    }
}

/// Reader side of the close handshake
#[derive(Debug, Clone)]
pub struct ClosedSignal(watch::Receiver<bool>);

impl ClosedSignal {
    pub fn is_closed(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }

    /// Resolves once the channel is closed (or the closer is gone)
    pub async fn closed(&mut self) {
        // Err means the sender was dropped, which counts as closed
        let _ = self.0.wait_for(|closed| *closed).await;
    }
}

/// Create a linked closer/signal pair
pub fn close_pair() -> (ChannelCloser, ClosedSignal) {
    let (tx, rx) = watch::channel(false);
    (ChannelCloser(tx), ClosedSignal(rx))
}

/// Records read between two loss checks on a busy ring
pub const LOSS_CHECK_RECORDS: u32 = 256;

/// Time between two loss checks on a busy ring
pub const LOSS_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Turns a running drop counter into per-read loss deltas
#[derive(Debug)]
pub struct LossTracker {
    seen: u64,
    records: u32,
    checked_at: Instant,
}

impl LossTracker {
    /// Start from `total`; drops already counted are not reported
    pub fn new(total: u64) -> Self {
        Self { seen: total, records: 0, checked_at: Instant::now() }
    }

    /// Count one delivered record
    pub fn record(&mut self) {
        self.records = self.records.saturating_add(1);
    }

    /// Whether a busy ring should check the counter before the next record
    pub fn due(&self) -> bool {
        self.records >= LOSS_CHECK_RECORDS || self.checked_at.elapsed() >= LOSS_CHECK_INTERVAL
    }

    /// Take a new counter total; returns the drops since the previous one
    pub fn update(&mut self, total: u64) -> Option<u64> {
        let lost = total.wrapping_sub(self.seen);
        self.seen = total;
        self.records = 0;
        self.checked_at = Instant::now();
        (lost > 0).then_some(lost)
    }
}

/// BPF ring buffer reader with loss accounting
pub struct RingChannel {
    ring: AsyncFd<RingBuf<MapData>>,
    dropped: Option<PerCpuArray<MapData, u64>>,
    loss: LossTracker,
    closed: ClosedSignal,
}

impl RingChannel {
    /// Wrap an opened ring buffer.
    ///
    /// # Errors
    /// Returns an error if the ring buffer fd cannot be registered with tokio
    pub fn new(
        ring: RingBuf<MapData>,
        dropped: Option<PerCpuArray<MapData, u64>>,
        closed: ClosedSignal,
    ) -> Result<Self, TracerError> {
        // Drops from before we started listening are not ours to report
        let loss = LossTracker::new(dropped_total(dropped.as_ref())?);
        let ring = AsyncFd::try_new(ring).map_err(|e| TracerError::Io(e.into_parts().1))?;
        Ok(Self { ring, dropped, loss, closed })
    }

    fn take_lost(&mut self) -> Result<Option<u64>, TracerError> {
        let total = dropped_total(self.dropped.as_ref())?;
        Ok(self.loss.update(total))
    }
}

fn dropped_total(dropped: Option<&PerCpuArray<MapData, u64>>) -> Result<u64, TracerError> {
    let Some(dropped) = dropped else {
        return Ok(0);
    };
    let per_cpu = dropped.get(&0, 0)?;
    Ok(per_cpu.iter().copied().fold(0u64, u64::wrapping_add))
}

impl EventChannel for RingChannel {
    async fn read(&mut self) -> Result<ReadOutcome, TracerError> {
        loop {
            if self.closed.is_closed() {
                return Ok(ReadOutcome::Closed);
            }

            // A ring that never drains still reports its drops
            if self.loss.due() {
                if let Some(lost) = self.take_lost()? {
                    return Ok(ReadOutcome::Lost(lost));
                }
            }

            if let Some(item) = self.ring.get_mut().next() {
                let record = item.to_vec();
                drop(item);
                self.loss.record();
                return Ok(ReadOutcome::Record(record));
            }

            // Drained: report drops before sleeping
            if let Some(lost) = self.take_lost()? {
                return Ok(ReadOutcome::Lost(lost));
            }

            tokio::select! {
                () = self.closed.closed() => {
                    debug!("Ring buffer closed");
                    return Ok(ReadOutcome::Closed);
                }
                guard = self.ring.readable_mut() => {
                    let mut guard = guard.map_err(|e| TracerError::Stream(e.to_string()))?;
                    // Re-checked by the loop, so no wakeup is lost
                    guard.clear_ready();
                }
            }
        }
    }
}
