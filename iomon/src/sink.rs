//! Update delivery from tracers to the display
//!
//! Producers never hold a reference to the display. They publish owned
//! [`Update`]s through a [`Sink`]; the provided [`ChannelSink`] forwards them
//! over a bounded crossbeam channel to the display thread.

use crossbeam_channel::{SendTimeoutError, Sender, TrySendError};
use log::{debug, warn};
use serde::Serialize;
use std::time::Duration;

use crate::tracer::{AggregateState, BarChart, DomainEvent, TopReport};

/// How long a marker or histogram may wait for channel capacity
const PUBLISH_TIMEOUT: Duration = Duration::from_millis(100);

/// One message for the display
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Update {
    /// A decoded I/O event or a loss/error marker
    Event(DomainEvent),
    /// Aggregate snapshot after an accepted event
    Stats(AggregateState),
    /// Latest latency histogram round
    Histogram(BarChart),
    /// Latest per-process top round
    Top(TopReport),
}

/// Receives updates; must not block for long
pub trait Sink: Send + 'static {
    fn publish(&self, update: Update);
}

/// [`Sink`] over a bounded crossbeam channel
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<Update>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Update>) -> Self {
        Self { tx }
    }
}

impl Sink for ChannelSink {
    fn publish(&self, update: Update) {
        match update {
            // The next snapshot supersedes this one
            Update::Stats(_) => match self.tx.try_send(update) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => debug!("Display busy, stats snapshot dropped"),
            },
            update => match self.tx.send_timeout(update, PUBLISH_TIMEOUT) {
                Ok(()) | Err(SendTimeoutError::Disconnected(_)) => {}
                Err(SendTimeoutError::Timeout(dropped)) => {
                    warn!("Display stalled, dropped update: {dropped:?}");
                }
            },
        }
    }
}
