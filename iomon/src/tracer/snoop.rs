//! # Event Tracer
//!
//! Glues the hook lifecycle, the event channel and the consumer task into one
//! tracer instance. The block snoop and the filesystem slow-operation tracer
//! are both instances of [`EventTracer`], told apart by the record kind their
//! aggregator expects.
//!
//! ## Start
//!
//! 1. Attach every hook (fail-fast, rolled back by [`HookManager::install`])
//! 2. Open the event channel; on failure the hooks are detached again
//! 3. Spawn the consumer task
//!
//! ## Close
//!
//! Detach hooks → close the channel (wakes the reader) → wait for the reader →
//! release programs and maps. Safe to call any number of times.

use log::{info, warn};
use tokio::task::JoinHandle;

use super::channel::{close_pair, ChannelCloser, ClosedSignal, EventChannel};
use super::consumer::{self, Pipeline};
use super::hooks::HookDescriptor;
use super::lifecycle::{HookManager, Instrumentation};
use super::AggregateState;
use crate::domain::TracerError;
use crate::sink::Sink;

/// One running event tracer
pub struct EventTracer<I: Instrumentation> {
    hooks: HookManager<I>,
    closer: ChannelCloser,
    reader: Option<JoinHandle<Pipeline>>,
    final_state: Option<AggregateState>,
}

impl<I: Instrumentation> EventTracer<I> {
    /// Attach `hooks`, open the channel and start consuming.
    ///
    /// `open_channel` runs after every hook is attached and receives the
    /// signal the channel must observe to stop reading.
    ///
    /// # Errors
    /// Any attach or channel error; nothing stays attached in that case
    pub fn start<C, F, S>(
        backend: I,
        hooks: &[HookDescriptor],
        open_channel: F,
        pipeline: Pipeline,
        sink: S,
    ) -> Result<Self, TracerError>
    where
        C: EventChannel + 'static,
        F: FnOnce(&mut I, ClosedSignal) -> Result<C, TracerError>,
        S: Sink,
    {
        let mut hooks = HookManager::install(backend, hooks)?;

        let (closer, signal) = close_pair();
        let channel = match open_channel(hooks.backend_mut(), signal) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Failed to open event channel: {e}");
                hooks.close();
                hooks.release();
                return Err(e);
            }
        };

        let target = pipeline.aggregator.target().to_string();
        let kind = pipeline.aggregator.kind();
        let reader = tokio::spawn(consumer::run(channel, pipeline, sink));
        info!("✓ Tracing {} I/O for {target}", kind.label());

        Ok(Self { hooks, closer, reader: Some(reader), final_state: None })
    }

    /// `true` once the consumer task has exited (closed or failed)
    pub fn is_finished(&self) -> bool {
        self.reader.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Number of live hook attachments
    pub fn attached(&self) -> usize {
        self.hooks.attached()
    }

    /// Stop tracing and free kernel resources.
    ///
    /// Returns the final aggregate; later calls return the same value.
    pub async fn close(&mut self) -> Option<AggregateState> {
        self.hooks.close();
        self.closer.close();

        if let Some(reader) = self.reader.take() {
            match reader.await {
                Ok(pipeline) => self.final_state = Some(pipeline.aggregator.snapshot()),
                Err(e) => warn!("Consumer task ended abnormally: {e}"),
            }
        }

        self.hooks.release();
        self.final_state.clone()
    }
}
