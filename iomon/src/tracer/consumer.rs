//! Ring buffer read loop
//!
//! Each record is decoded, translated, aggregated and published before the
//! next read, so the loop holds no queue of its own.

use log::{debug, error, warn};

use super::aggregator::Aggregator;
use super::channel::{EventChannel, ReadOutcome};
use super::translator::{DomainEvent, Translator};
use crate::sink::{Sink, Update};

/// Per-tracer processing state, moved into the consumer task.
///
/// Records are decoded as the [`RecordKind`](super::decoder::RecordKind) the
/// aggregator was built with.
pub struct Pipeline {
    pub translator: Translator,
    pub aggregator: Aggregator,
    /// Forward every decoded I/O event, not only stats
    pub emit_events: bool,
}

impl Pipeline {
    pub fn new(translator: Translator, aggregator: Aggregator, emit_events: bool) -> Self {
        Self { translator, aggregator, emit_events }
    }

    fn handle_record<S: Sink>(&mut self, bytes: &[u8], sink: &S) {
        let raw = match self.aggregator.kind().decode(bytes) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Skipping malformed record: {e}");
                return;
            }
        };

        let event = self.translator.translate(&raw);
        if self.aggregator.observe(&event) {
            sink.publish(Update::Stats(self.aggregator.snapshot()));
        }
        if self.emit_events {
            sink.publish(Update::Event(event));
        }
    }
}

/// Consume `channel` until it is closed or fails. Returns the pipeline so the
/// caller can inspect the final state.
pub async fn run<C, S>(mut channel: C, mut pipeline: Pipeline, sink: S) -> Pipeline
where
    C: EventChannel,
    S: Sink,
{
    loop {
        match channel.read().await {
            Ok(ReadOutcome::Record(bytes)) => pipeline.handle_record(&bytes, &sink),
            Ok(ReadOutcome::Lost(count)) => {
                warn!("Lost {count} events");
                sink.publish(Update::Event(DomainEvent::Lost { count }));
            }
            Ok(ReadOutcome::Closed) => {
                debug!("Consumer for {} stopped", pipeline.aggregator.target());
                break;
            }
            Err(e) => {
                error!("{e}");
                sink.publish(Update::Event(DomainEvent::Error { message: e.to_string() }));
                break;
            }
        }
    }
    pipeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TracerError;
    use crate::tracer::decoder::{comm_from_str, encode, encode_fs, RecordKind};
    use iomon_common::{BioEvent, FsEvent, FS_OP_FSYNC};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct ScriptedChannel(VecDeque<Result<ReadOutcome, TracerError>>);

    impl EventChannel for ScriptedChannel {
        async fn read(&mut self) -> Result<ReadOutcome, TracerError> {
            self.0.pop_front().unwrap_or(Ok(ReadOutcome::Closed))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<Update>>>);

    impl Sink for RecordingSink {
        fn publish(&self, update: Update) {
            self.0.lock().unwrap().push(update);
        }
    }

    fn record(comm: &str, ts_ms: u64, latency_ms: u64) -> Result<ReadOutcome, TracerError> {
        let event = BioEvent {
            comm: comm_from_str(comm),
            ts_ns: ts_ms * 1_000_000,
            delta_ns: latency_ms * 1_000_000,
            qdelta_ns: -1,
            ..Default::default()
        };
        Ok(ReadOutcome::Record(encode(&event)))
    }

    fn pipeline(emit_events: bool) -> Pipeline {
        Pipeline::new(Translator::new(false, None), Aggregator::new("etcd"), emit_events)
    }

    #[tokio::test]
    async fn test_stats_published_only_for_target() {
        let channel = ScriptedChannel(
            [record("etcd", 0, 5), record("bash", 1, 50), record("etcd", 2, 12)].into(),
        );
        let sink = RecordingSink::default();
        let done = run(channel, pipeline(false), sink.clone()).await;

        let updates = sink.0.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(done.aggregator.snapshot().count, 2);
        assert_eq!(done.aggregator.snapshot().max_latency_ms(), Some(12.0));
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped() {
        let channel = ScriptedChannel(
            [Ok(ReadOutcome::Record(vec![0u8; 5])), record("etcd", 0, 1)].into(),
        );
        let done = run(channel, pipeline(false), RecordingSink::default()).await;
        assert_eq!(done.aggregator.snapshot().count, 1);
    }

    #[tokio::test]
    async fn test_stream_error_publishes_one_marker_and_stops() {
        let channel = ScriptedChannel(
            [
                Err(TracerError::Stream("EBADF".to_string())),
                record("etcd", 0, 1),
            ]
            .into(),
        );
        let sink = RecordingSink::default();
        let done = run(channel, pipeline(true), sink.clone()).await;

        let updates = sink.0.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert!(matches!(&updates[0], Update::Event(DomainEvent::Error { message }) if message.contains("EBADF")));
        assert_eq!(done.aggregator.snapshot().count, 0);
    }

    #[tokio::test]
    async fn test_filesystem_pipeline_decodes_fs_records() {
        let fsync = FsEvent {
            comm: comm_from_str("etcd"),
            delta_ns: 25_000_000,
            op: FS_OP_FSYNC,
            ..Default::default()
        };
        let channel = ScriptedChannel(
            [
                Ok(ReadOutcome::Record(encode_fs(&fsync))),
                // A block record has the wrong width for this stream
                record("etcd", 0, 1),
            ]
            .into(),
        );
        let pipeline = Pipeline::new(
            Translator::new(false, None),
            Aggregator::new("etcd").with_kind(RecordKind::Filesystem),
            false,
        );
        let done = run(channel, pipeline, RecordingSink::default()).await;

        let state = done.aggregator.snapshot();
        assert_eq!(state.count, 1);
        assert_eq!(state.max.map(|m| m.op), Some(crate::tracer::IoOp::Fsync));
    }

    #[tokio::test]
    async fn test_emit_events_forwards_everything() {
        let channel = ScriptedChannel([record("bash", 0, 1), record("etcd", 1, 2)].into());
        let sink = RecordingSink::default();
        run(channel, pipeline(true), sink.clone()).await;

        let updates = sink.0.lock().unwrap();
        let events = updates.iter().filter(|u| matches!(u, Update::Event(_))).count();
        let stats = updates.iter().filter(|u| matches!(u, Update::Stats(_))).count();
        assert_eq!((events, stats), (2, 1));
    }
}
