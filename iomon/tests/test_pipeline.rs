use crossbeam_channel::{bounded, Receiver};
use iomon::domain::TracerError;
use iomon::sink::{ChannelSink, Update};
use iomon::tracer::decoder::{comm_from_str, encode, encode_fs};
use iomon::tracer::{
    Aggregator, ClosedSignal, DomainEvent, EventChannel, EventTracer, HookDescriptor,
    Instrumentation, IoLocation, IoOp, Pipeline, ReadOutcome, RecordKind, Translator,
    BIOSNOOP_HOOKS, EXT4_SLOWER_HOOKS,
};
use iomon_common::{BioEvent, FsEvent, FILE_NAME_LEN, FS_OP_FSYNC, FS_OP_WRITE};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Instrumentation that only records what it was asked to do
#[derive(Clone, Default)]
struct RecordingBackend(Arc<Mutex<Vec<String>>>);

impl RecordingBackend {
    fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Instrumentation for RecordingBackend {
    type Link = &'static str;

    fn attach(&mut self, hook: &HookDescriptor) -> Result<Self::Link, TracerError> {
        self.0.lock().unwrap().push(format!("attach:{}", hook.program));
        Ok(hook.program)
    }

    fn detach(&mut self, _hook: &HookDescriptor, link: Self::Link) -> Result<(), TracerError> {
        self.0.lock().unwrap().push(format!("detach:{link}"));
        Ok(())
    }

    fn release(&mut self) {
        self.0.lock().unwrap().push("release".to_string());
    }
}

/// Replays a fixed script, then waits for the tracer to close it
struct ScriptedChannel {
    script: VecDeque<ReadOutcome>,
    closed: ClosedSignal,
}

impl EventChannel for ScriptedChannel {
    async fn read(&mut self) -> Result<ReadOutcome, TracerError> {
        if let Some(outcome) = self.script.pop_front() {
            return Ok(outcome);
        }
        self.closed.closed().await;
        Ok(ReadOutcome::Closed)
    }
}

fn record(comm: &str, ts_ms: u64, latency_ms: u64) -> ReadOutcome {
    let event = BioEvent {
        comm: comm_from_str(comm),
        ts_ns: ts_ms * 1_000_000,
        delta_ns: latency_ms * 1_000_000,
        qdelta_ns: -1,
        len: 4096,
        cmd_flags: 1,
        ..Default::default()
    };
    ReadOutcome::Record(encode(&event))
}

fn start(
    script: Vec<ReadOutcome>,
) -> (EventTracer<RecordingBackend>, RecordingBackend, Receiver<Update>) {
    let backend = RecordingBackend::default();
    let (tx, rx) = bounded(64);
    let pipeline = Pipeline::new(Translator::new(false, None), Aggregator::new("etcd"), false);
    let tracer = EventTracer::start(
        backend.clone(),
        BIOSNOOP_HOOKS,
        move |_, closed| Ok(ScriptedChannel { script: script.into(), closed }),
        pipeline,
        ChannelSink::new(tx),
    )
    .unwrap();
    (tracer, backend, rx)
}

#[tokio::test]
async fn test_target_filtering_scenario() {
    let (mut tracer, _backend, rx) =
        start(vec![record("etcd", 0, 5), record("bash", 1, 50), record("etcd", 2, 12)]);

    let state = tracer.close().await.unwrap();
    assert_eq!(state.count, 2);
    assert_eq!(state.max_latency_ms(), Some(12.0));
    assert_eq!(state.last_latency_ms(), Some(12.0));

    let stats: Vec<u64> = rx
        .try_iter()
        .filter_map(|u| match u {
            Update::Stats(s) => Some(s.count),
            _ => None,
        })
        .collect();
    assert_eq!(stats, [1, 2]);
}

#[tokio::test]
async fn test_loss_scenario() {
    let (mut tracer, _backend, rx) =
        start(vec![record("etcd", 0, 3), ReadOutcome::Lost(7), record("etcd", 1, 9)]);

    let state = tracer.close().await.unwrap();
    assert_eq!(state.count, 2);
    assert_eq!(state.max_latency_ms(), Some(9.0));

    let losses: Vec<u64> = rx
        .try_iter()
        .filter_map(|u| match u {
            Update::Event(DomainEvent::Lost { count }) => Some(count),
            _ => None,
        })
        .collect();
    assert_eq!(losses, [7]);
}

#[tokio::test]
async fn test_close_twice_detaches_once() {
    let (mut tracer, backend, _rx) = start(vec![record("etcd", 0, 1)]);

    let first = tracer.close().await;
    let second = tracer.close().await;
    assert_eq!(first, second);
    assert_eq!(tracer.attached(), 0);

    let calls = backend.calls();
    let attaches = calls.iter().filter(|c| c.starts_with("attach:")).count();
    let detaches = calls.iter().filter(|c| c.starts_with("detach:")).count();
    assert_eq!(attaches, BIOSNOOP_HOOKS.len());
    assert_eq!(detaches, BIOSNOOP_HOOKS.len());
    assert_eq!(calls.iter().filter(|c| *c == "release").count(), 1);

    // Detach runs newest first
    assert_eq!(calls[BIOSNOOP_HOOKS.len()], "detach:z_block_rq_issue");
    assert_eq!(calls.last().map(String::as_str), Some("release"));
}

#[tokio::test]
async fn test_relative_time_in_published_events() {
    let backend = RecordingBackend::default();
    let (tx, rx) = bounded(64);
    let script = vec![record("etcd", 10_000, 1), record("etcd", 10_500, 1), record("etcd", 12_000, 1)];
    let mut tracer = EventTracer::start(
        backend,
        BIOSNOOP_HOOKS,
        move |_, closed| Ok(ScriptedChannel { script: script.into(), closed }),
        Pipeline::new(Translator::new(false, None), Aggregator::new("etcd"), true),
        ChannelSink::new(tx),
    )
    .unwrap();
    tracer.close().await;

    let times: Vec<f64> = rx
        .try_iter()
        .filter_map(|u| match u {
            Update::Event(DomainEvent::Io(io)) => Some(io.time_s),
            _ => None,
        })
        .collect();
    assert_eq!(times, [0.0, 0.5, 2.0]);
}

fn fs_record(comm: &str, op: u32, ts_ms: u64, latency_ms: u64) -> ReadOutcome {
    let mut file = [0u8; FILE_NAME_LEN];
    file[..8].copy_from_slice(b"wal-0001");
    let event = FsEvent {
        comm: comm_from_str(comm),
        file,
        ts_ns: ts_ms * 1_000_000,
        delta_ns: latency_ms * 1_000_000,
        offset: 4096,
        size: 512,
        pid: 7,
        op,
        ..Default::default()
    };
    ReadOutcome::Record(encode_fs(&event))
}

#[tokio::test]
async fn test_slow_filesystem_scenario() {
    let backend = RecordingBackend::default();
    let (tx, rx) = bounded(64);
    let script = vec![
        fs_record("etcd", FS_OP_WRITE, 0, 11),
        fs_record("etcd", FS_OP_FSYNC, 5, 40),
        fs_record("bash", FS_OP_FSYNC, 6, 90),
    ];
    let mut tracer = EventTracer::start(
        backend.clone(),
        EXT4_SLOWER_HOOKS,
        move |_, closed| Ok(ScriptedChannel { script: script.into(), closed }),
        Pipeline::new(
            Translator::new(false, None),
            Aggregator::new("etcd").with_kind(RecordKind::Filesystem),
            true,
        ),
        ChannelSink::new(tx),
    )
    .unwrap();

    let state = tracer.close().await.unwrap();
    assert_eq!(state.kind, RecordKind::Filesystem);
    assert_eq!(state.count, 2);
    assert_eq!(state.max.as_ref().map(|m| m.op), Some(IoOp::Fsync));
    assert_eq!(state.max_latency_ms(), Some(40.0));

    let files: Vec<(IoOp, String)> = rx
        .try_iter()
        .filter_map(|u| match u {
            Update::Event(DomainEvent::Io(io)) => match io.location {
                IoLocation::File { file, .. } => Some((io.op, file)),
                IoLocation::Block { .. } => None,
            },
            _ => None,
        })
        .collect();
    assert_eq!(files.len(), 3);
    assert_eq!(files[1], (IoOp::Fsync, "wal-0001".to_string()));
    assert_eq!(backend.calls().first().map(String::as_str), Some("attach:file_read_exit"));
}
