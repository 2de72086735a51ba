//! Block and filesystem I/O tracing pipelines
//!
//! Leaves first: hook descriptors and their lifecycle, the event channel,
//! record decoding, translation, aggregation, and the consumer task tying them
//! together. The sampler drives the interval engines (latency histogram and
//! per-process top) on a separate path.

pub mod aggregator;
pub mod channel;
pub mod consumer;
pub mod decoder;
pub mod ebpf_setup;
pub mod enrich;
pub mod histogram;
pub mod hooks;
pub mod lifecycle;
pub mod sampler;
pub mod snoop;
pub mod top;
pub mod translator;

pub use aggregator::{AggregateState, Aggregator, EventSummary};
pub use channel::{
    close_pair, ChannelCloser, ClosedSignal, EventChannel, LossTracker, ReadOutcome, RingChannel,
};
pub use consumer::Pipeline;
pub use decoder::{decode, decode_fs, RawEvent, RecordKind};
pub use ebpf_setup::{init_ebpf_logger, load_artifact, AyaInstrumentation, LoaderOptions};
pub use enrich::{scan_proc, ProcMountNsEnricher};
pub use histogram::HistogramEngine;
pub use hooks::{
    HookDescriptor, HookPoint, KernelSymbols, BIOLATENCY_HOOKS, BIOSNOOP_HOOKS, BIOTOP_HOOKS,
    EXT4_SLOWER_HOOKS,
};
pub use lifecycle::{HookManager, Instrumentation};
pub use sampler::{
    BarChart, Interval, Report, RoundContext, RoundReport, Sampler, SamplerState, SamplerStats,
    SamplingEngine, StopSignal,
};
pub use snoop::EventTracer;
pub use top::{build_top_report, TopEngine, TopReport, TopRow, DEFAULT_MAX_ROWS};
pub use translator::{
    DomainEvent, Enricher, IoEvent, IoLocation, IoOp, NamespaceMetadata, Translator,
};
