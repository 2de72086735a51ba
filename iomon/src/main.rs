//! # iomon - Main Entry Point
//!
//! Starts the requested pipelines, forwards their updates to the display
//! thread and tears everything down on SIGINT/SIGTERM or after `--duration`.

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Sender};
use log::{info, warn};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, SignalKind};

use iomon::cli::{Args, Panel};
use iomon::display;
use iomon::preflight::run_preflight_checks;
use iomon::sink::{ChannelSink, Update};
use iomon::tracer::{
    AggregateState, Aggregator, AyaInstrumentation, Enricher, EventTracer, HistogramEngine,
    HookDescriptor, LoaderOptions, Pipeline, ProcMountNsEnricher, RecordKind, Sampler,
    SamplerStats, SamplingEngine, StopSignal, TopEngine, Translator, BIOSNOOP_HOOKS,
    EXT4_SLOWER_HOOKS,
};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

/// Capacity of the tracer → display channel
const DISPLAY_QUEUE: usize = 1000;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") || msg.contains("requires root") {
        EXIT_NOPERM
    } else {
        EXIT_ERROR
    }
}

fn enricher(args: &Args) -> Result<Option<Box<dyn Enricher>>> {
    if !args.enrich {
        return Ok(None);
    }
    let enricher = ProcMountNsEnricher::new().context("Failed to start mount namespace scanner")?;
    Ok(Some(Box::new(enricher)))
}

fn start_tracer(
    args: &Args,
    options: &LoaderOptions,
    hooks: &[HookDescriptor],
    kind: RecordKind,
    update_tx: &Sender<Update>,
) -> Result<EventTracer<AyaInstrumentation>> {
    let what = kind.label();
    let backend = AyaInstrumentation::load(options)
        .with_context(|| format!("Failed to load {what} I/O artifact"))?;
    let pipeline = Pipeline::new(
        Translator::new(args.queued, enricher(args)?),
        Aggregator::new(args.comm.clone()).with_kind(kind),
        args.events,
    );
    EventTracer::start(
        backend,
        hooks,
        AyaInstrumentation::open_channel,
        pipeline,
        ChannelSink::new(update_tx.clone()),
    )
    .with_context(|| format!("Failed to start {what} I/O tracer"))
}

fn start_sampler<E: SamplingEngine>(
    engine: E,
    name: &str,
    args: &Args,
    stop: &StopSignal,
    update_tx: &Sender<Update>,
) -> Result<JoinHandle<SamplerStats>> {
    let sink = ChannelSink::new(update_tx.clone());
    let sampler = Sampler::new(engine, sink, args.round_budget(), stop.clone())
        .context("Failed to spawn sampling worker")?;
    sampler.spawn(name).with_context(|| format!("Failed to spawn {name} thread"))
}

fn summarize(state: &AggregateState) -> String {
    format!(
        "{} {} ops from {}, slowest {}",
        state.count,
        state.kind.label(),
        state.target,
        state.max_latency_ms().map_or_else(|| "n/a".to_string(), |ms| format!("{ms:.2}ms")),
    )
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    run_preflight_checks(&args.artifacts())?;

    if !quiet {
        println!("iomon v{}", env!("CARGO_PKG_VERSION"));
        println!("target: {}", args.comm);
        if let Some(device) = args.device {
            println!("device: {device}");
        }
    }

    // Display thread exits once every sink is dropped
    let (update_tx, update_rx) = bounded(DISPLAY_QUEUE);
    let json = args.json;
    let display_handle = std::thread::Builder::new()
        .name("iomon-display".to_string())
        .spawn(move || display::run(&update_rx, json, std::io::stdout().lock()))
        .context("Failed to spawn display thread")?;

    // ── Event tracers ────────────────────────────────────────────────────
    let mut tracers = Vec::new();
    if args.has(Panel::Fsslower) {
        let tracer = start_tracer(
            &args,
            &args.fs_options(),
            EXT4_SLOWER_HOOKS,
            RecordKind::Filesystem,
            &update_tx,
        )?;
        tracers.push(tracer);
    }
    if args.has(Panel::Snoop) {
        let tracer =
            start_tracer(&args, &args.snoop_options(), BIOSNOOP_HOOKS, RecordKind::Block, &update_tx)?;
        tracers.push(tracer);
    }

    // ── Interval samplers ────────────────────────────────────────────────
    let stop = StopSignal::new();
    let mut samplers = Vec::new();
    if args.has(Panel::Top) {
        let engine = TopEngine::start(&args.top_options(), args.comm.clone(), args.max_top_rows())
            .context("Failed to start block I/O top")?;
        samplers.push(start_sampler(engine, "iomon-top", &args, &stop, &update_tx)?);
    }
    if args.has(Panel::Latency) {
        let engine = HistogramEngine::start(&args.hist_options())
            .context("Failed to start latency histogram")?;
        samplers.push(start_sampler(engine, "iomon-latency", &args, &stop, &update_tx)?);
    }
    drop(update_tx);

    // ── Wait for a reason to stop ────────────────────────────────────────
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = Instant::now();
    let duration_limit = args.duration_limit();
    let exit_reason = loop {
        if duration_limit.is_some_and(|limit| started.elapsed() >= limit) {
            break "duration limit reached";
        }
        if tracers.iter().any(EventTracer::is_finished) {
            break "event stream ended";
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c => break "interrupted",
            _ = sigterm.recv() => break "terminated",
        }
    };
    info!("Shutting down: {exit_reason}");

    // ── Teardown ─────────────────────────────────────────────────────────
    let mut final_states = Vec::new();
    for tracer in &mut tracers {
        final_states.extend(tracer.close().await);
    }

    stop.stop();
    for handle in samplers {
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(stats)) => {
                info!("Sampler: {} rounds, {} failed", stats.rounds, stats.failed);
            }
            _ => warn!("Sampler thread panicked"),
        }
    }

    // All sinks are gone now; the display drains and exits
    drop(tracers);
    let shown = display_handle.join().ok();

    if !quiet {
        eprintln!("\n{exit_reason}: {:.1}s", started.elapsed().as_secs_f64());
        for state in &final_states {
            eprintln!("  {}", summarize(state));
        }
        if let Some(shown) = shown {
            if shown.lost > 0 {
                eprintln!("warning: {} loss reports", shown.lost);
            }
        }
    }

    Ok(())
}
