//! # eBPF Artifact Loading and Attachment
//!
//! The kernel programs ship as a pre-built eBPF ELF object. This module loads
//! it with the load-time globals applied and implements [`Instrumentation`]
//! over the resulting [`Ebpf`] handle.
//!
//! ## Load-time configuration
//!
//! | global        | type  | source              |
//! |---------------|-------|---------------------|
//! | `min_ns`      | `u64` | `--min-latency-ms`  |
//! | `targ_queued` | `u8`  | `--queued`          |
//! | `filter_dev`  | `u8`  | `--device` given    |
//! | `targ_dev`    | `u32` | `--device MAJ:MIN`  |
//!
//! The filesystem artifact reads `min_ns` for its slow-operation threshold.
//! Globals the artifact does not declare are skipped. The `EVENTS` ring buffer
//! is resized to `ring_pages` pages.

#![allow(unsafe_code)] // sysconf() requires unsafe

use aya::{
    maps::{Array, HashMap, PerCpuArray, RingBuf},
    programs::{
        kprobe::KProbeLinkId, raw_trace_point::RawTracePointLinkId, KProbe, RawTracePoint,
    },
    Ebpf, EbpfLoader,
};
use aya_log::EbpfLogger;
use iomon_common::{
    TopKey, TopValue, DROPPED_MAP, EVENTS_MAP, GLOBAL_FILTER_DEV, GLOBAL_MIN_NS, GLOBAL_TARG_DEV,
    GLOBAL_TARG_QUEUED,
};
use log::{debug, info, warn};
use std::path::PathBuf;

use super::channel::{ClosedSignal, RingChannel};
use super::hooks::{HookDescriptor, HookPoint, KernelSymbols};
use super::lifecycle::Instrumentation;
use crate::domain::{DeviceId, TracerError};

/// Fallback when sysconf cannot tell us
const DEFAULT_PAGE_SIZE: u32 = 4096;

/// How to load an artifact
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub artifact: PathBuf,
    pub min_latency_ns: u64,
    pub queued: bool,
    pub device: Option<DeviceId>,
    /// `EVENTS` size in pages; `None` keeps the artifact's own size
    pub ring_pages: Option<u32>,
}

impl LoaderOptions {
    pub fn new(artifact: impl Into<PathBuf>) -> Self {
        Self { artifact: artifact.into(), min_latency_ns: 0, queued: false, device: None, ring_pages: None }
    }

    /// Ring buffer size in bytes. BPF requires a power-of-two multiple of the page size.
    ///
    /// # Errors
    /// Returns an error if `pages` is not a power of two or the size overflows
    pub fn ring_bytes(pages: u32) -> Result<u32, TracerError> {
        if !pages.is_power_of_two() {
            return Err(TracerError::ArtifactLoad {
                artifact: EVENTS_MAP.to_string(),
                error: format!("ring size of {pages} pages is not a power of two"),
            });
        }
        pages.checked_mul(page_size()).ok_or_else(|| TracerError::ArtifactLoad {
            artifact: EVENTS_MAP.to_string(),
            error: format!("ring size of {pages} pages is too large"),
        })
    }
}

fn page_size() -> u32 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u32::try_from(size).ok().filter(|s| *s > 0).unwrap_or(DEFAULT_PAGE_SIZE)
}

/// Load the artifact at `options.artifact` with globals applied
///
/// # Errors
/// Returns [`TracerError::ArtifactLoad`] if the object cannot be read or parsed
pub fn load_artifact(options: &LoaderOptions) -> Result<Ebpf, TracerError> {
    let min_ns = options.min_latency_ns;
    let targ_queued = u8::from(options.queued);
    let filter_dev = u8::from(options.device.is_some());
    let targ_dev = options.device.map_or(0, |dev| dev.0);

    let mut loader = EbpfLoader::new();
    loader
        .set_global(GLOBAL_MIN_NS, &min_ns, false)
        .set_global(GLOBAL_TARG_QUEUED, &targ_queued, false)
        .set_global(GLOBAL_FILTER_DEV, &filter_dev, false)
        .set_global(GLOBAL_TARG_DEV, &targ_dev, false);
    if let Some(pages) = options.ring_pages {
        loader.set_max_entries(EVENTS_MAP, LoaderOptions::ring_bytes(pages)?);
    }

    let bpf = loader.load_file(&options.artifact).map_err(|e| TracerError::ArtifactLoad {
        artifact: options.artifact.display().to_string(),
        error: e.to_string(),
    })?;
    info!("✓ Loaded {}", options.artifact.display());
    Ok(bpf)
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Live aya link
pub enum AyaLink {
    Kprobe(KProbeLinkId),
    RawTracepoint(RawTracePointLinkId),
}

/// [`Instrumentation`] over a loaded artifact
pub struct AyaInstrumentation {
    bpf: Option<Ebpf>,
    symbols: Option<KernelSymbols>,
}

impl AyaInstrumentation {
    /// Load `options.artifact` and read `/proc/kallsyms` for kprobe fallbacks.
    ///
    /// # Errors
    /// Returns an error if the artifact cannot be loaded
    pub fn load(options: &LoaderOptions) -> Result<Self, TracerError> {
        let mut bpf = load_artifact(options)?;
        init_ebpf_logger(&mut bpf);

        let symbols = match KernelSymbols::load() {
            Ok(symbols) => Some(symbols),
            Err(e) => {
                warn!("Kernel symbols unavailable, using default kprobe names: {e:#}");
                None
            }
        };
        Ok(Self { bpf: Some(bpf), symbols })
    }

    /// Borrow the loaded artifact
    ///
    /// # Errors
    /// [`TracerError::Released`] after [`Instrumentation::release`]
    pub fn ebpf(&self) -> Result<&Ebpf, TracerError> {
        self.bpf.as_ref().ok_or(TracerError::Released)
    }

    fn ebpf_mut(&mut self) -> Result<&mut Ebpf, TracerError> {
        self.bpf.as_mut().ok_or(TracerError::Released)
    }

    /// Take `EVENTS` (and `DROPPED` if present) and build a reader on them
    ///
    /// # Errors
    /// Returns an error if `EVENTS` is missing or is not a ring buffer
    pub fn open_channel(&mut self, closed: ClosedSignal) -> Result<RingChannel, TracerError> {
        let bpf = self.ebpf_mut()?;
        let ring = RingBuf::try_from(
            bpf.take_map(EVENTS_MAP).ok_or(TracerError::MapNotFound(EVENTS_MAP))?,
        )?;
        let dropped = match bpf.take_map(DROPPED_MAP) {
            Some(map) => Some(PerCpuArray::try_from(map)?),
            None => {
                debug!("No {DROPPED_MAP} map, loss reporting disabled");
                None
            }
        };
        RingChannel::new(ring, dropped, closed)
    }

    /// Read every slot of a `u64` array map
    ///
    /// # Errors
    /// Returns an error if the map is missing or a slot cannot be read
    pub fn read_array(&self, name: &'static str, slots: u32) -> Result<Vec<u64>, TracerError> {
        let map = self.ebpf()?.map(name).ok_or(TracerError::MapNotFound(name))?;
        let array: Array<_, u64> = Array::try_from(map)?;
        (0..slots).map(|idx| array.get(&idx, 0).map_err(TracerError::from)).collect()
    }

    /// Take every entry out of a per-process counter map, leaving it empty
    ///
    /// Entries created between the key walk and their removal are left for
    /// the next drain.
    ///
    /// # Errors
    /// Returns an error if the map is missing or cannot be walked
    pub fn drain_counts(
        &mut self,
        name: &'static str,
    ) -> Result<Vec<(TopKey, TopValue)>, TracerError> {
        let map = self.ebpf_mut()?.map_mut(name).ok_or(TracerError::MapNotFound(name))?;
        let mut counts: HashMap<_, TopKey, TopValue> = HashMap::try_from(map)?;
        let entries = counts.iter().collect::<Result<Vec<_>, _>>()?;
        for (key, _) in &entries {
            // Already gone is fine
            let _ = counts.remove(key);
        }
        Ok(entries)
    }
}

fn program_load_error(hook: &HookDescriptor, error: impl ToString) -> TracerError {
    TracerError::ProgramLoad { program: hook.program.to_string(), error: error.to_string() }
}

fn attach_error(hook: &HookDescriptor, target: &str, error: impl ToString) -> TracerError {
    TracerError::Attach {
        program: hook.program.to_string(),
        hook: target.to_string(),
        error: error.to_string(),
    }
}

impl Instrumentation for AyaInstrumentation {
    type Link = AyaLink;

    fn attach(&mut self, hook: &HookDescriptor) -> Result<AyaLink, TracerError> {
        let symbol = hook.point.kprobe_symbol(self.symbols.as_ref());
        let bpf = self.ebpf_mut()?;
        let program = bpf
            .program_mut(hook.program)
            .ok_or_else(|| program_load_error(hook, "program not found in artifact"))?;

        match hook.point {
            HookPoint::Kprobe(_) | HookPoint::Kretprobe(_) => {
                let target = symbol.ok_or_else(|| {
                    attach_error(hook, &hook.point.to_string(), "no candidate symbol in kallsyms")
                })?;
                let program: &mut KProbe =
                    program.try_into().map_err(|e| program_load_error(hook, e))?;
                program.load().map_err(|e| program_load_error(hook, e))?;
                let link = program.attach(target, 0).map_err(|e| attach_error(hook, target, e))?;
                Ok(AyaLink::Kprobe(link))
            }
            HookPoint::RawTracepoint(name) => {
                let program: &mut RawTracePoint =
                    program.try_into().map_err(|e| program_load_error(hook, e))?;
                program.load().map_err(|e| program_load_error(hook, e))?;
                let link = program.attach(name).map_err(|e| attach_error(hook, name, e))?;
                Ok(AyaLink::RawTracepoint(link))
            }
        }
    }

    fn detach(&mut self, hook: &HookDescriptor, link: AyaLink) -> Result<(), TracerError> {
        let bpf = self.ebpf_mut()?;
        let program = bpf
            .program_mut(hook.program)
            .ok_or_else(|| program_load_error(hook, "program not found in artifact"))?;
        let detached = match link {
            AyaLink::Kprobe(link) => {
                let program: &mut KProbe =
                    program.try_into().map_err(|e| program_load_error(hook, e))?;
                program.detach(link)
            }
            AyaLink::RawTracepoint(link) => {
                let program: &mut RawTracePoint =
                    program.try_into().map_err(|e| program_load_error(hook, e))?;
                program.detach(link)
            }
        };
        detached.map_err(|e| attach_error(hook, &hook.point.to_string(), e))
    }

    fn release(&mut self) {
        if self.bpf.take().is_some() {
            debug!("Released eBPF programs and maps");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_bytes_requires_power_of_two() {
        assert!(LoaderOptions::ring_bytes(63).is_err());
        assert!(LoaderOptions::ring_bytes(0).is_err());
        assert_eq!(LoaderOptions::ring_bytes(64).unwrap(), 64 * page_size());
    }

    #[test]
    fn test_missing_artifact() {
        let options = LoaderOptions::new("/nonexistent/iomon.bpf.o");
        let err = load_artifact(&options).unwrap_err();
        assert!(matches!(err, TracerError::ArtifactLoad { .. }));
        assert!(err.to_string().contains("/nonexistent/iomon.bpf.o"));
    }
}
