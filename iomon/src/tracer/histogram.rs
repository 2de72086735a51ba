//! Block latency histogram engine
//!
//! The histogram artifact keeps a log2 histogram of request latency in
//! microseconds (`HIST`, one `u64` per slot). A round snapshots the map, waits
//! for the round deadline, snapshots again and reports the difference.

use iomon_common::{HIST_MAP, MAX_SLOTS};
use log::debug;

use super::ebpf_setup::{AyaInstrumentation, LoaderOptions};
use super::hooks::BIOLATENCY_HOOKS;
use super::lifecycle::HookManager;
use super::sampler::{Interval, Report, RoundContext, SamplingEngine};
use crate::domain::{RoundError, TracerError};

/// Unit of the `HIST` slots
pub const HIST_UNIT: &str = "usecs";

/// `[low, high]` microseconds covered by log2 slot `slot`
pub fn slot_bounds(slot: u32) -> (u64, u64) {
    let high = (1u64 << (slot + 1)) - 1;
    let low = (1u64 << (slot + 1)) >> 1;
    if low == high {
        (low - 1, high)
    } else {
        (low, high)
    }
}

/// Report for per-slot counts, trimmed after the last non-empty slot
pub fn build_report(counts: &[u64]) -> Report {
    let used = counts.iter().rposition(|&count| count > 0).map_or(0, |idx| idx + 1);
    let intervals = counts[..used]
        .iter()
        .zip(0u32..)
        .map(|(&count, slot)| {
            let (start, end) = slot_bounds(slot);
            Interval { count, start, end }
        })
        .collect();
    Report { val_type: HIST_UNIT.to_string(), intervals }
}

/// [`SamplingEngine`] over the histogram artifact
pub struct HistogramEngine {
    hooks: HookManager<AyaInstrumentation>,
}

impl HistogramEngine {
    /// Load the histogram artifact and attach its hooks
    ///
    /// # Errors
    /// Any load or attach error; nothing stays attached in that case
    pub fn start(options: &LoaderOptions) -> Result<Self, TracerError> {
        let backend = AyaInstrumentation::load(options)?;
        let hooks = HookManager::install(backend, BIOLATENCY_HOOKS)?;
        Ok(Self { hooks })
    }

    fn read_slots(&mut self) -> Result<Vec<u64>, RoundError> {
        self.hooks
            .backend_mut()
            .read_array(HIST_MAP, MAX_SLOTS)
            .map_err(|e| RoundError::Engine(e.to_string()))
    }
}

impl SamplingEngine for HistogramEngine {
    type Report = Report;

    fn run_once(&mut self, ctx: &RoundContext) -> Result<Vec<u8>, RoundError> {
        let before = self.read_slots()?;
        std::thread::sleep(ctx.remaining());
        let after = self.read_slots()?;

        let deltas: Vec<u64> =
            after.iter().zip(&before).map(|(now, then)| now.saturating_sub(*then)).collect();
        let report = build_report(&deltas);
        debug!("Histogram round: {} intervals", report.intervals.len());
        Ok(serde_json::to_vec(&report)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_bounds() {
        assert_eq!(slot_bounds(0), (0, 1));
        assert_eq!(slot_bounds(1), (2, 3));
        assert_eq!(slot_bounds(2), (4, 7));
        assert_eq!(slot_bounds(10), (1024, 2047));
        assert_eq!(slot_bounds(MAX_SLOTS - 1), (1 << 26, (1 << 27) - 1));
    }

    #[test]
    fn test_report_trims_trailing_empty_slots() {
        let mut counts = vec![0u64; MAX_SLOTS as usize];
        counts[0] = 5;
        counts[3] = 2;
        let report = build_report(&counts);
        assert_eq!(report.val_type, "usecs");
        assert_eq!(report.intervals.len(), 4);
        assert_eq!(report.intervals[3], Interval { count: 2, start: 8, end: 15 });
        assert_eq!(report.intervals[1].count, 0);
    }

    #[test]
    fn test_report_json_shape() {
        let json = serde_json::to_string(&build_report(&[1, 2])).unwrap();
        assert_eq!(
            json,
            r#"{"valType":"usecs","intervals":[{"count":1,"start":0,"end":1},{"count":2,"start":2,"end":3}]}"#
        );
    }

    #[test]
    fn test_all_empty_report() {
        assert!(build_report(&[0; 27]).intervals.is_empty());
    }
}
