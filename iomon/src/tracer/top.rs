//! Per-process block I/O top
//!
//! The top artifact accumulates bytes, time and request counts per
//! `(pid, direction, device)` in the `COUNTS` hash map. Each round waits for
//! the round deadline, drains the map and reports the busiest rows of the
//! target command.

use iomon_common::{TopKey, TopValue, COUNTS_MAP};
use log::debug;
use serde::{Deserialize, Serialize};

use super::decoder::comm_to_string;
use super::ebpf_setup::{AyaInstrumentation, LoaderOptions};
use super::hooks::BIOTOP_HOOKS;
use super::lifecycle::HookManager;
use super::sampler::{RoundContext, RoundReport, SamplingEngine};
use crate::domain::{DeviceId, Pid, RoundError, TracerError};
use crate::sink::Update;

/// Default number of rows per report
pub const DEFAULT_MAX_ROWS: usize = 20;

/// One process/direction/device row of a round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopRow {
    pub pid: Pid,
    pub comm: String,
    /// `true` for writes
    pub write: bool,
    pub dev: DeviceId,
    pub bytes: u64,
    /// Total time spent in the requests, microseconds
    pub us: u64,
    pub io: u64,
}

impl TopRow {
    pub fn direction(&self) -> &'static str {
        if self.write {
            "W"
        } else {
            "R"
        }
    }
}

/// Busiest rows of one round, most requests first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopReport {
    #[serde(default)]
    pub rows: Vec<TopRow>,
}

impl RoundReport for TopReport {
    fn into_update(self) -> Update {
        Update::Top(self)
    }
}

/// Rows of `target`, sorted by requests, then bytes, then time, all descending
pub fn build_top_report(
    entries: impl IntoIterator<Item = (TopKey, TopValue)>,
    target: &str,
    max_rows: usize,
) -> TopReport {
    let mut rows: Vec<TopRow> = entries
        .into_iter()
        .filter_map(|(key, value)| {
            let comm = comm_to_string(&key.comm);
            (comm == target).then(|| TopRow {
                pid: Pid(key.pid),
                comm,
                write: key.rwflag != 0,
                dev: DeviceId::new(key.major, key.minor),
                bytes: value.bytes,
                us: value.us,
                io: value.io,
            })
        })
        .collect();
    rows.sort_by(|a, b| (b.io, b.bytes, b.us).cmp(&(a.io, a.bytes, a.us)));
    rows.truncate(max_rows);
    TopReport { rows }
}

/// [`SamplingEngine`] over the top artifact
pub struct TopEngine {
    hooks: HookManager<AyaInstrumentation>,
    target: String,
    max_rows: usize,
}

impl TopEngine {
    /// Load the top artifact and attach its hooks
    ///
    /// # Errors
    /// Any load or attach error; nothing stays attached in that case
    pub fn start(
        options: &LoaderOptions,
        target: impl Into<String>,
        max_rows: usize,
    ) -> Result<Self, TracerError> {
        let backend = AyaInstrumentation::load(options)?;
        let hooks = HookManager::install(backend, BIOTOP_HOOKS)?;
        Ok(Self { hooks, target: target.into(), max_rows })
    }
}

impl SamplingEngine for TopEngine {
    type Report = TopReport;

    fn run_once(&mut self, ctx: &RoundContext) -> Result<Vec<u8>, RoundError> {
        std::thread::sleep(ctx.remaining());
        let entries = self
            .hooks
            .backend_mut()
            .drain_counts(COUNTS_MAP)
            .map_err(|e| RoundError::Engine(e.to_string()))?;
        let seen = entries.len();
        let report = build_top_report(entries, &self.target, self.max_rows);
        debug!("Top round: {} of {seen} rows for {}", report.rows.len(), self.target);
        Ok(serde_json::to_vec(&report)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::decoder::comm_from_str;

    fn entry(pid: u32, comm: &str, write: bool, io: u64, bytes: u64) -> (TopKey, TopValue) {
        (
            TopKey { pid, rwflag: u32::from(write), major: 8, minor: 0, comm: comm_from_str(comm) },
            TopValue { bytes, us: io * 100, io },
        )
    }

    #[test]
    fn test_report_keeps_target_only() {
        let report = build_top_report(
            [entry(10, "etcd", true, 3, 4096), entry(11, "postgres", false, 50, 1 << 20)],
            "etcd",
            DEFAULT_MAX_ROWS,
        );
        assert_eq!(report.rows.len(), 1);
        let row = &report.rows[0];
        assert_eq!(row.pid, Pid(10));
        assert_eq!(row.direction(), "W");
        assert_eq!(row.dev, DeviceId::new(8, 0));
        assert_eq!((row.bytes, row.us, row.io), (4096, 300, 3));
    }

    #[test]
    fn test_rows_sorted_and_truncated() {
        let entries = [
            entry(1, "etcd", false, 2, 100),
            entry(2, "etcd", true, 9, 100),
            entry(3, "etcd", false, 2, 900),
            entry(4, "etcd", true, 1, 5),
        ];
        let report = build_top_report(entries, "etcd", 3);
        let pids: Vec<u32> = report.rows.iter().map(|row| row.pid.0).collect();
        assert_eq!(pids, [2, 3, 1]);
    }

    #[test]
    fn test_report_decodes_into_top_update() {
        let report = build_top_report([entry(7, "etcd", false, 1, 512)], "etcd", 1);
        let bytes = serde_json::to_vec(&report).unwrap();
        let decoded: TopReport = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.clone().into_update(), Update::Top(report));
        assert!(serde_json::from_slice::<TopReport>(br#"{"rows":[{"pid":"x"}]}"#).is_err());
    }
}
