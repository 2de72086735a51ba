//! Mount namespace enrichment from `/proc`
//!
//! Maps a mount namespace inode to the lowest-numbered process living in it.
//! Namespaces other than PID 1's are reported as containerized.
//!
//! `/proc` is walked on a background scanner thread. The translator only ever
//! reads the latest published table: a miss asks the scanner for a fresh
//! table (at most once per [`RESCAN_INTERVAL`]) and returns `None` right away.

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::translator::{Enricher, NamespaceMetadata};
use crate::domain::{MountNsId, Pid};

/// Minimum time between two rescans requested by unknown namespaces
const RESCAN_INTERVAL: Duration = Duration::from_secs(1);

type NamespaceTable = HashMap<MountNsId, NamespaceMetadata>;

/// [`Enricher`] backed by `/proc/<pid>/ns/mnt`
pub struct ProcMountNsEnricher {
    namespaces: NamespaceTable,
    scans: Receiver<NamespaceTable>,
    rescan: Sender<()>,
    last_request: Option<Instant>,
}

impl ProcMountNsEnricher {
    /// Start scanning `/proc`
    ///
    /// # Errors
    /// Returns an error if the scanner thread cannot be spawned
    pub fn new() -> std::io::Result<Self> {
        Self::with_proc_root("/proc")
    }

    /// Scan an alternative procfs mount
    ///
    /// # Errors
    /// Returns an error if the scanner thread cannot be spawned
    pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let proc_root = proc_root.into();
        Self::with_scanner(move || scan_proc(&proc_root))
    }

    fn with_scanner<F>(mut scan: F) -> std::io::Result<Self>
    where
        F: FnMut() -> Result<NamespaceTable> + Send + 'static,
    {
        let (rescan, requests) = bounded::<()>(1);
        let (tables, scans) = bounded(1);

        std::thread::Builder::new().name("iomon-mntns".to_string()).spawn(move || {
            // Ends once the enricher (and with it the request sender) is dropped
            for () in requests {
                match scan() {
                    Ok(table) => {
                        if tables.send(table).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Mount namespace scan failed: {e:#}"),
                }
            }
        })?;

        let mut enricher =
            Self { namespaces: HashMap::new(), scans, rescan, last_request: None };
        enricher.request_rescan();
        Ok(enricher)
    }

    /// Number of namespaces in the table in use
    pub fn known(&self) -> usize {
        self.namespaces.len()
    }

    /// Adopt the newest table the scanner has published, if any
    pub fn refresh(&mut self) {
        while let Ok(table) = self.scans.try_recv() {
            self.namespaces = table;
        }
    }

    fn request_rescan(&mut self) {
        self.last_request = Some(Instant::now());
        // Full means a scan is already queued
        let _ = self.rescan.try_send(());
    }

    fn rescan_due(&self) -> bool {
        self.last_request.is_none_or(|at| at.elapsed() >= RESCAN_INTERVAL)
    }
}

impl Enricher for ProcMountNsEnricher {
    fn lookup(&mut self, mntns_id: MountNsId) -> Option<NamespaceMetadata> {
        self.refresh();
        if let Some(meta) = self.namespaces.get(&mntns_id) {
            return Some(meta.clone());
        }
        if self.rescan_due() {
            self.request_rescan();
        }
        None
    }
}

/// Build the namespace table from one walk of `proc_root`
///
/// # Errors
/// Returns an error if the proc root cannot be listed
pub fn scan_proc(proc_root: &Path) -> Result<HashMap<MountNsId, NamespaceMetadata>> {
    let entries = fs::read_dir(proc_root)
        .with_context(|| format!("Failed to read {}", proc_root.display()))?;

    let host = mount_ns_of(proc_root, 1);
    let mut namespaces: NamespaceTable = HashMap::new();

    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        // Processes may exit mid-scan; skip what we can't read
        let Some(mntns_id) = mount_ns_of(proc_root, pid) else {
            continue;
        };
        if namespaces.get(&mntns_id).is_some_and(|known| known.leader_pid.0 < pid) {
            continue;
        }
        let leader_comm = comm_of(proc_root, pid).unwrap_or_default();
        namespaces.insert(
            mntns_id,
            NamespaceMetadata {
                mntns_id,
                leader_pid: Pid(pid),
                leader_comm,
                containerized: host.is_some_and(|host| host != mntns_id),
            },
        );
    }

    debug!("Scanned {} mount namespaces", namespaces.len());
    Ok(namespaces)
}

fn mount_ns_of(proc_root: &Path, pid: u32) -> Option<MountNsId> {
    let link = fs::read_link(proc_root.join(pid.to_string()).join("ns/mnt")).ok()?;
    parse_ns_link(&link.to_string_lossy()).ok()
}

fn comm_of(proc_root: &Path, pid: u32) -> Option<String> {
    let stat = fs::read_to_string(proc_root.join(pid.to_string()).join("stat")).ok()?;
    extract_comm(&stat).ok()
}

/// Parse a namespace link target such as `mnt:[4026531841]`
fn parse_ns_link(link: &str) -> Result<MountNsId> {
    let inode = link
        .strip_prefix("mnt:[")
        .and_then(|rest| rest.strip_suffix(']'))
        .with_context(|| format!("Invalid namespace link: {link}"))?;
    Ok(MountNsId(inode.parse().with_context(|| format!("Invalid namespace inode: {inode}"))?))
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}
