//! Pre-flight checks for iomon
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() and setrlimit() require unsafe

use anyhow::{bail, Context, Result};
use log::{info, warn};
use object::{Architecture, Object};
use std::path::Path;

/// Minimum kernel version required for the BPF ring buffer
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// Returns the first failed requirement
pub fn run_preflight_checks(artifacts: &[&Path]) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    for artifact in artifacts {
        check_artifact(artifact)?;
    }
    raise_memlock_limit();
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<()> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    bail!(
        "Permission denied: iomon requires root privileges to load eBPF programs.\n\n\
         Run with: sudo iomon ..."
    );
}

/// Check if the kernel version is sufficient for eBPF features
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // "Linux version 6.1.0-arch1-1 ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");
    let Some(version) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if version < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {}.{} is too old.\n\n\
             iomon requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {}",
            version.0,
            version.1,
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
            release
        );
    }

    Ok(())
}

fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Check that the artifact exists and is an eBPF object file
fn check_artifact(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!(
            "eBPF artifact not found: {}\n\n\
             Build the kernel programs first or point --artifact/--hist-artifact at them.",
            path.display()
        );
    }
    if !path.is_file() {
        bail!("Not a file: {}", path.display());
    }

    let data = std::fs::read(path)
        .with_context(|| format!("Failed to read eBPF artifact: {}", path.display()))?;
    let obj = object::File::parse(&*data)
        .with_context(|| format!("Not an ELF object: {}", path.display()))?;
    if obj.architecture() != Architecture::Bpf {
        bail!(
            "{} is not an eBPF object (architecture {:?}).",
            path.display(),
            obj.architecture()
        );
    }
    Ok(())
}

/// Lift `RLIMIT_MEMLOCK`; kernels before 5.11 charge BPF maps against it
fn raise_memlock_limit() {
    let rlim = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret == 0 {
        info!("✓ Raised RLIMIT_MEMLOCK");
    } else {
        warn!("Failed to remove limit on locked memory: {}", std::io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_kernel_version_check() {
        // Must not panic whatever the host kernel is
        let _ = check_kernel_version();
    }

    #[test]
    fn test_parse_kernel_release() {
        assert_eq!(parse_kernel_release("6.1.0-arch1-1"), Some((6, 1)));
        assert_eq!(parse_kernel_release("5.15.0-generic"), Some((5, 15)));
        assert_eq!(parse_kernel_release("5.4"), Some((5, 4)));
        assert!(parse_kernel_release("5.4") < Some(MIN_KERNEL_VERSION));
        assert_eq!(parse_kernel_release("unknown"), None);
    }

    #[test]
    fn test_artifact_not_found() {
        let err = check_artifact(Path::new("/nonexistent/biosnoop.bpf.o")).unwrap_err();
        assert!(err.to_string().contains("artifact not found"));
    }

    #[test]
    fn test_artifact_not_elf() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\necho not bpf\n").unwrap();
        let err = check_artifact(file.path()).unwrap_err();
        assert!(err.to_string().contains("Not an ELF object"));
    }

    #[test]
    fn test_host_binary_is_not_bpf() {
        let exe = std::env::current_exe().unwrap();
        let err = check_artifact(&exe).unwrap_err();
        assert!(err.to_string().contains("is not an eBPF object"));
    }
}
