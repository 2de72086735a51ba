//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep kernel identifiers apart (a mount namespace
//! inode is not a PID) and carry the unit conversions used by the translator.

// Nanosecond counters are converted to f64 for display
#![allow(clippy::cast_precision_loss)]

use serde::{Deserialize, Serialize};
use std::fmt;

use iomon_common::MINORBITS;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Mount namespace inode number, as seen in `/proc/<pid>/ns/mnt`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MountNsId(pub u64);

impl fmt::Display for MountNsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mnt:[{}]", self.0)
    }
}

/// Block device number in the kernel's internal `MKDEV` encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Build from a major/minor pair
    pub fn new(major: u32, minor: u32) -> Self {
        Self((major << MINORBITS) | (minor & ((1 << MINORBITS) - 1)))
    }

    pub fn major(self) -> u32 {
        self.0 >> MINORBITS
    }

    pub fn minor(self) -> u32 {
        self.0 & ((1 << MINORBITS) - 1)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&format!("{}:{}", self.major(), self.minor()))
    }
}

impl std::str::FromStr for DeviceId {
    type Err = String;

    /// Parse `MAJOR:MINOR`, e.g. `259:0`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) =
            s.split_once(':').ok_or_else(|| format!("expected MAJOR:MINOR, got '{s}'"))?;
        let major: u32 = major.trim().parse().map_err(|_| format!("invalid major '{major}'"))?;
        let minor: u32 = minor.trim().parse().map_err(|_| format!("invalid minor '{minor}'"))?;
        if major >= (1 << (32 - MINORBITS)) || minor >= (1 << MINORBITS) {
            return Err(format!("device {major}:{minor} out of range"));
        }
        Ok(Self::new(major, minor))
    }
}

/// Timestamp in nanoseconds
///
/// Represents an absolute point in time as nanoseconds since boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Seconds elapsed since `baseline`, never negative
    pub fn seconds_since(self, baseline: Timestamp) -> f64 {
        self.0.saturating_sub(baseline.0) as f64 / 1_000_000_000.0
    }
}

/// Duration in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(pub u64);

impl Duration {
    /// Convert to milliseconds (f64)
    pub fn as_millis(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}ms", self.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_roundtrip_display() {
        let dev: DeviceId = "259:3".parse().unwrap();
        assert_eq!(dev.major(), 259);
        assert_eq!(dev.minor(), 3);
        assert_eq!(dev.0, (259 << 20) | 3);
        assert_eq!(dev.to_string(), "259:3");
    }

    #[test]
    fn test_device_display_honours_width() {
        assert_eq!(format!("{:<6}|", DeviceId::new(8, 0)), "8:0   |");
        assert_eq!(format!("{:>6}|", DeviceId::new(259, 1)), " 259:1|");
    }

    #[test]
    fn test_device_parse_errors() {
        assert!("259".parse::<DeviceId>().is_err());
        assert!("a:1".parse::<DeviceId>().is_err());
        assert!("1:2097152".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_seconds_since_saturates() {
        assert_eq!(Timestamp(3_500_000_000).seconds_since(Timestamp(1_000_000_000)), 2.5);
        assert_eq!(Timestamp(5).seconds_since(Timestamp(10)), 0.0);
    }

    #[test]
    fn test_duration_display() {
        assert_eq!(Duration(5_000_000).as_millis(), 5.0);
        assert_eq!(Duration(12_345_678).to_string(), "12.35ms");
    }

    #[test]
    fn test_mntns_display() {
        assert_eq!(MountNsId(4_026_531_840).to_string(), "mnt:[4026531840]");
    }
}
