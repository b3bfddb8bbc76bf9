//! Memory utilities for partition sizing.
//!
//! Provides:
//! - Byte suffix parsing (e.g., "4G", "512M", "1.5G")
//! - Platform-specific available-memory detection
//! - Resolution of a partition budget from bytes or a memory fraction

use crate::error::{PrepError, Result};

/// Binary multipliers accepted after a byte count, matched case-insensitively.
const BYTE_SUFFIXES: [(&str, u64); 9] = [
    ("", 1),
    ("B", 1),
    ("K", 1 << 10),
    ("KB", 1 << 10),
    ("M", 1 << 20),
    ("MB", 1 << 20),
    ("G", 1 << 30),
    ("GB", 1 << 30),
    ("T", 1 << 40),
];

/// Parse a byte count such as "4096", "512M" or "1.5G".
///
/// Suffixes are binary (K = 1024) and case-insensitive; "TB" is accepted
/// as well as "T". The literal "auto" yields `None`.
///
/// # Examples
/// ```
/// use tabprep::memory::parse_byte_suffix;
/// assert_eq!(parse_byte_suffix("4G").unwrap(), Some(4 * 1024 * 1024 * 1024));
/// assert_eq!(parse_byte_suffix("512M").unwrap(), Some(512 * 1024 * 1024));
/// assert_eq!(parse_byte_suffix("auto").unwrap(), None);
/// ```
pub fn parse_byte_suffix(s: &str) -> Result<Option<usize>> {
    let text = s.trim();
    if text.eq_ignore_ascii_case("auto") {
        return Ok(None);
    }

    let split = text
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);
    if number.is_empty() {
        return Err(PrepError::validation(format!(
            "Invalid byte size '{}': expected a number",
            text
        )));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| PrepError::validation(format!("Invalid byte size '{}'", text)))?;

    let suffix = suffix.trim().to_ascii_uppercase();
    let multiplier = if suffix == "TB" {
        1u64 << 40
    } else {
        BYTE_SUFFIXES
            .iter()
            .find(|(name, _)| *name == suffix)
            .map(|&(_, m)| m)
            .ok_or_else(|| {
                PrepError::validation(format!(
                    "Unknown byte suffix '{}' in '{}' (use B, K, M, G or T)",
                    suffix, text
                ))
            })?
    };

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes > usize::MAX as f64 {
        return Err(PrepError::validation(format!(
            "Byte size '{}' is too large",
            text
        )));
    }
    Ok(Some(bytes.round() as usize))
}

/// Where an available-memory figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySource {
    /// Limit of the process's cgroup v2 (`memory.max`).
    CgroupV2,
    /// Limit of the process's cgroup v1 memory controller (`memory.limit_in_bytes`).
    CgroupV1,
    /// `MemAvailable` in /proc/meminfo.
    Meminfo,
    /// `sysctl hw.memsize` on macOS.
    Sysctl,
    /// Nothing could be read; [`FALLBACK_MEMORY_BYTES`] is used.
    Fallback,
}

#[derive(Debug, Clone)]
pub struct AvailableMemory {
    pub bytes: usize,
    pub source: MemorySource,
}

/// Assumed available memory when detection fails (8GB).
pub const FALLBACK_MEMORY_BYTES: usize = 8 * 1024 * 1024 * 1024;

/// cgroup v1 limits above this are the kernel's "no limit" sentinel.
const CGROUP_V1_UNLIMITED: usize = 1 << 40;

/// Probe the platform for available memory, first match wins.
pub fn detect_available_memory() -> AvailableMemory {
    let probes: &[(MemorySource, fn() -> Option<usize>)] = &[
        #[cfg(target_os = "linux")]
        (MemorySource::CgroupV2, cgroup_v2_limit),
        #[cfg(target_os = "linux")]
        (MemorySource::CgroupV1, cgroup_v1_limit),
        #[cfg(target_os = "linux")]
        (MemorySource::Meminfo, meminfo_available),
        #[cfg(target_os = "macos")]
        (MemorySource::Sysctl, sysctl_memsize),
    ];

    probes
        .iter()
        .find_map(|(source, probe)| {
            probe()
                .filter(|&bytes| bytes > 0)
                .map(|bytes| AvailableMemory {
                    bytes,
                    source: *source,
                })
        })
        .unwrap_or(AvailableMemory {
            bytes: FALLBACK_MEMORY_BYTES,
            source: MemorySource::Fallback,
        })
}

/// Group path of the unified (v2) hierarchy in a /proc/self/cgroup listing.
#[cfg(any(target_os = "linux", test))]
fn cgroup_v2_path(membership: &str) -> Option<&str> {
    membership
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(|path| path.trim_end_matches('/'))
}

/// Group path of the v1 memory controller: the `id:controllers:path` line
/// whose controller list includes `memory`.
#[cfg(any(target_os = "linux", test))]
fn cgroup_v1_memory_path(membership: &str) -> Option<&str> {
    membership.lines().find_map(|line| {
        let mut fields = line.splitn(3, ':');
        let _id = fields.next()?;
        let controllers = fields.next()?;
        let path = fields.next()?;
        controllers
            .split(',')
            .any(|c| c == "memory")
            .then(|| path.trim_end_matches('/'))
    })
}

/// A v1 `memory.limit_in_bytes` value, `None` when effectively unlimited.
#[cfg(any(target_os = "linux", test))]
fn parse_v1_limit(text: &str) -> Option<usize> {
    let limit: usize = text.trim().parse().ok()?;
    (limit <= CGROUP_V1_UNLIMITED).then_some(limit)
}

#[cfg(target_os = "linux")]
fn cgroup_v2_limit() -> Option<usize> {
    let membership = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    let group = cgroup_v2_path(&membership)?;
    let limit = std::fs::read_to_string(format!("/sys/fs/cgroup{}/memory.max", group)).ok()?;
    // "max" means unlimited.
    limit.trim().parse().ok()
}

#[cfg(target_os = "linux")]
fn cgroup_v1_limit() -> Option<usize> {
    let membership = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    let group = cgroup_v1_memory_path(&membership)?;
    let path = format!("/sys/fs/cgroup/memory{}/memory.limit_in_bytes", group);
    parse_v1_limit(&std::fs::read_to_string(path).ok()?)
}

#[cfg(target_os = "linux")]
fn meminfo_available() -> Option<usize> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let kib: usize = line.split_whitespace().nth(1)?.parse().ok()?;
    kib.checked_mul(1024)
}

#[cfg(target_os = "macos")]
fn sysctl_memsize() -> Option<usize> {
    let output = std::process::Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

/// How large a single partition may be once materialized in memory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PartitionSize {
    /// Absolute byte budget.
    Bytes(usize),
    /// Fraction of detected available memory, in (0, 1].
    Fraction(f64),
}

impl Default for PartitionSize {
    fn default() -> Self {
        PartitionSize::Bytes(crate::constants::DEFAULT_PARTITION_BYTES)
    }
}

impl PartitionSize {
    /// Check that the budget is usable.
    pub fn validate(&self) -> Result<()> {
        match *self {
            PartitionSize::Bytes(0) => Err(PrepError::validation(
                "partition_size must be greater than 0",
            )),
            PartitionSize::Fraction(f) if !(f > 0.0 && f <= 1.0) => Err(PrepError::validation(
                format!("partition_size_fraction must be in (0.0, 1.0], got {}", f),
            )),
            _ => Ok(()),
        }
    }

    /// Resolve the budget to a byte count, detecting memory if needed.
    pub fn resolve(&self) -> Result<usize> {
        self.validate()?;
        match *self {
            PartitionSize::Bytes(bytes) => Ok(bytes),
            PartitionSize::Fraction(fraction) => {
                let available = detect_available_memory();
                if available.source == MemorySource::Fallback {
                    log::warn!(
                        "Could not detect available memory, using {} fallback. \
                        Consider specifying partition_size explicitly.",
                        format_bytes(available.bytes)
                    );
                } else {
                    log::info!(
                        "Auto-detected available memory: {} (source: {:?})",
                        format_bytes(available.bytes),
                        available.source
                    );
                }
                Ok(Self::fraction_of(available.bytes, fraction))
            }
        }
    }

    fn fraction_of(available: usize, fraction: f64) -> usize {
        ((available as f64 * fraction).floor() as usize).max(1)
    }
}

/// Human-readable byte count with binary units ("1.50 GB").
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}
