//! OS-specific enumeration of whole block devices.

use std::path::PathBuf;

use crate::error::Result;

/// Yield `/dev/<name>` for every whole disk the kernel knows about.
///
/// Partitions also appear in `/proc/partitions`; requiring a matching
/// `/sys/block/<name>` entry filters them out.
#[cfg(target_os = "linux")]
pub fn list_devices() -> Result<Vec<PathBuf>> {
    let listing = std::fs::read_to_string("/proc/partitions")?;
    let mut devices = Vec::new();
    // two header lines: column names and a blank
    for line in listing.lines().skip(2) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            continue;
        }
        let name = fields[3];
        if std::path::Path::new("/sys/block").join(name).exists() {
            devices.push(PathBuf::from("/dev").join(name));
        }
    }
    Ok(devices)
}

#[cfg(not(target_os = "linux"))]
pub fn list_devices() -> Result<Vec<PathBuf>> {
    tracing::warn!("device enumeration is only supported on Linux");
    Ok(Vec::new())
}
