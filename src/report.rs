//! Delimited report rows.
//!
//! Stdout carries the data rows, stderr the descriptive column headers, so a
//! shell pipeline sees nothing but `|`-separated records. Row kinds: `d`
//! disk, `m` MBR slot, `p` populated partition, `f` free gap. Integer widths
//! follow the device's LBA digit count.

use std::path::Path;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::freespace;
use crate::gpt::{GptDev, Slot, ATTR_TYPE_SHIFT};
use crate::guid;

pub fn digits(mut value: u64) -> usize {
    let mut digits = 1;
    while value >= 10 {
        value /= 10;
        digits += 1;
    }
    digits
}

fn bitstring(value: u64, bits: u32) -> String {
    (0..bits)
        .rev()
        .map(|bit| if (value >> bit) & 1 != 0 { '1' } else { '0' })
        .collect()
}

/// Print-path state: a separator line goes between devices, not before the
/// first one.
pub struct Reporter {
    first: bool,
}

impl Default for Reporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter {
    pub fn new() -> Self {
        Self { first: true }
    }

    /// Validate and dump one device. Table-state problems are reported with
    /// a remediation hint and reduce the dump; only I/O failures propagate.
    pub fn print_device(&mut self, dev: &mut GptDev) -> Result<()> {
        if self.first {
            self.first = false;
        } else {
            eprintln!();
        }

        if let Err(err) = dev.check_device() {
            if !err.is_table_state() {
                return Err(err);
            }
            remediation_hint(dev.disk.path(), &err);
        }

        let w = digits(dev.disk.last_lba);
        let path = dev.disk.path().display().to_string();
        let pw = path.len().max(4);
        let geo = dev.disk.geometry;

        eprintln!(
            "d|{0:<pw$}|lbsz|{1:<w$}|hpc|spt|cyls |seq|{2:<36}|{3:<w$}|{4:<w$}|entries",
            "path",
            "last lb",
            "disk uuid",
            "fst avl",
            "lst avl",
            pw = pw,
            w = w,
        );
        let (uuid_text, first_text, last_text, entries_text) = if dev.is_valid {
            (
                guid::to_text(&dev.primary.disk_guid),
                format!("{:0w$}", dev.primary.first_usable_lba, w = w),
                format!("{:0w$}", dev.primary.last_usable_lba, w = w),
                dev.primary.ptable_entries.to_string(),
            )
        } else {
            (
                "-".repeat(guid::TEXT_LEN),
                "-".repeat(w),
                "-".repeat(w),
                "-".to_string(),
            )
        };
        println!(
            "d|{path}|{:04}|{:0w$}|{:03}|{:03}|{:05}|{:03}|{uuid_text}|{first_text}|{last_text}|{entries_text}",
            dev.disk.lbsz,
            dev.disk.last_lba,
            geo.heads,
            geo.sectors,
            geo.cylinders,
            dev.disk.sequence,
            w = w,
        );

        // Always the copy read at open time, even when GPT validation failed.
        if dev.mbr.is_present() {
            eprintln!("m|n|os|{:<10}|{:<10}|shd|ss|scyl|ehd|es|ecyl", "start", "size");
            for (i, part) in dev.mbr.parts.iter().enumerate() {
                let start = part.start();
                let end = part.end();
                println!(
                    "m|{i}|{:02x}|{:010}|{:010}|{:03}|{:02}|{:04}|{:03}|{:02}|{:04}",
                    part.part_type,
                    part.start_lba,
                    part.size_lba,
                    start.head,
                    start.sector,
                    start.cylinder,
                    end.head,
                    end.sector,
                    end.cylinder,
                );
            }
        }

        if !dev.is_valid {
            return Ok(());
        }

        if !dev.parts.is_empty() {
            eprintln!(
                "p|num|{0:<36}|{1:<w$}|{2:<w$}|{3:<36}|type attributes |cmn|label",
                "partuuid",
                "start",
                "end",
                "type",
                w = w,
            );
            let mut sorted: Vec<&Slot> = dev.parts.iter().collect();
            sorted.sort_by_key(|slot| slot.index);
            for slot in sorted {
                let entry = &slot.entry;
                println!(
                    "p|{:03}|{}|{:0w$}|{:0w$}|{}|{}|{}|{}",
                    slot.index + 1,
                    guid::to_text(&entry.part_guid),
                    entry.start_lba,
                    entry.end_lba,
                    guid::to_text(&entry.type_guid),
                    bitstring(entry.attr >> ATTR_TYPE_SHIFT, 16),
                    bitstring(entry.attr, 3),
                    entry.label(),
                    w = w,
                );
            }
        }

        if dev.sane_parts {
            let free = freespace::gaps(
                &dev.parts,
                dev.primary.first_usable_lba,
                dev.primary.last_usable_lba,
            );
            if !free.is_empty() {
                eprintln!("f|{0:<w$}|{1:<w$}", "start", "end", w = w);
                for gap in free {
                    println!("f|{:0w$}|{:0w$}", gap.start, gap.end, w = w);
                }
            }
        }

        Ok(())
    }
}

fn remediation_hint(path: &Path, err: &Error) {
    match err {
        Error::NotGpt => info!("{} does not have a gpt table", path.display()),
        Error::Unexpected(_) => warn!(
            "{err}: the table on {} could be corrupt, or use a format or edge \
             case this tool cannot handle",
            path.display()
        ),
        _ => warn!(
            "{err}: you may need to restore the primary or backup table on {}, \
             or start a new one",
            path.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digit_counts() {
        assert_eq!(digits(0), 1);
        assert_eq!(digits(9), 1);
        assert_eq!(digits(10), 2);
        assert_eq!(digits(204_799), 6);
        assert_eq!(digits(u64::MAX), 20);
    }

    #[test]
    fn bitstrings_read_most_significant_first() {
        assert_eq!(bitstring(0b101, 3), "101");
        assert_eq!(bitstring(0x8001, 16), "1000000000000001");
        assert_eq!(bitstring(0, 3), "000");
    }
}
