//! Mutating operations.
//!
//! Every operation follows the same discipline: update the in-memory model,
//! recompute the checksums, write the backup side (array bytes, then the
//! header block), write the primary side the same way, flush. A crash midway
//! leaves either both tables valid or a stale primary that
//! [`restore_primary`] can rebuild from the intact backup.

use tracing::info;

use crate::crc32;
use crate::error::{Error, Result};
use crate::freespace;
use crate::gpt::{
    overlap_check, Entry, GptDev, Header, Slot, ATTR_TYPE_SHIFT, ENTRY_SIZE, HEADER_SIZE,
    LINUX_DATA_GUID, MIN_TABLE_BYTES,
};
use crate::guid;
use crate::mbr::Mbr;

/// Layout parameters for a fresh table, fed by the `-N -R -P -U` overrides.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub max_entries: u32,
    pub hdr_size: u32,
    pub entry_size: u32,
    /// Blocks of slack before/after the primary array and before/after the
    /// backup array.
    pub padding: [u64; 4],
    pub disk_guid: Option<[u8; 16]>,
}

impl Default for TableSpec {
    fn default() -> Self {
        Self {
            max_entries: 128,
            hdr_size: HEADER_SIZE,
            entry_size: ENTRY_SIZE,
            padding: [0; 4],
            disk_guid: None,
        }
    }
}

/// Raw textual fields of a set-entry command. `None` or `"-"` leaves a field
/// alone; the GUID fields also accept `"+"` to force a fresh value.
#[derive(Debug, Default, Clone)]
pub struct SetFields {
    pub part_guid: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub type_guid: Option<String>,
    pub type_attrs: Option<String>,
    pub common_attrs: Option<String>,
    pub label: Option<String>,
}

/// Build and write a fresh protective MBR over LBA 0.
pub fn write_mbr(dev: &mut GptDev) -> Result<()> {
    let mbr = Mbr::protective(dev.disk.last_lba, &dev.disk.geometry);
    dev.disk.stream.seek_write(0, &mbr.to_bytes())?;
    dev.disk.stream.flush()?;
    dev.mbr = mbr;
    info!("wrote protective MBR");
    Ok(())
}

/// Write a fresh blank table, wiping all partitions.
///
/// The backup side is laid down first; the primary is then produced by the
/// same mirror-and-copy path a repair would use, which also revalidates the
/// result.
pub fn write_gpt(dev: &mut GptDev, spec: &TableSpec) -> Result<()> {
    let lbsz = dev.disk.lbsz;
    let last = dev.disk.last_lba;

    let mut hdr = Header {
        header_size: spec.hdr_size.max(HEADER_SIZE),
        entry_size: spec.entry_size.max(ENTRY_SIZE),
        ptable_entries: spec.max_entries,
        ..Default::default()
    };
    if hdr.header_size as u64 > lbsz {
        return Err(Error::Parse(
            "header size",
            format!("{} does not fit a {lbsz}-byte block", hdr.header_size),
        ));
    }
    if hdr.array_bytes() < MIN_TABLE_BYTES {
        return Err(Error::Parse(
            "entry count",
            format!(
                "{} entries of {} bytes leave the array under {MIN_TABLE_BYTES} bytes",
                hdr.ptable_entries, hdr.entry_size
            ),
        ));
    }

    let table_blocks = hdr.table_blocks(lbsz);
    let [pad_pre_primary, pad_post_primary, pad_pre_backup, pad_post_backup] = spec.padding;

    hdr.first_usable_lba = 2 + pad_pre_primary + table_blocks + pad_post_primary;
    hdr.last_usable_lba = last
        .checked_sub(1 + pad_post_backup + table_blocks + pad_pre_backup)
        .filter(|last_usable| hdr.first_usable_lba <= *last_usable)
        .ok_or(Error::Unexpected("device too small for the requested layout"))?;
    hdr.disk_guid = spec.disk_guid.unwrap_or_else(guid::generate);
    hdr.ptable_crc = crc32::crc_zero(0, hdr.array_bytes());

    hdr.this_lba = last;
    hdr.alt_lba = 1;
    hdr.ptable_lba = hdr.last_usable_lba + 1 + pad_pre_backup;
    hdr.refresh_crc();

    dev.disk
        .stream
        .seek_write_zero(hdr.ptable_lba * lbsz, hdr.array_bytes())?;
    dev.disk.stream.seek_write_zero(last * lbsz, lbsz)?;
    dev.disk.stream.seek_write(last * lbsz, &hdr.to_bytes())?;
    dev.backup = hdr;

    restore_primary(dev, spec)?;
    info!("wrote new GPT header and table");
    Ok(())
}

/// Rebuild the primary table from a valid backup.
pub fn restore_primary(dev: &mut GptDev, spec: &TableSpec) -> Result<()> {
    let lbsz = dev.disk.lbsz;
    let last = dev.disk.last_lba;
    let (source, _) = dev.validate_header(last)?;

    let mut hdr = source.clone();
    hdr.this_lba = 1;
    hdr.alt_lba = last;
    hdr.ptable_lba = 2 + spec.padding[0];
    hdr.refresh_crc();

    dev.disk.stream.copy_within(
        source.ptable_lba * lbsz,
        hdr.ptable_lba * lbsz,
        hdr.array_bytes(),
    )?;
    dev.disk.stream.seek_write_zero(lbsz, lbsz)?;
    dev.disk.stream.seek_write(lbsz, &hdr.to_bytes())?;
    dev.disk.stream.flush()?;
    dev.backup = source;
    dev.primary = hdr;

    dev.check_device()?;
    info!("restored primary GPT from backup");
    Ok(())
}

/// Rebuild the backup table from a valid primary.
pub fn restore_backup(dev: &mut GptDev, spec: &TableSpec) -> Result<()> {
    let lbsz = dev.disk.lbsz;
    let last = dev.disk.last_lba;
    let (source, _) = dev.validate_header(1)?;

    let mut hdr = source.clone();
    hdr.this_lba = last;
    hdr.alt_lba = 1;
    hdr.ptable_lba = source.last_usable_lba + 1 + spec.padding[2];
    hdr.refresh_crc();

    dev.disk.stream.copy_within(
        source.ptable_lba * lbsz,
        hdr.ptable_lba * lbsz,
        hdr.array_bytes(),
    )?;
    dev.disk.stream.seek_write_zero(last * lbsz, lbsz)?;
    dev.disk.stream.seek_write(last * lbsz, &hdr.to_bytes())?;
    dev.disk.stream.flush()?;
    dev.primary = source;
    dev.backup = hdr;

    dev.check_device()?;
    info!("restored backup GPT from primary");
    Ok(())
}

/// Stamp a new disk GUID into both headers.
pub fn relabel(dev: &mut GptDev, spec: &TableSpec) -> Result<()> {
    dev.ensure_valid()?;

    let id = spec.disk_guid.unwrap_or_else(guid::generate);
    dev.primary.disk_guid = id;
    dev.backup.disk_guid = id;

    rewrite_headers(dev)?;
    dev.disk.stream.flush()?;
    info!("relabeled disk as {}", guid::to_text(&id));
    Ok(())
}

/// Create or update the one-based slot `num`.
pub fn set_entry(dev: &mut GptDev, num: u64, fields: &SetFields) -> Result<()> {
    dev.ensure_valid()?;
    let index = slot_index(dev, num)?;

    let mut start = parse_lba("start", fields.start.as_deref())?;
    let mut end = parse_lba("end", fields.end.as_deref())?;

    let position = dev.parts.iter().position(|slot| slot.index == index);

    // A new entry with an open end borrows it from the free list.
    if position.is_none() && (start.is_none() || end.is_none()) {
        if !dev.sane_parts {
            return Err(Error::Unexpected(
                "partition list is not sane, cannot infer free space",
            ));
        }
        let free = freespace::gaps(
            &dev.parts,
            dev.primary.first_usable_lba,
            dev.primary.last_usable_lba,
        );
        let (guessed_start, guessed_end) = freespace::guess_free(&free, start, end)?;
        start = Some(guessed_start);
        end = Some(guessed_end);
    }

    let mut entry = match position {
        Some(position) => dev.parts[position].entry.clone(),
        None => Entry::default(),
    };

    if let Some(start) = start {
        entry.start_lba = start;
    }
    if let Some(end) = end {
        entry.end_lba = end;
    }
    if entry.start_lba < dev.primary.first_usable_lba {
        return Err(Error::Parse(
            "start",
            format!(
                "{} is before the first usable LBA {}",
                entry.start_lba, dev.primary.first_usable_lba
            ),
        ));
    }
    if entry.end_lba < entry.start_lba {
        return Err(Error::Parse(
            "end",
            format!("{} is before the start LBA {}", entry.end_lba, entry.start_lba),
        ));
    }
    if entry.end_lba > dev.primary.last_usable_lba {
        return Err(Error::Parse(
            "end",
            format!(
                "{} is past the last usable LBA {}",
                entry.end_lba, dev.primary.last_usable_lba
            ),
        ));
    }

    match fields.part_guid.as_deref() {
        Some("+") => entry.part_guid = guid::generate(),
        None | Some("-") => {
            if guid::is_zero(&entry.part_guid) {
                entry.part_guid = guid::generate();
            }
        }
        Some(text) => entry.part_guid = guid::from_text(text)?,
    }
    match fields.type_guid.as_deref() {
        Some("+") => entry.type_guid = guid::from_text(LINUX_DATA_GUID)?,
        None | Some("-") => {
            if guid::is_zero(&entry.type_guid) {
                entry.type_guid = guid::from_text(LINUX_DATA_GUID)?;
            }
        }
        Some(text) => entry.type_guid = guid::from_text(text)?,
    }

    if let Some(text) = fields.type_attrs.as_deref() {
        apply_attr_bits(&mut entry, text, 16, ATTR_TYPE_SHIFT)?;
    }
    if let Some(text) = fields.common_attrs.as_deref() {
        apply_attr_bits(&mut entry, text, 3, 0)?;
    }
    if let Some(text) = fields.label.as_deref() {
        entry.set_label(text)?;
    }

    match position {
        Some(position) => dev.parts[position].entry = entry.clone(),
        None => dev.parts.push(Slot {
            index,
            entry: entry.clone(),
        }),
    }

    update_table_crc(dev);
    commit_entries(dev, &[(index, Some(&entry))])?;
    dev.disk.stream.flush()?;
    dev.sane_parts = overlap_check(
        &dev.parts,
        dev.primary.first_usable_lba,
        dev.primary.last_usable_lba,
    );
    info!("wrote partition entry {num}");
    Ok(())
}

/// Zero the one-based slot `num` out of both arrays.
pub fn del_entry(dev: &mut GptDev, num: u64) -> Result<()> {
    dev.ensure_valid()?;
    let index = slot_index(dev, num)?;
    let position = dev
        .parts
        .iter()
        .position(|slot| slot.index == index)
        .ok_or_else(|| Error::Parse("partition number", format!("slot {num} is empty")))?;
    dev.parts.remove(position);

    update_table_crc(dev);
    commit_entries(dev, &[(index, None)])?;
    dev.disk.stream.flush()?;
    dev.sane_parts = overlap_check(
        &dev.parts,
        dev.primary.first_usable_lba,
        dev.primary.last_usable_lba,
    );
    info!("deleted partition entry {num}");
    Ok(())
}

/// Renumber the populated slot `from` to the empty slot `to`.
pub fn move_entry(dev: &mut GptDev, from: u64, to: u64) -> Result<()> {
    dev.ensure_valid()?;
    let from_index = slot_index(dev, from)?;
    let to_index = slot_index(dev, to)?;
    let position = dev
        .parts
        .iter()
        .position(|slot| slot.index == from_index)
        .ok_or_else(|| Error::Parse("partition number", format!("slot {from} is empty")))?;
    if dev.parts.iter().any(|slot| slot.index == to_index) {
        return Err(Error::Parse(
            "partition number",
            format!("slot {to} is occupied"),
        ));
    }

    dev.parts[position].index = to_index;
    let entry = dev.parts[position].entry.clone();

    update_table_crc(dev);
    commit_entries(dev, &[(from_index, None), (to_index, Some(&entry))])?;
    dev.disk.stream.flush()?;
    info!("moved partition entry {from} to {to}");
    Ok(())
}

/// Array checksum from the in-memory list alone: populated slots contribute
/// their bytes, absent slots a zero run, every slot its oversize tail.
pub fn calc_ptable_crc(parts: &[Slot], entries: u32, entry_size: u32) -> u32 {
    let mut calc = 0u32;
    for index in 0..entries {
        match parts.iter().find(|slot| slot.index == index) {
            Some(slot) => calc = crc32::crc(calc, &slot.entry.to_bytes()),
            None => calc = crc32::crc_zero(calc, ENTRY_SIZE as u64),
        }
        calc = crc32::crc_zero(calc, (entry_size - ENTRY_SIZE) as u64);
    }
    calc
}

fn update_table_crc(dev: &mut GptDev) {
    let crc = calc_ptable_crc(&dev.parts, dev.primary.ptable_entries, dev.primary.entry_size);
    dev.primary.ptable_crc = crc;
    dev.backup.ptable_crc = crc;
}

/// Commit slot changes together with the refreshed headers, finishing one
/// side before touching the other: backup array bytes, backup header block,
/// then the primary side the same way. A crash between the two sides leaves
/// the backup fully consistent. `None` zeroes a slot.
fn commit_entries(dev: &mut GptDev, slots: &[(u32, Option<&Entry>)]) -> Result<()> {
    dev.backup.refresh_crc();
    dev.primary.refresh_crc();
    let lbsz = dev.disk.lbsz;
    for (ptable_lba, entry_size, header_lba, header_bytes) in [
        (
            dev.backup.ptable_lba,
            dev.backup.entry_size,
            dev.backup.this_lba,
            dev.backup.to_bytes(),
        ),
        (
            dev.primary.ptable_lba,
            dev.primary.entry_size,
            dev.primary.this_lba,
            dev.primary.to_bytes(),
        ),
    ] {
        for &(index, entry) in slots {
            let offset = ptable_lba * lbsz + index as u64 * entry_size as u64;
            match entry {
                Some(entry) => {
                    dev.disk.stream.seek_write(offset, &entry.to_bytes())?;
                    if entry_size > ENTRY_SIZE {
                        dev.disk.stream.seek_write_zero(
                            offset + ENTRY_SIZE as u64,
                            (entry_size - ENTRY_SIZE) as u64,
                        )?;
                    }
                }
                None => dev
                    .disk
                    .stream
                    .seek_write_zero(offset, entry_size as u64)?,
            }
        }
        dev.disk.stream.seek_write(header_lba * lbsz, &header_bytes)?;
    }
    Ok(())
}

/// Recompute both header checksums and rewrite the header blocks, backup
/// before primary.
fn rewrite_headers(dev: &mut GptDev) -> Result<()> {
    dev.backup.refresh_crc();
    dev.primary.refresh_crc();
    let lbsz = dev.disk.lbsz;
    let backup_offset = dev.backup.this_lba * lbsz;
    let primary_offset = dev.primary.this_lba * lbsz;
    let backup_bytes = dev.backup.to_bytes();
    let primary_bytes = dev.primary.to_bytes();
    dev.disk.stream.seek_write(backup_offset, &backup_bytes)?;
    dev.disk.stream.seek_write(primary_offset, &primary_bytes)?;
    Ok(())
}

fn slot_index(dev: &GptDev, num: u64) -> Result<u32> {
    if num == 0 || num > dev.primary.ptable_entries as u64 {
        return Err(Error::Parse("partition number", num.to_string()));
    }
    Ok((num - 1) as u32)
}

fn parse_lba(name: &'static str, value: Option<&str>) -> Result<Option<u64>> {
    match value {
        None | Some("-") => Ok(None),
        Some(text) => text
            .parse()
            .map(Some)
            .map_err(|_| Error::Parse(name, text.to_string())),
    }
}

/// Interpret an attribute string character by character, most significant bit
/// first: `1` sets, `0` clears, `-` keeps, `+` toggles.
fn apply_attr_bits(entry: &mut Entry, text: &str, width: u32, base: u32) -> Result<()> {
    for (i, ch) in text.chars().enumerate() {
        let i = i as u32;
        if i >= width {
            return Err(Error::Parse("attribute string", text.to_string()));
        }
        let bit = base + (width - 1 - i);
        match ch {
            '1' => entry.set_attr_bit(bit, true),
            '0' => entry.set_attr_bit(bit, false),
            '-' => {}
            '+' => {
                let current = entry.attr_bit(bit);
                entry.set_attr_bit(bit, !current);
            }
            _ => return Err(Error::Parse("attribute string", text.to_string())),
        }
    }
    Ok(())
}
