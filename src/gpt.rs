use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;
use tracing::warn;

use crate::device::Disk;
use crate::error::{Error, Result};
use crate::guid;
use crate::mbr::{Mbr, MBR_SIZE};

// https://uefi.org/specs/UEFI/2.11/05_GUID_Partition_Table_Format.html
pub const SIGNATURE: &[u8; 8] = b"EFI PART";
/// Minimal header size; anything beyond it up to the logical block is
/// reserved and must be zero.
pub const HEADER_SIZE: u32 = 92;
/// Minimal partition entry size; larger powers of two are legal with a
/// zeroed tail.
pub const ENTRY_SIZE: u32 = 128;
/// The partition array must span at least this many bytes.
pub const MIN_TABLE_BYTES: u64 = 16 * 1024;
/// UTF-16 code units in a partition label.
pub const LABEL_UNITS: usize = 36;

/// Generic Linux data, the default type for new entries.
pub const LINUX_DATA_GUID: &str = "0fc63daf-8483-4772-8e79-3d69d8477de4";

/// Attribute bits 3..=47 are reserved and must read zero.
const RESERVED_ATTR_MASK: u64 = 0x0000_ffff_ffff_fff8;

/// GPT header in native field order; the wire form is little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub signature: [u8; 8],
    pub revision_minor: u16,
    pub revision_major: u16,
    pub header_size: u32,
    pub crc: u32,
    pub reserved: u32,
    pub this_lba: u64,
    pub alt_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub ptable_lba: u64,
    pub ptable_entries: u32,
    pub entry_size: u32,
    pub ptable_crc: u32,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            signature: *SIGNATURE,
            revision_minor: 0,
            revision_major: 1,
            header_size: HEADER_SIZE,
            crc: 0,
            reserved: 0,
            this_lba: 0,
            alt_lba: 0,
            first_usable_lba: 0,
            last_usable_lba: 0,
            disk_guid: [0; 16],
            ptable_lba: 0,
            ptable_entries: 0,
            entry_size: ENTRY_SIZE,
            ptable_crc: 0,
        }
    }
}

impl Header {
    /// Decode the first 92 bytes of a header block.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut signature = [0u8; 8];
        signature.copy_from_slice(&buf[0..8]);
        let mut disk_guid = [0u8; 16];
        disk_guid.copy_from_slice(&buf[56..72]);
        Self {
            signature,
            revision_minor: LittleEndian::read_u16(&buf[8..10]),
            revision_major: LittleEndian::read_u16(&buf[10..12]),
            header_size: LittleEndian::read_u32(&buf[12..16]),
            crc: LittleEndian::read_u32(&buf[16..20]),
            reserved: LittleEndian::read_u32(&buf[20..24]),
            this_lba: LittleEndian::read_u64(&buf[24..32]),
            alt_lba: LittleEndian::read_u64(&buf[32..40]),
            first_usable_lba: LittleEndian::read_u64(&buf[40..48]),
            last_usable_lba: LittleEndian::read_u64(&buf[48..56]),
            disk_guid,
            ptable_lba: LittleEndian::read_u64(&buf[72..80]),
            ptable_entries: LittleEndian::read_u32(&buf[80..84]),
            entry_size: LittleEndian::read_u32(&buf[84..88]),
            ptable_crc: LittleEndian::read_u32(&buf[88..92]),
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&self.signature);
        LittleEndian::write_u16(&mut buf[8..10], self.revision_minor);
        LittleEndian::write_u16(&mut buf[10..12], self.revision_major);
        LittleEndian::write_u32(&mut buf[12..16], self.header_size);
        LittleEndian::write_u32(&mut buf[16..20], self.crc);
        LittleEndian::write_u32(&mut buf[20..24], self.reserved);
        LittleEndian::write_u64(&mut buf[24..32], self.this_lba);
        LittleEndian::write_u64(&mut buf[32..40], self.alt_lba);
        LittleEndian::write_u64(&mut buf[40..48], self.first_usable_lba);
        LittleEndian::write_u64(&mut buf[48..56], self.last_usable_lba);
        buf[56..72].copy_from_slice(&self.disk_guid);
        LittleEndian::write_u64(&mut buf[72..80], self.ptable_lba);
        LittleEndian::write_u32(&mut buf[80..84], self.ptable_entries);
        LittleEndian::write_u32(&mut buf[84..88], self.entry_size);
        LittleEndian::write_u32(&mut buf[88..92], self.ptable_crc);
        buf
    }

    /// Checksum of the header with the CRC field zeroed, extended across the
    /// reserved tail when `header_size` exceeds the 92-byte minimum.
    pub fn compute_crc(&self) -> u32 {
        let mut bytes = self.to_bytes();
        LittleEndian::write_u32(&mut bytes[16..20], 0);
        let crc = crate::crc32::crc(0, &bytes);
        crate::crc32::crc_zero(crc, (self.header_size - HEADER_SIZE) as u64)
    }

    pub fn refresh_crc(&mut self) {
        self.crc = self.compute_crc();
    }

    pub fn array_bytes(&self) -> u64 {
        self.ptable_entries as u64 * self.entry_size as u64
    }

    /// Blocks occupied by the partition array, rounded up.
    pub fn table_blocks(&self, lbsz: u64) -> u64 {
        (self.array_bytes() + lbsz - 1) / lbsz
    }
}

/// Common EFI attribute bits.
pub const ATTR_REQUIRED: u32 = 0;
pub const ATTR_NO_BLOCKIO: u32 = 1;
pub const ATTR_LEGACY_BOOTABLE: u32 = 2;
/// First of the sixteen type-specific bits.
pub const ATTR_TYPE_SHIFT: u32 = 48;

/// One partition entry in native field order; 128 bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub type_guid: [u8; 16],
    pub part_guid: [u8; 16],
    pub start_lba: u64,
    pub end_lba: u64,
    pub attr: u64,
    pub label: [u16; LABEL_UNITS],
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            type_guid: [0; 16],
            part_guid: [0; 16],
            start_lba: 0,
            end_lba: 0,
            attr: 0,
            label: [0; LABEL_UNITS],
        }
    }
}

impl Entry {
    pub fn from_bytes(buf: &[u8]) -> Self {
        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&buf[0..16]);
        let mut part_guid = [0u8; 16];
        part_guid.copy_from_slice(&buf[16..32]);
        let mut label = [0u16; LABEL_UNITS];
        LittleEndian::read_u16_into(&buf[56..128], &mut label);
        Self {
            type_guid,
            part_guid,
            start_lba: LittleEndian::read_u64(&buf[32..40]),
            end_lba: LittleEndian::read_u64(&buf[40..48]),
            attr: LittleEndian::read_u64(&buf[48..56]),
            label,
        }
    }

    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE as usize] {
        let mut buf = [0u8; ENTRY_SIZE as usize];
        buf[0..16].copy_from_slice(&self.type_guid);
        buf[16..32].copy_from_slice(&self.part_guid);
        LittleEndian::write_u64(&mut buf[32..40], self.start_lba);
        LittleEndian::write_u64(&mut buf[40..48], self.end_lba);
        LittleEndian::write_u64(&mut buf[48..56], self.attr);
        LittleEndian::write_u16_into(&self.label, &mut buf[56..128]);
        buf
    }

    /// An all-zero type GUID marks an unused slot.
    pub fn is_used(&self) -> bool {
        !guid::is_zero(&self.type_guid)
    }

    pub fn attr_bit(&self, bit: u32) -> bool {
        (self.attr >> bit) & 1 != 0
    }

    pub fn set_attr_bit(&mut self, bit: u32, set: bool) {
        self.attr = (self.attr & !(1u64 << bit)) | ((set as u64) << bit);
    }

    pub fn required(&self) -> bool {
        self.attr_bit(ATTR_REQUIRED)
    }

    pub fn no_blockio(&self) -> bool {
        self.attr_bit(ATTR_NO_BLOCKIO)
    }

    pub fn legacy_bootable(&self) -> bool {
        self.attr_bit(ATTR_LEGACY_BOOTABLE)
    }

    /// The type-specific flag pack at bits 48..=63.
    pub fn type_attrs(&self) -> u16 {
        (self.attr >> ATTR_TYPE_SHIFT) as u16
    }

    pub fn set_type_attrs(&mut self, bits: u16) {
        self.attr = (self.attr & 0x0000_ffff_ffff_ffff) | ((bits as u64) << ATTR_TYPE_SHIFT);
    }

    /// Decode the label up to its first NUL.
    pub fn label(&self) -> String {
        let end = self
            .label
            .iter()
            .position(|&unit| unit == 0)
            .unwrap_or(LABEL_UNITS);
        String::from_utf16_lossy(&self.label[..end])
    }

    /// Encode `text` into the fixed label slot, zero padded. Surrogate pairs
    /// count as two code units.
    pub fn set_label(&mut self, text: &str) -> Result<()> {
        let units: Vec<u16> = text.encode_utf16().collect();
        if units.len() > LABEL_UNITS {
            return Err(Error::LabelTooLong(LABEL_UNITS));
        }
        self.label = [0; LABEL_UNITS];
        self.label[..units.len()].copy_from_slice(&units);
        Ok(())
    }
}

/// A populated slot of the partition array. `index` is zero-based; the CLI
/// and the report surface it one-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub index: u32,
    pub entry: Entry,
}

/// An opened device together with everything read from it.
///
/// The raw MBR and both header blocks are read once at open time; the
/// partition list is rebuilt from disk by every validation pass.
pub struct GptDev {
    pub disk: Disk,
    pub mbr: Mbr,
    pub primary: Header,
    pub backup: Header,
    pub parts: Vec<Slot>,
    pub is_valid: bool,
    pub sane_parts: bool,
}

impl GptDev {
    pub fn open(path: &Path, write: bool) -> Result<Self> {
        let mut disk = Disk::open(path, write)?;

        let mut mbr_buf = [0u8; MBR_SIZE];
        disk.stream.seek_read(0, &mut mbr_buf)?;
        let mbr = Mbr::from_bytes(&mbr_buf);

        let mut hdr_buf = [0u8; HEADER_SIZE as usize];
        disk.stream.seek_read(disk.lbsz, &mut hdr_buf)?;
        let primary = Header::from_bytes(&hdr_buf);
        disk.stream
            .seek_read(disk.last_lba * disk.lbsz, &mut hdr_buf)?;
        let backup = Header::from_bytes(&hdr_buf);

        Ok(Self {
            disk,
            mbr,
            primary,
            backup,
            parts: Vec::new(),
            is_valid: false,
            sane_parts: false,
        })
    }

    /// Parse and validate one header and its partition array.
    ///
    /// Returns the header and the populated slots. Errors map the failure
    /// modes: missing signature is `NotGpt`, structural oddities are
    /// `Unexpected`, checksum mismatches are `Corrupt` / `CorruptPtable`.
    pub fn validate_header(&mut self, expected_lba: u64) -> Result<(Header, Vec<Slot>)> {
        let lbsz = self.disk.lbsz;
        let mut buf = [0u8; HEADER_SIZE as usize];
        self.disk.stream.seek_read(expected_lba * lbsz, &mut buf)?;
        let hdr = Header::from_bytes(&buf);

        if hdr.signature != *SIGNATURE {
            return Err(Error::NotGpt);
        }
        if hdr.header_size < HEADER_SIZE || hdr.header_size as u64 > lbsz {
            return Err(Error::Unexpected("illegal header size"));
        }
        if hdr.revision_major != 1 || hdr.revision_minor != 0 {
            return Err(Error::Unexpected("unexpected GPT revision"));
        }

        // The header may be declared bigger than 92 bytes; the extra space is
        // covered by the checksum and must read zero on disk.
        if hdr.header_size > HEADER_SIZE {
            let tail = (hdr.header_size - HEADER_SIZE) as u64;
            let tail_off = expected_lba * lbsz + HEADER_SIZE as u64;
            if !self.disk.stream.read_is_zero(tail_off, tail)? {
                return Err(Error::Unexpected("reserved part of header not zero"));
            }
        }
        if hdr.compute_crc() != hdr.crc {
            return Err(Error::Corrupt);
        }

        if hdr.entry_size < ENTRY_SIZE || !hdr.entry_size.is_power_of_two() {
            return Err(Error::Unexpected("illegal partition entry size"));
        }
        if hdr.array_bytes() < MIN_TABLE_BYTES {
            return Err(Error::Unexpected("partition table too small"));
        }
        if hdr.first_usable_lba > hdr.last_usable_lba {
            return Err(Error::Unexpected("usable range inverted"));
        }

        let array_start = hdr.ptable_lba;
        let array_end = hdr.ptable_lba + hdr.table_blocks(lbsz) - 1;
        let contains = |lba: u64| array_start <= lba && lba <= array_end;
        if array_start <= 1 {
            return Err(Error::Unexpected("partition array overlaps MBR or header"));
        }
        if array_end > self.disk.last_lba {
            return Err(Error::Unexpected("partition array past end of device"));
        }
        if array_start <= hdr.last_usable_lba && hdr.first_usable_lba <= array_end {
            return Err(Error::Unexpected("partition array intersects usable range"));
        }
        if contains(expected_lba) || contains(hdr.alt_lba) {
            return Err(Error::Unexpected("partition array overlaps a header"));
        }

        // One seek, then scan every slot sequentially. The checksum covers
        // the raw bytes of each slot, zero-extended over any oversize tail.
        let mut parts = Vec::new();
        let mut calc_crc = 0u32;
        let mut entry_buf = vec![0u8; hdr.entry_size as usize];
        self.disk.stream.seek(hdr.ptable_lba * lbsz)?;
        for index in 0..hdr.ptable_entries {
            self.disk.stream.read_exact(&mut entry_buf)?;
            let used = &entry_buf[..ENTRY_SIZE as usize];
            let entry = Entry::from_bytes(used);

            if entry.attr & RESERVED_ATTR_MASK != 0 {
                return Err(Error::Unexpected(
                    "partition attributes set in reserved field",
                ));
            }

            calc_crc = crate::crc32::crc(calc_crc, used);
            if hdr.entry_size > ENTRY_SIZE {
                let tail = &entry_buf[ENTRY_SIZE as usize..];
                calc_crc = crate::crc32::crc_zero(calc_crc, tail.len() as u64);
                if !guid::is_zero(tail) {
                    return Err(Error::Unexpected("reserved part of entry not zero"));
                }
            }

            if entry.is_used() {
                parts.push(Slot { index, entry });
            } else if !guid::is_zero(used) {
                return Err(Error::Unexpected("unused slot not zero"));
            }
        }
        if calc_crc != hdr.ptable_crc {
            return Err(Error::CorruptPtable);
        }

        if hdr.this_lba != expected_lba {
            return Err(Error::Unexpected("header reports a different location"));
        }

        Ok((hdr, parts))
    }

    /// Validate primary and backup, reconcile the two and rebuild the
    /// in-memory partition list. Leaves `is_valid` / `sane_parts` describing
    /// the outcome; the returned error says which side failed how.
    pub fn check_device(&mut self) -> Result<()> {
        self.is_valid = false;
        self.sane_parts = false;
        self.parts.clear();

        let primary = self.validate_header(1);
        let backup = self.validate_header(self.disk.last_lba);

        let ((primary, parts), (alt, alt_parts)) = match (primary, backup) {
            (Err(Error::NotGpt), Err(Error::NotGpt)) => return Err(Error::NotGpt),
            (Err(err), Ok(_)) => {
                warn!(
                    "primary GPT table is faulty but the backup appears fine, \
                     maybe try restoring the primary?"
                );
                return Err(err);
            }
            (Ok(_), Err(_)) => {
                warn!(
                    "backup GPT table is faulty but the primary appears fine, \
                     maybe try rewriting the backup?"
                );
                return Err(Error::CorruptBackup);
            }
            (Err(err), Err(_)) => {
                warn!("both primary and backup tables are faulty");
                return Err(err);
            }
            (Ok(primary), Ok(backup)) => (primary, backup),
        };

        if primary.alt_lba != self.disk.last_lba {
            return Err(Error::Unexpected("unexpected alt LBA in primary"));
        }
        if alt.alt_lba != 1 {
            return Err(Error::Unexpected("unexpected alt LBA in backup"));
        }
        if alt.ptable_crc != primary.ptable_crc {
            return Err(Error::Unexpected("backup table has different contents"));
        }
        if alt.disk_guid != primary.disk_guid {
            return Err(Error::Unexpected("backup has a different disk GUID"));
        }
        if alt_parts.len() != parts.len() {
            return Err(Error::Unexpected(
                "primary and backup disagree on populated slots",
            ));
        }

        self.primary = primary;
        self.backup = alt;
        self.parts = parts;
        self.is_valid = true;
        self.sane_parts = overlap_check(
            &self.parts,
            self.primary.first_usable_lba,
            self.primary.last_usable_lba,
        );
        Ok(())
    }

    /// Gate for mutating operations: revalidates from disk and refuses to
    /// continue unless both tables check out.
    pub fn ensure_valid(&mut self) -> Result<()> {
        self.check_device()
    }
}

/// Walk the populated entries in start order and flag every bounds or overlap
/// violation. Returns whether the list is sane; problems are warnings, not
/// errors, so repair commands can still run.
pub fn overlap_check(parts: &[Slot], first_usable: u64, last_usable: u64) -> bool {
    let mut sorted: Vec<&Slot> = parts.iter().collect();
    sorted.sort_by_key(|slot| slot.entry.start_lba);

    let mut sane = true;
    let mut prev: Option<&Slot> = None;
    for slot in sorted {
        let num = slot.index + 1;
        let entry = &slot.entry;
        if entry.start_lba > entry.end_lba {
            warn!("partition {num} ends before it starts");
            sane = false;
        }
        if entry.start_lba < first_usable {
            warn!("partition {num} starts before the usable range");
            sane = false;
        }
        if entry.end_lba > last_usable {
            warn!("partition {num} ends after the usable range");
            sane = false;
        }
        if let Some(prev) = prev {
            if entry.start_lba <= prev.entry.end_lba {
                warn!("partition {num} overlaps partition {}", prev.index + 1);
                sane = false;
            }
        }
        prev = Some(slot);
    }
    sane
}
