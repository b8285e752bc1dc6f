//! End-to-end table operations against a scratch disk image.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use tempfile::NamedTempFile;

use gptool::freespace;
use gptool::gpt::{GptDev, LINUX_DATA_GUID};
use gptool::guid;
use gptool::report::Reporter;
use gptool::writer::{self, SetFields, TableSpec};
use gptool::Error;

const IMAGE_BYTES: u64 = 100 * 1024 * 1024;
const LAST_LBA: u64 = 204_799;
const EFI_SYSTEM: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";

fn blank_image() -> NamedTempFile {
    let tmp = NamedTempFile::new().unwrap();
    tmp.as_file().set_len(IMAGE_BYTES).unwrap();
    tmp
}

fn open(tmp: &NamedTempFile) -> GptDev {
    GptDev::open(tmp.path(), true).unwrap()
}

fn fresh_table(tmp: &NamedTempFile) -> GptDev {
    let mut dev = open(tmp);
    writer::write_mbr(&mut dev).unwrap();
    writer::write_gpt(&mut dev, &TableSpec::default()).unwrap();
    dev
}

fn flip_byte(tmp: &NamedTempFile, offset: u64) {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(tmp.path())
        .unwrap();
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.read_exact(&mut byte).unwrap();
    byte[0] ^= 0xff;
    file.seek(SeekFrom::Start(offset)).unwrap();
    file.write_all(&byte).unwrap();
}

fn assert_symmetry(dev: &GptDev) {
    assert_eq!(dev.primary.ptable_crc, dev.backup.ptable_crc);
    assert_eq!(dev.primary.disk_guid, dev.backup.disk_guid);
    assert_eq!(dev.primary.this_lba, 1);
    assert_eq!(dev.backup.this_lba, LAST_LBA);
    assert_eq!(dev.primary.alt_lba, LAST_LBA);
    assert_eq!(dev.backup.alt_lba, 1);
}

#[test]
fn fresh_table_layout() {
    let tmp = blank_image();
    {
        let mut dev = open(&tmp);
        writer::write_gpt(&mut dev, &TableSpec::default()).unwrap();
        assert!(dev.is_valid);
    }

    // a fresh handle sees a valid table with the default layout
    let mut dev = open(&tmp);
    dev.check_device().unwrap();
    assert!(dev.is_valid);
    assert!(dev.sane_parts);
    assert!(dev.parts.is_empty());
    assert_eq!(dev.primary.first_usable_lba, 34);
    assert_eq!(dev.primary.last_usable_lba, 204_766);
    assert_eq!(dev.primary.ptable_lba, 2);
    assert_eq!(dev.backup.ptable_lba, 204_767);
    assert_eq!(dev.primary.ptable_entries, 128);
    assert_symmetry(&dev);

    // the generated disk GUID is a proper version 4
    let text = guid::to_text(&dev.primary.disk_guid);
    assert_eq!(text.chars().nth(14), Some('4'));
}

#[test]
fn fresh_table_keeps_preset_guid() {
    let tmp = blank_image();
    let spec = TableSpec {
        disk_guid: Some(guid::from_text(EFI_SYSTEM).unwrap()),
        ..Default::default()
    };
    {
        let mut dev = open(&tmp);
        writer::write_gpt(&mut dev, &spec).unwrap();
    }

    let mut dev = open(&tmp);
    dev.check_device().unwrap();
    assert_eq!(guid::to_text(&dev.primary.disk_guid), EFI_SYSTEM);
    assert_eq!(dev.primary.disk_guid, dev.backup.disk_guid);
}

#[test]
fn padding_moves_the_arrays() {
    let tmp = blank_image();
    let spec = TableSpec {
        padding: [3, 5, 7, 11],
        ..Default::default()
    };
    let dev = {
        let mut dev = open(&tmp);
        writer::write_gpt(&mut dev, &spec).unwrap();
        dev
    };
    assert_eq!(dev.primary.ptable_lba, 5);
    assert_eq!(dev.primary.first_usable_lba, 2 + 3 + 32 + 5);
    assert_eq!(dev.primary.last_usable_lba, LAST_LBA - 1 - 11 - 32 - 7);
    assert_eq!(dev.backup.ptable_lba, dev.primary.last_usable_lba + 1 + 7);
}

#[test]
fn protective_mbr_written() {
    let tmp = blank_image();
    {
        let mut dev = open(&tmp);
        writer::write_mbr(&mut dev).unwrap();
    }

    let dev = open(&tmp);
    assert!(dev.mbr.is_present());
    assert_eq!(dev.mbr.parts[0].part_type, 0xee);
    assert_eq!(dev.mbr.parts[0].start_lba, 1);
    assert_eq!(dev.mbr.parts[0].size_lba, LAST_LBA as u32);
}

#[test]
fn set_entry_round_trip() {
    let tmp = blank_image();
    let mut dev = fresh_table(&tmp);

    writer::set_entry(
        &mut dev,
        1,
        &SetFields {
            start: Some("34".into()),
            end: Some("20033".into()),
            type_guid: Some(EFI_SYSTEM.into()),
            label: Some("boot".into()),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(dev.sane_parts);

    // durability: a fresh handle sees the same entry
    let mut dev = open(&tmp);
    dev.check_device().unwrap();
    assert_eq!(dev.parts.len(), 1);
    let slot = &dev.parts[0];
    assert_eq!(slot.index, 0);
    assert_eq!(slot.entry.start_lba, 34);
    assert_eq!(slot.entry.end_lba, 20_033);
    assert_eq!(slot.entry.label(), "boot");
    assert_eq!(guid::to_text(&slot.entry.type_guid), EFI_SYSTEM);
    assert!(!guid::is_zero(&slot.entry.part_guid));
    assert_symmetry(&dev);
}

#[test]
fn open_ended_entry_takes_the_first_gap() {
    let tmp = blank_image();
    let mut dev = fresh_table(&tmp);
    writer::set_entry(
        &mut dev,
        1,
        &SetFields {
            start: Some("34".into()),
            end: Some("20033".into()),
            type_guid: Some(EFI_SYSTEM.into()),
            label: Some("boot".into()),
            ..Default::default()
        },
    )
    .unwrap();

    // no start/end at all: the remaining space after partition 1
    writer::set_entry(
        &mut dev,
        2,
        &SetFields {
            label: Some("root".into()),
            ..Default::default()
        },
    )
    .unwrap();

    let mut dev = open(&tmp);
    dev.check_device().unwrap();
    assert_eq!(dev.parts.len(), 2);
    let root = dev.parts.iter().find(|slot| slot.index == 1).unwrap();
    assert_eq!(root.entry.start_lba, 20_034);
    assert_eq!(root.entry.end_lba, 204_766);
    assert_eq!(guid::to_text(&root.entry.type_guid), LINUX_DATA_GUID);
    assert_eq!(root.entry.label(), "root");
}

#[test]
fn delete_zeroes_the_slot_and_frees_space() {
    let tmp = blank_image();
    let mut dev = fresh_table(&tmp);
    writer::set_entry(
        &mut dev,
        1,
        &SetFields {
            start: Some("34".into()),
            end: Some("20033".into()),
            ..Default::default()
        },
    )
    .unwrap();
    writer::set_entry(
        &mut dev,
        2,
        &SetFields {
            start: Some("20034".into()),
            end: Some("204766".into()),
            ..Default::default()
        },
    )
    .unwrap();

    writer::del_entry(&mut dev, 1).unwrap();

    let mut dev = open(&tmp);
    dev.check_device().unwrap();
    assert_eq!(dev.parts.len(), 1);
    assert_eq!(dev.parts[0].index, 1);

    let free = freespace::gaps(
        &dev.parts,
        dev.primary.first_usable_lba,
        dev.primary.last_usable_lba,
    );
    assert_eq!(free.len(), 1);
    assert_eq!((free[0].start, free[0].end), (34, 20_033));
}

#[test]
fn delete_undoes_set() {
    let tmp = blank_image();
    let mut dev = fresh_table(&tmp);
    let before = dev.primary.ptable_crc;

    writer::set_entry(
        &mut dev,
        5,
        &SetFields {
            start: Some("1000".into()),
            end: Some("2000".into()),
            label: Some("scratch".into()),
            ..Default::default()
        },
    )
    .unwrap();
    assert_ne!(dev.primary.ptable_crc, before);

    writer::del_entry(&mut dev, 5).unwrap();
    assert_eq!(dev.primary.ptable_crc, before);
    assert_eq!(dev.backup.ptable_crc, before);
}

#[test]
fn corrupt_primary_is_detected_and_restored() {
    let tmp = blank_image();
    {
        fresh_table(&tmp);
    }

    // one flipped byte in the primary header's this_lba field
    flip_byte(&tmp, 512 + 24);

    let mut dev = open(&tmp);
    assert!(matches!(dev.check_device(), Err(Error::Corrupt)));
    assert!(!dev.is_valid);

    writer::restore_primary(&mut dev, &TableSpec::default()).unwrap();
    assert!(dev.is_valid);

    let mut dev = open(&tmp);
    dev.check_device().unwrap();
    assert_symmetry(&dev);
}

#[test]
fn corrupt_backup_is_detected_and_restored() {
    let tmp = blank_image();
    {
        fresh_table(&tmp);
    }

    flip_byte(&tmp, LAST_LBA * 512 + 24);

    let mut dev = open(&tmp);
    assert!(matches!(dev.check_device(), Err(Error::CorruptBackup)));

    writer::restore_backup(&mut dev, &TableSpec::default()).unwrap();
    assert!(dev.is_valid);

    let mut dev = open(&tmp);
    dev.check_device().unwrap();
    assert_symmetry(&dev);
}

#[test]
fn corrupt_array_is_detected() {
    let tmp = blank_image();
    {
        let mut dev = fresh_table(&tmp);
        writer::set_entry(
            &mut dev,
            1,
            &SetFields {
                start: Some("34".into()),
                end: Some("20033".into()),
                ..Default::default()
            },
        )
        .unwrap();
    }

    // damage the first entry without touching either header
    flip_byte(&tmp, 2 * 512 + 40);

    let mut dev = open(&tmp);
    assert!(matches!(dev.check_device(), Err(Error::CorruptPtable)));
}

#[test]
fn move_renumbers_a_slot() {
    let tmp = blank_image();
    let mut dev = fresh_table(&tmp);
    writer::set_entry(
        &mut dev,
        2,
        &SetFields {
            start: Some("100".into()),
            end: Some("200".into()),
            label: Some("lonely".into()),
            ..Default::default()
        },
    )
    .unwrap();

    writer::move_entry(&mut dev, 2, 7).unwrap();

    let mut dev = open(&tmp);
    dev.check_device().unwrap();
    assert_eq!(dev.parts.len(), 1);
    assert_eq!(dev.parts[0].index, 6);
    assert_eq!(dev.parts[0].entry.label(), "lonely");
    assert_symmetry(&dev);

    // the old slot is gone, the destination must be empty
    assert!(writer::move_entry(&mut dev, 2, 8).is_err());
    assert!(writer::move_entry(&mut dev, 7, 7).is_err());
}

#[test]
fn relabel_changes_both_headers() {
    let tmp = blank_image();
    let mut dev = fresh_table(&tmp);
    let old = dev.primary.disk_guid;

    writer::relabel(&mut dev, &TableSpec::default()).unwrap();

    let mut dev = open(&tmp);
    dev.check_device().unwrap();
    assert_ne!(dev.primary.disk_guid, old);
    assert_eq!(dev.primary.disk_guid, dev.backup.disk_guid);

    let preset = guid::from_text(EFI_SYSTEM).unwrap();
    let spec = TableSpec {
        disk_guid: Some(preset),
        ..Default::default()
    };
    writer::relabel(&mut dev, &spec).unwrap();
    let mut dev = open(&tmp);
    dev.check_device().unwrap();
    assert_eq!(dev.primary.disk_guid, preset);
}

#[test]
fn set_entry_rejects_bad_input() {
    let tmp = blank_image();
    let mut dev = fresh_table(&tmp);

    // slot numbers are one-based and bounded by the entry count
    assert!(writer::set_entry(&mut dev, 0, &SetFields::default()).is_err());
    assert!(writer::set_entry(&mut dev, 129, &SetFields::default()).is_err());

    let out_of_range = SetFields {
        start: Some("10".into()),
        end: Some("100".into()),
        ..Default::default()
    };
    assert!(matches!(
        writer::set_entry(&mut dev, 1, &out_of_range),
        Err(Error::Parse(_, _))
    ));

    let past_the_end = SetFields {
        start: Some("204766".into()),
        end: Some("204800".into()),
        ..Default::default()
    };
    assert!(matches!(
        writer::set_entry(&mut dev, 1, &past_the_end),
        Err(Error::Parse(_, _))
    ));

    let bad_type = SetFields {
        start: Some("34".into()),
        end: Some("100".into()),
        type_guid: Some("junk".into()),
        ..Default::default()
    };
    assert!(matches!(
        writer::set_entry(&mut dev, 1, &bad_type),
        Err(Error::BadUuid(_))
    ));

    let long_label = SetFields {
        start: Some("34".into()),
        end: Some("100".into()),
        label: Some("x".repeat(37)),
        ..Default::default()
    };
    assert!(matches!(
        writer::set_entry(&mut dev, 1, &long_label),
        Err(Error::LabelTooLong(_))
    ));

    // nothing was committed by the failed attempts
    let mut dev = open(&tmp);
    dev.check_device().unwrap();
    assert!(dev.parts.is_empty());
}

#[test]
fn full_table_reports_no_fit() {
    let tmp = blank_image();
    let mut dev = fresh_table(&tmp);
    writer::set_entry(
        &mut dev,
        1,
        &SetFields {
            start: Some("34".into()),
            end: Some("204766".into()),
            ..Default::default()
        },
    )
    .unwrap();

    assert!(matches!(
        writer::set_entry(&mut dev, 2, &SetFields::default()),
        Err(Error::NoFit)
    ));
}

#[test]
fn mutation_requires_a_valid_table() {
    let tmp = blank_image();
    let mut dev = open(&tmp);
    assert!(matches!(
        writer::set_entry(&mut dev, 1, &SetFields::default()),
        Err(Error::NotGpt)
    ));
    assert!(matches!(
        writer::del_entry(&mut dev, 1),
        Err(Error::NotGpt)
    ));
    assert!(matches!(
        writer::relabel(&mut dev, &TableSpec::default()),
        Err(Error::NotGpt)
    ));
}

#[test]
fn report_runs_on_blank_and_valid_images() {
    let tmp = blank_image();
    let mut reporter = Reporter::new();

    let mut dev = open(&tmp);
    reporter.print_device(&mut dev).unwrap();

    let mut dev = fresh_table(&tmp);
    writer::set_entry(
        &mut dev,
        1,
        &SetFields {
            start: Some("34".into()),
            end: Some("20033".into()),
            label: Some("boot".into()),
            ..Default::default()
        },
    )
    .unwrap();
    reporter.print_device(&mut dev).unwrap();
}

#[test]
fn custom_sizing_round_trips() {
    let tmp = blank_image();
    let spec = TableSpec {
        hdr_size: 256,
        entry_size: 256,
        ..Default::default()
    };
    {
        let mut dev = open(&tmp);
        writer::write_gpt(&mut dev, &spec).unwrap();
    }

    let mut dev = open(&tmp);
    dev.check_device().unwrap();
    assert_eq!(dev.primary.header_size, 256);
    assert_eq!(dev.primary.entry_size, 256);
    // 128 entries of 256 bytes is 64 blocks of array on each side
    assert_eq!(dev.primary.first_usable_lba, 2 + 64);

    writer::set_entry(
        &mut dev,
        3,
        &SetFields {
            label: Some("wide".into()),
            ..Default::default()
        },
    )
    .unwrap();

    let mut dev = open(&tmp);
    dev.check_device().unwrap();
    assert_eq!(dev.parts.len(), 1);
    assert_eq!(dev.parts[0].entry.label(), "wide");
}
