use std::path::Path;

use anyhow::Context as _;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tracing::{error, warn};

use gptool::gpt::{GptDev, ENTRY_SIZE, HEADER_SIZE};
use gptool::guid;
use gptool::platform;
use gptool::report::Reporter;
use gptool::writer::{self, SetFields, TableSpec};

/// One element of the left-to-right command sequence, tagged with its
/// position on the command line.
#[derive(Debug, Clone)]
enum Op {
    Lbsz(u64),
    LastLba(u64),
    Geometry(u32, u32),
    Entries(u32),
    Uuid(String),
    Padding([u64; 4]),
    Sizing(u32, u32),
    Print,
    WriteMbr,
    WriteGpt,
    Relabel,
    RestorePrimary,
    RestoreBackup,
    Set(Vec<String>),
    SetPos(Vec<String>),
    Delete(u64),
    Move(u64, u64),
}

fn cli() -> Command {
    Command::new("gptool")
        .about("Print or modify contents of GPT partition tables")
        .after_help(
            "If no DEVICE is given, every known block device is printed.\n\
             COMMANDS are processed in the order given; with none, DEVICE is printed.\n\n\
             WARNING: this is a raw editing tool primarily for scripts. Most commands\n\
             are performed with no sanity checks or confirmations.",
        )
        .arg(
            Arg::new("device")
                .value_name("DEVICE")
                .help("Block device or image file to operate on"),
        )
        .arg(
            Arg::new("lbsz")
                .short('L')
                .value_name("LBSZ")
                .help("Override logical block size (normally reported, or 512); useful if DEVICE is a file")
                .action(ArgAction::Append)
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("last")
                .short('B')
                .value_name("BLOCK")
                .help("Override last block of DEVICE (total size in blocks - 1)")
                .action(ArgAction::Append)
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("geometry")
                .short('G')
                .value_names(["HPC", "SPT"])
                .num_args(2)
                .help("Override geometry: heads per cylinder (255), sectors per track (63); used in building the protective MBR")
                .action(ArgAction::Append)
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("entries")
                .short('N')
                .value_name("MAX")
                .help("Use MAX entries when building a GPT table, defaults to 128; be careful the table itself won't overlap the first partition")
                .action(ArgAction::Append)
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("uuid")
                .short('U')
                .value_name("UUID")
                .help("Use a specific disk UUID when building (-g) or relabeling (-r)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("padding")
                .short('P')
                .value_names(["A", "B", "C", "D"])
                .num_args(4)
                .help("Blocks of padding around the partition arrays when building (-g): before/after the primary, before/after the backup")
                .action(ArgAction::Append)
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("sizing")
                .short('R')
                .value_names(["HDR_SZ", "PART_SZ"])
                .num_args(2)
                .help("Custom header and entry sizing when building (-g): HDR_SZ fits one block, PART_SZ is a power of two >= 128")
                .action(ArgAction::Append)
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("print")
                .short('p')
                .help("Print device, MBR, partitions and free gaps")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("write-mbr")
                .short('b')
                .help("Build and write a new protective MBR")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("write-gpt")
                .short('g')
                .help("Build and write a new blank GPT table (wipes all partitions!)")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("relabel")
                .short('r')
                .help("Relabel an existing table with -U UUID, or a fresh random one")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("restore-primary")
                .short('f')
                .help("Restore the primary table from the backup")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("restore-backup")
                .short('l')
                .help("Restore the backup table from the primary")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("set")
                .short('s')
                .value_name("NUM K=V...")
                .num_args(1..)
                .help("Set entry NUM from named fields p/s/e/t/a/c/l (partuuid, start, end, type, type-attrs, common-attrs, label)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("set-pos")
                .short('x')
                .value_names(["NUM", "PARTID", "START", "END", "TYPEID", "TYPEATTR", "CMNATTR", "LABEL"])
                .num_args(8)
                .allow_hyphen_values(true)
                .help("Set entry NUM from positional fields; '-' skips a field")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("delete")
                .short('d')
                .value_name("NUM")
                .help("Delete entry NUM")
                .action(ArgAction::Append)
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("move")
                .short('m')
                .value_names(["FROM", "TO"])
                .num_args(2)
                .help("Renumber entry FROM to the empty slot TO")
                .action(ArgAction::Append)
                .value_parser(value_parser!(u64)),
        )
}

/// Rebuild the left-to-right command sequence from argument indices.
fn collect_ops(matches: &ArgMatches) -> anyhow::Result<Vec<(usize, Op)>> {
    let mut ops = Vec::new();

    for (id, op) in [
        ("print", Op::Print),
        ("write-mbr", Op::WriteMbr),
        ("write-gpt", Op::WriteGpt),
        ("relabel", Op::Relabel),
        ("restore-primary", Op::RestorePrimary),
        ("restore-backup", Op::RestoreBackup),
    ] {
        if let Some(indices) = matches.indices_of(id) {
            for index in indices {
                ops.push((index, op.clone()));
            }
        }
    }

    if let (Some(values), Some(indices)) = (matches.get_many::<u64>("lbsz"), matches.indices_of("lbsz")) {
        for (value, index) in values.zip(indices) {
            ops.push((index, Op::Lbsz(*value)));
        }
    }
    if let (Some(values), Some(indices)) = (matches.get_many::<u64>("last"), matches.indices_of("last")) {
        for (value, index) in values.zip(indices) {
            ops.push((index, Op::LastLba(*value)));
        }
    }
    if let (Some(values), Some(indices)) = (matches.get_many::<u32>("entries"), matches.indices_of("entries")) {
        for (value, index) in values.zip(indices) {
            ops.push((index, Op::Entries(*value)));
        }
    }
    if let (Some(values), Some(indices)) = (matches.get_many::<String>("uuid"), matches.indices_of("uuid")) {
        for (value, index) in values.zip(indices) {
            ops.push((index, Op::Uuid(value.clone())));
        }
    }
    if let (Some(values), Some(indices)) = (matches.get_many::<u64>("delete"), matches.indices_of("delete")) {
        for (value, index) in values.zip(indices) {
            ops.push((index, Op::Delete(*value)));
        }
    }

    if let (Some(values), Some(indices)) = (matches.get_many::<u32>("geometry"), matches.indices_of("geometry")) {
        let values: Vec<u32> = values.copied().collect();
        let indices: Vec<usize> = indices.collect();
        for (pair, at) in values.chunks(2).zip(indices.chunks(2)) {
            ops.push((at[0], Op::Geometry(pair[0], pair[1])));
        }
    }
    if let (Some(values), Some(indices)) = (matches.get_many::<u32>("sizing"), matches.indices_of("sizing")) {
        let values: Vec<u32> = values.copied().collect();
        let indices: Vec<usize> = indices.collect();
        for (pair, at) in values.chunks(2).zip(indices.chunks(2)) {
            ops.push((at[0], Op::Sizing(pair[0], pair[1])));
        }
    }
    if let (Some(values), Some(indices)) = (matches.get_many::<u64>("padding"), matches.indices_of("padding")) {
        let values: Vec<u64> = values.copied().collect();
        let indices: Vec<usize> = indices.collect();
        for (quad, at) in values.chunks(4).zip(indices.chunks(4)) {
            ops.push((at[0], Op::Padding([quad[0], quad[1], quad[2], quad[3]])));
        }
    }
    if let (Some(values), Some(indices)) = (matches.get_many::<u64>("move"), matches.indices_of("move")) {
        let values: Vec<u64> = values.copied().collect();
        let indices: Vec<usize> = indices.collect();
        for (pair, at) in values.chunks(2).zip(indices.chunks(2)) {
            ops.push((at[0], Op::Move(pair[0], pair[1])));
        }
    }
    if let (Some(values), Some(indices)) = (matches.get_many::<String>("set-pos"), matches.indices_of("set-pos")) {
        let values: Vec<String> = values.cloned().collect();
        let indices: Vec<usize> = indices.collect();
        for (group, at) in values.chunks(8).zip(indices.chunks(8)) {
            ops.push((at[0], Op::SetPos(group.to_vec())));
        }
    }

    if let Some(occurrences) = matches.get_occurrences::<String>("set") {
        let mut indices = matches.indices_of("set").into_iter().flatten();
        for occurrence in occurrences {
            let values: Vec<String> = occurrence.cloned().collect();
            let first = indices.next().context("lost track of a set command")?;
            for _ in 1..values.len() {
                indices.next();
            }
            ops.push((first, Op::Set(values)));
        }
    }

    ops.sort_by_key(|(index, _)| *index);
    Ok(ops)
}

fn parse_set_named(args: &[String]) -> anyhow::Result<(u64, SetFields)> {
    let (num_text, rest) = args.split_first().context("set needs a partition number")?;
    let num: u64 = num_text
        .parse()
        .with_context(|| format!("bad partition number {num_text:?}"))?;

    let mut fields = SetFields::default();
    for field in rest {
        let (key, value) = field
            .split_once('=')
            .with_context(|| format!("expected KEY=VALUE, got {field:?}"))?;
        let slot = match key {
            "p" => &mut fields.part_guid,
            "s" => &mut fields.start,
            "e" => &mut fields.end,
            "t" => &mut fields.type_guid,
            "a" => &mut fields.type_attrs,
            "c" => &mut fields.common_attrs,
            "l" => &mut fields.label,
            _ => anyhow::bail!("unknown set field {key:?}"),
        };
        *slot = Some(value.to_string());
    }
    Ok((num, fields))
}

fn parse_set_positional(args: &[String]) -> anyhow::Result<(u64, SetFields)> {
    let num: u64 = args[0]
        .parse()
        .with_context(|| format!("bad partition number {:?}", args[0]))?;
    let field = |i: usize| {
        if args[i] == "-" {
            None
        } else {
            Some(args[i].clone())
        }
    };
    Ok((
        num,
        SetFields {
            part_guid: field(1),
            start: field(2),
            end: field(3),
            type_guid: field(4),
            type_attrs: field(5),
            common_attrs: field(6),
            label: field(7),
        },
    ))
}

fn run() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let mut reporter = Reporter::new();

    // With no device argument, dump every device the platform knows about.
    let Some(device) = matches.get_one::<String>("device") else {
        for path in platform::list_devices().context("could not enumerate block devices")? {
            let mut dev = match GptDev::open(&path, false) {
                Ok(dev) => dev,
                Err(err) => {
                    warn!("skipping {}: {err}", path.display());
                    continue;
                }
            };
            reporter.print_device(&mut dev)?;
        }
        return Ok(());
    };

    let ops = collect_ops(&matches)?;
    let mut dev = GptDev::open(Path::new(device), true)
        .with_context(|| format!("could not open {device}"))?;
    let mut spec = TableSpec::default();
    let mut acted = false;

    for (_, op) in ops {
        match op {
            Op::Lbsz(value) => {
                warn!("overriding logical block size to {value}");
                dev.disk.lbsz = value;
            }
            Op::LastLba(value) => {
                warn!("overriding last LBA to {value}");
                dev.disk.last_lba = value;
            }
            Op::Geometry(heads, sectors) => {
                warn!("overriding geometry hpc:{heads} spt:{sectors}");
                dev.disk.geometry.heads = heads;
                dev.disk.geometry.sectors = sectors;
            }
            Op::Entries(max) => spec.max_entries = max,
            Op::Uuid(text) => spec.disk_guid = Some(guid::from_text(&text)?),
            Op::Padding(padding) => spec.padding = padding,
            Op::Sizing(hdr_size, entry_size) => {
                if hdr_size < HEADER_SIZE || hdr_size as u64 > dev.disk.lbsz {
                    anyhow::bail!("invalid header size {hdr_size}");
                }
                if entry_size < ENTRY_SIZE || !entry_size.is_power_of_two() {
                    anyhow::bail!("invalid partition entry size {entry_size}");
                }
                spec.hdr_size = hdr_size;
                spec.entry_size = entry_size;
            }
            Op::Print => {
                acted = true;
                reporter.print_device(&mut dev)?;
            }
            Op::WriteMbr => {
                acted = true;
                writer::write_mbr(&mut dev)?;
            }
            Op::WriteGpt => {
                acted = true;
                writer::write_gpt(&mut dev, &spec)?;
            }
            Op::Relabel => {
                acted = true;
                writer::relabel(&mut dev, &spec)?;
            }
            Op::RestorePrimary => {
                acted = true;
                writer::restore_primary(&mut dev, &spec)?;
            }
            Op::RestoreBackup => {
                acted = true;
                writer::restore_backup(&mut dev, &spec)?;
            }
            Op::Set(args) => {
                acted = true;
                let (num, fields) = parse_set_named(&args)?;
                writer::set_entry(&mut dev, num, &fields)?;
            }
            Op::SetPos(args) => {
                acted = true;
                let (num, fields) = parse_set_positional(&args)?;
                writer::set_entry(&mut dev, num, &fields)?;
            }
            Op::Delete(num) => {
                acted = true;
                writer::del_entry(&mut dev, num)?;
            }
            Op::Move(from, to) => {
                acted = true;
                writer::move_entry(&mut dev, from, to)?;
            }
        }
    }

    if !acted {
        reporter.print_device(&mut dev)?;
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();

    if let Err(err) = run() {
        error!("{err:#}");
        std::process::exit(1);
    }
}
