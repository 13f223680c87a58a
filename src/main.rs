use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{LevelFilter, Log, Metadata, Record};

use rusty_fat::check::report::format_size;
use rusty_fat::check::{run_check, CheckLevel, CheckOptions};
use rusty_fat::config::{Config, Verbosity};
use rusty_fat::device::ImageDevice;
use rusty_fat::fat::{ClusterTable, VolumeGeometry};
use rusty_fat::fs::FatDirectoryTree;

const USAGE: &str = "\
Usage: rusty-fat <command> <image> [options]

Commands:
  info     show volume parameters
  free     show free space and the longest free run
  check    check the volume for lost and cross-linked clusters

Options:
  --offset N       partition byte offset inside the image
  --repair         fix what check finds (opens the image writable)
  --json           print machine-readable output
  -v, -q           more or less logging
  --config FILE    read settings from FILE";

/// Exit status when check finds problems.
const EXIT_FINDINGS: u8 = 1;
const EXIT_FATAL: u8 = 2;

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(verbosity: Verbosity) {
    let level = match verbosity {
        Verbosity::Quiet => LevelFilter::Error,
        Verbosity::Normal => LevelFilter::Info,
        Verbosity::Verbose => LevelFilter::Debug,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

#[derive(Debug, Default)]
struct Args {
    command: String,
    image: PathBuf,
    offset: u64,
    repair: bool,
    json: bool,
    verbosity: Option<Verbosity>,
    config: Option<PathBuf>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let command = args.next().context("no command given")?;
    let mut parsed = Args {
        command,
        ..Args::default()
    };
    let mut image = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--offset" => {
                let value = args.next().context("--offset needs a value")?;
                parsed.offset = value
                    .parse()
                    .with_context(|| format!("bad offset '{value}'"))?;
            }
            "--repair" => parsed.repair = true,
            "--json" => parsed.json = true,
            "-v" | "--verbose" => parsed.verbosity = Some(Verbosity::Verbose),
            "-q" | "--quiet" => parsed.verbosity = Some(Verbosity::Quiet),
            "--config" => {
                let value = args.next().context("--config needs a file")?;
                parsed.config = Some(PathBuf::from(value));
            }
            flag if flag.starts_with('-') => bail!("unknown option '{flag}'"),
            path => {
                if image.is_some() {
                    bail!("more than one image given");
                }
                image = Some(PathBuf::from(path));
            }
        }
    }

    parsed.image = image.context("no image given")?;
    Ok(parsed)
}

fn main() -> ExitCode {
    let mut argv = std::env::args().skip(1).peekable();
    match argv.peek().map(String::as_str) {
        Some("--version") | Some("version") => {
            println!("rusty-fat {}", env!("APP_VERSION"));
            return ExitCode::SUCCESS;
        }
        Some("--help") | Some("-h") | Some("help") | None => {
            println!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        _ => {}
    }

    let args = match parse_args(argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {e:#}");
            eprintln!("{USAGE}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn run(args: &Args) -> Result<ExitCode> {
    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };
    let verbosity = args.verbosity.unwrap_or(config.check.verbosity);
    init_logging(verbosity);

    match args.command.as_str() {
        "info" => {
            let table = open_table(&args.image, args.offset, false, &config)?;
            print_info(table.geometry(), args.json)?;
            Ok(ExitCode::SUCCESS)
        }
        "free" => {
            let table = open_table(&args.image, args.offset, false, &config)?;
            print_free(&table, args.json)?;
            Ok(ExitCode::SUCCESS)
        }
        "check" => {
            let table = open_table(&args.image, args.offset, args.repair, &config)?;
            let level = if args.repair {
                CheckLevel::ReportAndRepair
            } else {
                CheckLevel::ReportOnly
            };
            let mut options = CheckOptions::new(level, &config.check);
            options.verbosity = verbosity;

            let mut tree = FatDirectoryTree::new(&table);
            let report = run_check(&table, &mut tree, &options)
                .with_context(|| format!("check of {} failed", args.image.display()))?;
            table.unmount().context("failed to flush the volume")?;

            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for finding in &report.findings {
                    println!("{finding}");
                }
                for line in report.summary_lines() {
                    println!("{line}");
                }
            }
            Ok(if report.is_clean() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_FINDINGS)
            })
        }
        other => bail!("unknown command '{other}'"),
    }
}

fn open_table(path: &Path, offset: u64, writable: bool, config: &Config) -> Result<ClusterTable> {
    let device = ImageDevice::open(path, offset, writable)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let geometry = VolumeGeometry::read_from(&device)
        .with_context(|| format!("{} does not hold a FAT volume", path.display()))?;
    let device = device.with_sector_size(geometry.bytes_per_sector as usize);
    ClusterTable::with_geometry(Arc::new(device), geometry, &config.engine)
        .with_context(|| format!("failed to mount {}", path.display()))
}

fn print_info(geometry: &VolumeGeometry, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(geometry)?);
        return Ok(());
    }
    println!("Type:              {}", geometry.fat_type.name());
    if let Some(label) = &geometry.label {
        println!("Label:             {label}");
    }
    println!("Size:              {}", format_size(geometry.total_size()));
    println!("Bytes per sector:  {}", geometry.bytes_per_sector);
    println!("Cluster size:      {}", format_size(geometry.cluster_size()));
    println!("Clusters:          {}", geometry.total_clusters);
    println!("Table copies:      {}", geometry.num_fats);
    println!("Sectors per table: {}", geometry.sectors_per_fat);
    match geometry.active_fat {
        Some(copy) => println!("Active copy:       {copy} (mirroring off)"),
        None => println!("Active copy:       0 (mirrored)"),
    }
    if geometry.root_cluster != 0 && geometry.root_entry_count == 0 {
        println!("Root cluster:      {}", geometry.root_cluster);
    } else {
        println!("Root entries:      {}", geometry.root_entry_count);
    }
    Ok(())
}

fn print_free(table: &ClusterTable, json: bool) -> Result<()> {
    let free = table.free_space()?;
    let run = table.max_contiguous_run()?;
    let cluster_size = table.geometry().cluster_size();
    if json {
        let value = serde_json::json!({
            "free_clusters": free,
            "free_bytes": free as u64 * cluster_size,
            "max_contiguous_run": run,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!(
        "Free: {free} of {} clusters ({})",
        table.n_entries(),
        format_size(free as u64 * cluster_size)
    );
    match run {
        Some(run) => println!(
            "Longest free run: {} clusters at {} ({})",
            run.len,
            run.first,
            format_size(run.len as u64 * cluster_size)
        ),
        None => println!("Longest free run: none"),
    }
    Ok(())
}
