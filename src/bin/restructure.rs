use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::error::ErrorKind;
use clap::Parser;
use log::{error, info};

use restructure::{Config, Registries, Restructurer, Result};

#[derive(Parser)]
#[command(
    name = "restructure",
    version,
    about = "Restructures stream container files into a per-project, per-user, time-binned tree"
)]
struct Cli {
    /// Source paths to scan for topic directories
    #[arg(value_name = "INPUT", required = true)]
    inputs: Vec<PathBuf>,

    /// Nameservice identifier for an HDFS source
    #[arg(short = 'n', long, value_name = "ID")]
    nameservice: Option<String>,

    /// Root of the output tree
    #[arg(short = 'o', long, value_name = "PATH")]
    output_directory: Option<PathBuf>,

    /// Row format
    #[arg(short = 'f', long, default_value = "csv", value_name = "FORMAT")]
    format: String,

    /// Compression of output files
    #[arg(short = 'c', long, default_value = "none", value_name = "KIND")]
    compression: String,

    /// Deduplicate rows of published files
    #[arg(short = 'd', long)]
    deduplicate: bool,

    /// Worker threads
    #[arg(short = 't', long, default_value_t = 1, value_name = "N")]
    num_threads: u32,

    /// Open output writers per worker
    #[arg(short = 's', long, default_value_t = 100, value_name = "N")]
    cache_size: usize,

    /// Files to take per topic per run; 0 is unbounded
    #[arg(long, default_value_t = 0, value_name = "N")]
    max_files_per_topic: usize,

    /// Topic to skip; may be repeated
    #[arg(long = "exclude-topic", value_name = "NAME")]
    exclude_topic: Vec<String>,

    /// Keep running at a fixed interval
    #[arg(short = 'S', long)]
    service: bool,

    /// Seconds between service-mode passes
    #[arg(short = 'i', long, default_value_t = 3600, value_name = "SECONDS")]
    interval: u64,

    /// Root for scratch directories
    #[arg(long, value_name = "PATH")]
    tmp_dir: Option<PathBuf>,

    /// Directory for cross-process topic locks
    #[arg(long, value_name = "PATH")]
    lock_directory: Option<PathBuf>,

    /// Collect and report per-category timings
    #[arg(long)]
    timer: bool,

    /// YAML configuration file; its values override the flags above
    #[arg(short = 'F', long, value_name = "YAML")]
    config_file: Option<PathBuf>,
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{e}");
            exit(0);
        }
        Err(e) => {
            eprint!("{e}");
            exit(1);
        }
    };
    if let Err(e) = run(cli) {
        error!("{e}");
        exit(1);
    }
}

fn build_config(cli: &Cli) -> Result<Config> {
    let mut config = Config {
        inputs: cli.inputs.clone(),
        output: cli.output_directory.clone().unwrap_or_default(),
        format: cli.format.clone(),
        compression: cli.compression.clone(),
        deduplicate: cli.deduplicate,
        num_threads: cli.num_threads,
        cache_size: cli.cache_size,
        max_files_per_topic: (cli.max_files_per_topic > 0).then_some(cli.max_files_per_topic),
        excluded_topics: cli.exclude_topic.iter().cloned().collect(),
        service: cli.service,
        interval_secs: cli.interval,
        tmp_dir: cli.tmp_dir.clone(),
        lock_directory: cli.lock_directory.clone(),
        timer: cli.timer,
        ..Config::default()
    };
    if let Some(nameservice) = &cli.nameservice {
        config
            .source_properties
            .insert("nameservice".into(), nameservice.clone());
    }
    if let Some(path) = &cli.config_file {
        config.apply_overlay(Config::load_overlay(path)?)?;
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    let config = build_config(&cli)?;
    let service = config.service;
    let interval = Duration::from_secs(config.interval_secs.max(1));

    info!("restructure {}", env!("CARGO_PKG_VERSION"));
    info!(
        "{} input(s) -> {}, format {}, compression {}",
        config.inputs.len(),
        config.output.display(),
        config.format,
        config.compression
    );

    let engine = Arc::new(Restructurer::new(config, &Registries::default())?);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        let engine = engine.clone();
        ctrlc::set_handler(move || {
            info!("interrupt received, draining current workers");
            interrupted.store(true, Ordering::Relaxed);
            engine.shutdown();
        })
        .map_err(|e| restructure::RestructureError::StringError(e.to_string()))?;
    }

    loop {
        let started = Instant::now();
        let summary = engine.process()?;
        info!(
            "pass complete: {} topics, {} files, {} records, {} failed topics in {:.1?}",
            summary.topics,
            summary.files,
            summary.records,
            summary.failed_topics,
            started.elapsed()
        );

        if !service || interrupted.load(Ordering::Relaxed) {
            return Ok(());
        }
        // Sleep in short slices so an interrupt ends the wait promptly.
        let wake = Instant::now() + interval;
        while Instant::now() < wake {
            if interrupted.load(Ordering::Relaxed) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    }
}
