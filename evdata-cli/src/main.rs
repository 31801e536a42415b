//! Crate/slot event decoder CLI application.
//!
//! Decodes raw event files against a hardware map and writes the decoded
//! channel data as CSV.

use anyhow::{Context, Result};
use clap::Parser;
use evdata_core::parser::EventReader;
use evdata_core::{DecodeEngine, EngineConfig, SlotCsvWriter, TomlMapResolver};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Raw event file decoder for crate/slot tagged DAQ data.
///
/// Each event is routed through the hardware map valid at the run
/// timestamp. For every slot that received a segment in an event, each of
/// its data words is written as one CSV row. Slots configured with
/// `clear = false` keep earlier data, which is repeated in the rows of the
/// next event that hits them.
#[derive(Parser, Debug)]
#[command(name = "evdata")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input raw event file (little-endian 32-bit words, length-prefixed events)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output CSV file path
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Engine configuration file (TOML)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Hardware map name; overrides the config file
    #[arg(short, long)]
    map: Option<String>,

    /// Directory holding <map>.toml files
    #[arg(short = 'd', long, value_name = "DIR")]
    map_dir: Option<PathBuf>,

    /// Run timestamp used to select the map period
    #[arg(short = 't', long)]
    run_time: Option<u64>,

    /// Debug level
    #[arg(long)]
    debug: Option<u32>,

    /// Report stage timings when done
    #[arg(short, long)]
    bench: bool,

    /// Print a hex dump of the first event
    #[arg(long)]
    dump_first: bool,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    // File config first, command line on top
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => EngineConfig::default(),
    };
    if let Some(map) = &args.map {
        config.map_name = map.clone();
    }
    if let Some(dir) = &args.map_dir {
        config.map_dir = Some(dir.clone());
    }
    if let Some(t) = args.run_time {
        config.run_time = Some(t);
    }
    if let Some(level) = args.debug {
        config.debug_level = level;
    }
    config.benchmark |= args.bench;

    let map_dir = config.map_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    let mut engine = DecodeEngine::with_standard_modules(TomlMapResolver::new(&map_dir))
        .context("Failed to create decoder")?;
    engine.apply_config(&config);
    engine
        .init()
        .with_context(|| format!("Failed to initialize hardware map from {:?}", map_dir))?;

    info!(
        map = %engine.map_name(),
        run_time = engine.run_time(),
        active = engine.active_indices().len(),
        "decoder ready"
    );

    // Setup progress bar
    let progress = if args.quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap(),
        );
        pb.set_message("Decoding...");
        pb
    };

    let start_time = Instant::now();

    let file = File::open(&args.input)
        .with_context(|| format!("Failed to open input {:?}", args.input))?;
    let mut reader = EventReader::new(BufReader::new(file));
    let mut writer = SlotCsvWriter::create(&args.output)
        .with_context(|| format!("Failed to create output {:?}", args.output))?;
    writer.write_header().context("Failed to write CSV header")?;

    let mut event = Vec::new();
    let mut n_events: u64 = 0;
    while reader
        .read_event(&mut event)
        .with_context(|| format!("Failed to read event {}", n_events))?
    {
        if n_events == 0 && args.dump_first {
            eprint!("{}", engine.dump_buffer(&event));
        }

        let summary = engine
            .decode_event(&event)
            .with_context(|| format!("Failed to decode event {}", n_events))?;
        if !summary.is_complete() {
            warn!(
                event = n_events,
                discarded = summary.segments_discarded,
                "event partially decoded"
            );
        }
        writer
            .write_event(n_events, engine.decoded_records())
            .context("Failed to write CSV output")?;

        n_events += 1;
        if n_events % 10_000 == 0 {
            progress.set_message(format!("Decoded {} events", n_events));
            progress.tick();
        }
    }
    writer.flush().context("Failed to flush CSV output")?;

    let total_duration = start_time.elapsed();
    progress.finish_with_message(format!(
        "Done! Decoded {} events in {:.2}s",
        n_events,
        total_duration.as_secs_f64()
    ));

    if !args.quiet {
        let stats = engine.stats();
        let events_per_sec = n_events as f64 / total_duration.as_secs_f64();
        eprintln!();
        eprintln!("Summary:");
        eprintln!("  Input:        {:?}", args.input);
        eprintln!("  Output:       {:?}", args.output);
        eprintln!("  Map:          {}", engine.map_name());
        eprintln!("  Active slots: {}", engine.active_indices().len());
        eprintln!("  Events:       {}", stats.events);
        eprintln!("  Partial:      {}", stats.partial_events);
        eprintln!(
            "  Segments:     {} decoded, {} skipped, {} discarded",
            stats.segments_decoded, stats.segments_skipped, stats.segments_discarded
        );
        eprintln!("  Rows:         {}", writer.rows());
        eprintln!("  Duration:     {:.3}s", total_duration.as_secs_f64());
        eprintln!("  Throughput:   {:.0} events/s", events_per_sec);
    }

    // Dropping the engine reports benchmark timings, if enabled
    drop(engine);
    Ok(())
}
