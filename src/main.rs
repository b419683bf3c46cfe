use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voxel_phantom::config::load_config;
use voxel_phantom::export::{dump_path_for, read_records, write_text_dump};
use voxel_phantom::source::PrimaryVertex;
use voxel_phantom::{PhantomContext, PhantomResult, Worker};

/// Voxel phantom setup, source sampling and tally conversion
#[derive(Parser, Debug)]
#[command(name = "voxel-phantom", version, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, default_value = "voxel_phantom.toml")]
    config: PathBuf,

    /// Log filter when RUST_LOG is unset; overrides run.log_level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the phantom, source map and scoring setup and print a JSON summary
    Inspect,

    /// Draw primary vertices from the source map, one JSON object per line
    Sample {
        /// Number of primaries
        #[arg(short = 'n', long, default_value_t = 10)]
        count: u64,

        /// Worker threads (default: run.workers)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Convert an exported dataset (.json or .bin) to tab-separated text
    Dump {
        input: PathBuf,

        /// Output file (default: input with .dat extension; "-" for stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn open_output(path: Option<&PathBuf>) -> Result<Box<dyn Write>> {
    match path {
        Some(path) if path.as_os_str() != "-" => {
            let file = File::create(path)
                .with_context(|| format!("cannot create {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        _ => Ok(Box::new(BufWriter::new(io::stdout().lock()))),
    }
}

/// Events of worker `index` when `count` events are split over `workers`.
fn share(count: u64, workers: usize, index: usize) -> u64 {
    let workers = workers as u64;
    let index = index as u64;
    count / workers + u64::from(index < count % workers)
}

fn sample(context: &PhantomContext, count: u64, workers: usize, seed: u64) -> Result<Vec<PrimaryVertex>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("cannot start worker threads")?;

    let per_worker: Vec<Vec<PrimaryVertex>> = pool.install(|| {
        (0..workers)
            .into_par_iter()
            .map(|index| -> PhantomResult<Vec<PrimaryVertex>> {
                let first_event: u64 = (0..index).map(|i| share(count, workers, i)).sum();
                let events = share(count, workers, index);
                let mut worker = Worker::new(index, context, seed);
                let mut vertices = Vec::with_capacity(events as usize);
                for event in first_event..first_event + events {
                    worker.begin_event(event);
                    vertices.push(worker.generate_primary()?);
                    worker.end_of_event();
                }
                Ok(vertices)
            })
            .collect::<PhantomResult<Vec<_>>>()
    })?;

    Ok(per_worker.into_iter().flatten().collect())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Dump { input, output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            let records = read_records(input)?;
            let target = output.clone().unwrap_or_else(|| dump_path_for(input));
            let mut writer = open_output(Some(&target))?;
            write_text_dump(&records, &mut writer)?;
            writer.flush()?;
            info!(input = %input.display(), output = %target.display(), records = records.len(), "dataset dumped");
        }
        Command::Inspect => {
            let config = load_config(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.run.log_level));
            let context = PhantomContext::build(&config)?;
            let mut out = io::stdout().lock();
            serde_json::to_writer_pretty(&mut out, &context.summary())?;
            writeln!(out)?;
        }
        Command::Sample {
            count,
            workers,
            output,
        } => {
            let config = load_config(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            init_logging(cli.log_level.as_deref().unwrap_or(&config.run.log_level));
            let workers = workers.unwrap_or(config.run.workers).max(1);
            let context = PhantomContext::build(&config)?;

            let vertices = sample(&context, *count, workers, config.run.seed)?;
            let mut writer = open_output(output.as_ref())?;
            for vertex in &vertices {
                serde_json::to_writer(&mut writer, vertex)?;
                writeln!(writer)?;
            }
            writer.flush()?;
            info!(primaries = vertices.len(), workers, "sampling finished");
        }
    }
    Ok(())
}
