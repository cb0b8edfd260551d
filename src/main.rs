use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facecrop::core::config::PipelineConfig;
use facecrop::core::detector::FaceDetector;
use facecrop::core::hash::HashService;
use facecrop::core::report::BatchReport;
use facecrop::core::scanner::{ScanProgress, ScannerService};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "facecrop", version, about = "Crop every detected face out of a directory of images")]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Detect faces and store one crop per face
    Crop {
        /// Directory of source images
        #[arg(short, long, value_name = "DIR")]
        source: PathBuf,
        /// Directory the crops are written to
        #[arg(short, long, value_name = "DIR")]
        dest: PathBuf,
        /// Face detection model
        #[arg(long, value_name = "FILE", default_value = "seeta_fd_frontal_v1.0.bin")]
        model: PathBuf,
        /// JSON pipeline configuration
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Minimum detection score (exclusive)
        #[arg(long)]
        min_score: Option<f32>,
        /// Worker threads (default: one per CPU)
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,
        /// Create the destination directory if it is missing
        #[arg(long)]
        create_dest: bool,
        /// Write result records here instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
        /// Also write the full batch report as JSON
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
        /// Hide the progress bar
        #[arg(short, long)]
        quiet: bool,
    },

    /// Print the content key of already encoded image files
    Digest {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Crop {
            source,
            dest,
            model,
            config,
            min_score,
            jobs,
            recursive,
            create_dest,
            output,
            report,
            quiet,
        } => {
            let mut pipeline_config = match &config {
                Some(path) => PipelineConfig::from_file(path)?,
                None => PipelineConfig::default(),
            };
            if let Some(min_score) = min_score {
                pipeline_config.min_score = min_score;
            }
            if jobs.is_some() {
                pipeline_config.jobs = jobs;
            }
            pipeline_config.recursive |= recursive;
            pipeline_config.create_destination |= create_dest;
            pipeline_config.validate()?;

            eprintln!("▶ Cropping faces from {} into {}", source.display(), dest.display());
            let detector = load_detector(&model)?;
            let mut scanner = ScannerService::new(detector, &dest, pipeline_config);

            let progress = if quiet {
                None
            } else {
                let bar = ProgressBar::new(0);
                bar.set_style(
                    ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                        .progress_chars("=> "),
                );
                let callback_bar = bar.clone();
                scanner = scanner.with_progress_callback(Box::new(move |progress: ScanProgress| {
                    callback_bar.set_length(progress.total_files as u64);
                    callback_bar.set_position(progress.files_processed as u64);
                    callback_bar.set_message(progress.current_file);
                }));
                Some(bar)
            };

            let batch = benchmark("processing batch", || scanner.run(&source));
            if let Some(bar) = progress {
                bar.finish_and_clear();
            }
            let batch = batch.with_context(|| format!("Failed to process {}", source.display()))?;

            write_results(&batch, output.as_deref())?;
            if let Some(report_path) = report {
                fs::write(&report_path, serde_json::to_string_pretty(&batch)?)
                    .with_context(|| format!("Failed to write report {:?}", report_path))?;
                eprintln!("✅ Wrote batch report to {}", report_path.display());
            }

            print_summary(&batch);
            if let Some(aborted) = &batch.aborted {
                anyhow::bail!("Batch aborted: {}", aborted);
            }
        }

        Commands::Digest { files } => {
            let hash_service = HashService::new();
            for path in &files {
                let key = hash_service
                    .digest_file(path)
                    .with_context(|| format!("Failed to read {:?}", path))?;
                println!("{}  {}", key, path.display());
            }
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout carries only result records.
fn init_logging(verbose: bool) {
    let default_directive = if verbose { "facecrop=debug" } else { "facecrop=info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(io::stderr).with_target(false))
            .with(env_filter)
            .init();
    }
}

#[cfg(feature = "rustface")]
fn load_detector(model: &Path) -> Result<Arc<dyn FaceDetector>> {
    let detector = facecrop::core::rustface_backend::RustfaceDetector::from_path(model)?;
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "rustface"))]
fn load_detector(model: &Path) -> Result<Arc<dyn FaceDetector>> {
    anyhow::bail!(
        "cannot load {}: built without a face detector backend (enable the `rustface` feature)",
        model.display()
    )
}

/// One JSON line per stored crop.
fn write_results(batch: &BatchReport, output: Option<&Path>) -> Result<()> {
    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {:?}", path))?,
        )),
        None => Box::new(io::stdout().lock()),
    };

    for result in &batch.results {
        writeln!(out, "{}", serde_json::to_string(result)?)?;
    }
    out.flush()?;
    Ok(())
}

fn print_summary(batch: &BatchReport) {
    let summary = &batch.summary;

    for failure in &batch.failures {
        eprintln!("⚠️  {}", failure);
    }
    for skipped in &batch.skipped {
        eprintln!("   ⏭  {} skipped, filetype not supported", skipped.display());
    }

    eprintln!(
        "\n✅ {} of {} image(s) processed, {} failed, {} skipped, {} cancelled",
        summary.images_processed,
        summary.images_total,
        summary.images_failed,
        summary.images_skipped,
        summary.images_cancelled
    );
    eprintln!(
        "   {} face(s) found, {} crop(s) written, {} already stored, {} face(s) not cropped",
        summary.faces_found, summary.crops_written, summary.crops_deduplicated, summary.region_failures
    );
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    eprintln!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
