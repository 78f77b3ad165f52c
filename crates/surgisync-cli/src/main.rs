mod logging;

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use surgisync_core::{SyncConfig, SyncEngine, DEFAULT_CONFIG_FILENAME};

#[derive(Parser)]
#[command(
    name = "surgisync",
    version,
    about = "Anonymize surgical videos, trim case sheets and upload them without reprocessing"
)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILENAME)]
    config: PathBuf,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Process new videos and upload them (default)
    Sync,
    /// Remove records and anonymized copies whose source is gone
    CleanupOrphans,
    /// Show what a sync would do without changing anything
    DryRun,
    /// Upload anonymized copies that have not been uploaded yet
    UploadOnly,
    /// List uploaded objects under the configured prefix
    ListRemote,
    /// Find the source file behind an anonymous name
    Lookup {
        /// e.g. video_0123456789abcdef.mp4
        name: String,
    },
    /// Check that the source directory is reachable
    CheckSource,
}

fn progress_bar(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    if let Ok(style) =
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:30} {pos}/{len} {msg}")
    {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(250));
    pb
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce()) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text();
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let t_total = Instant::now();

    let config = SyncConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    let _log = logging::init(&config.logging);
    let mut engine = SyncEngine::new(config)?;

    let command = cli.command.unwrap_or(Command::Sync);
    let pb = progress_bar(cli.json || !matches!(command, Command::Sync | Command::UploadOnly));
    let on_progress = |_stage: &str, current: u64, total: u64, message: &str| {
        pb.set_length(total);
        pb.set_position(current + 1);
        pb.set_message(message.to_string());
    };

    match command {
        Command::Sync => {
            let stats = engine.run_sync(&on_progress)?;
            pb.finish_and_clear();
            emit(cli.json, &stats, || {
                eprintln!(
                    "Done! {} processed, {} skipped, {} errors, {} uploaded, {} upload failures ({:.2}s)",
                    stats.processed,
                    stats.skipped,
                    stats.errored,
                    stats.uploaded,
                    stats.upload_failed,
                    t_total.elapsed().as_secs_f64()
                )
            })?;
        }
        Command::CleanupOrphans => {
            let stats = engine.cleanup_orphans()?;
            emit(cli.json, &stats, || {
                if stats.source_unreachable {
                    eprintln!("Source directory unreachable, nothing removed");
                } else {
                    eprintln!(
                        "Removed {} records and {} files, {} kept after delete errors",
                        stats.entries_removed, stats.files_removed, stats.errors
                    );
                }
            })?;
            if stats.source_unreachable {
                anyhow::bail!("Orphan cleanup refused: source directory unreachable");
            }
        }
        Command::DryRun => {
            let report = engine.dry_run();
            emit(cli.json, &report, || {
                for planned in &report.planned {
                    let note = if planned.destination_exists {
                        " (destination exists, would adopt)"
                    } else {
                        ""
                    };
                    println!("{} -> {}{}", planned.source, planned.destination.display(), note);
                }
                eprintln!(
                    "{} new, {} already processed, {} pending uploads, upload {}",
                    report.planned.len(),
                    report.skipped,
                    report.pending_uploads,
                    report.upload
                );
                if !report.source_reachable {
                    eprintln!("Source directory is not reachable");
                }
            })?;
        }
        Command::UploadOnly => {
            let stats = engine.upload_only(&on_progress)?;
            pb.finish_and_clear();
            emit(cli.json, &stats, || {
                eprintln!(
                    "Uploaded {}, failed {}, skipped {}",
                    stats.uploaded, stats.failed, stats.skipped
                )
            })?;
        }
        Command::ListRemote => {
            let keys = engine.list_remote()?;
            emit(cli.json, &keys, || {
                for key in &keys {
                    println!("{}", key);
                }
                eprintln!("{} objects", keys.len());
            })?;
        }
        Command::Lookup { name } => {
            let matches = engine.lookup(&name);
            emit(cli.json, &matches, || {
                if matches.is_empty() {
                    eprintln!("No record for {}", name);
                }
                for m in &matches {
                    println!(
                        "{} (processed {}, {:?})",
                        m.source, m.record.processed_at, m.record.anonymization_method
                    );
                }
            })?;
        }
        Command::CheckSource => {
            let probe = engine.probe_source();
            emit(cli.json, &probe, || {
                eprintln!(
                    "{} ({}): {}, {} matching files",
                    probe.path,
                    if probe.network { "network" } else { "local" },
                    if probe.reachable { "reachable" } else { "NOT reachable" },
                    probe.matching_files
                )
            })?;
            if !probe.reachable {
                anyhow::bail!("Source directory {} is not reachable", probe.path);
            }
        }
    }

    Ok(())
}
