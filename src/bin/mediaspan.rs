//! # mediaspan CLI
//!
//! Command-line front end for planning, writing and verifying an archive set
//! spread across removable media.
//!
//! ## Usage
//! ```bash
//! # Create an index for 25 GB Blu-ray discs
//! mediaspan --index /var/lib/mediaspan init --media disc --capacity 25025314816 \
//!     --block-size 2048 --source /srv/photos
//!
//! # See what the next run would do
//! mediaspan --index /var/lib/mediaspan plan --progress
//!
//! # Write unit 3 to a mounted disc image, then check it
//! mediaspan --index /var/lib/mediaspan write --unit 3 --mount /mnt/disc
//! mediaspan --index /var/lib/mediaspan verify --unit 3 --mount /mnt/disc
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use mediaspan::utils::format_bytes;
use mediaspan::{
    ArchiveConfig, Archiver, MediaKind, ProgressCallback, ProgressInfo, Result,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// mediaspan - spread a growing file collection across removable media
#[derive(Parser)]
#[command(name = "mediaspan")]
#[command(version)]
#[command(about = "Allocate, write and verify backups across discs, cold-storage drives and tapes")]
#[command(long_about = None)]
struct Cli {
    /// Index directory
    #[arg(short, long, global = true, default_value = ".mediaspan")]
    index: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new archive set index
    Init {
        /// Kind of media
        #[arg(long, value_enum)]
        media: MediaArg,

        /// Capacity of each unit in bytes
        #[arg(long)]
        capacity: u64,

        /// Allocation block size in bytes (tape always uses 512)
        #[arg(long, default_value_t = 4096)]
        block_size: u64,

        /// Source directory to archive (repeatable)
        #[arg(short, long = "source", required = true)]
        sources: Vec<PathBuf>,

        /// Excluded path prefix (repeatable)
        #[arg(long = "exclude-path")]
        exclude_paths: Vec<String>,

        /// Excluded filename suffix (repeatable)
        #[arg(long = "exclude-file")]
        exclude_files: Vec<String>,

        /// Headroom kept free on every unit, in bytes
        #[arg(long)]
        reserved: Option<u64>,

        /// Tar blocking factor for tape sets
        #[arg(long)]
        blocking_factor: Option<u32>,
    },

    /// Scan, size and allocate without writing anything
    Plan {
        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Plan, then copy one unit's files to mounted media
    Write {
        /// Unit number
        #[arg(short, long)]
        unit: u32,

        /// Mount point of the media
        #[arg(short, long)]
        mount: PathBuf,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Re-hash a written unit on mounted media
    Verify {
        /// Unit number
        #[arg(short, long)]
        unit: u32,

        /// Mount point of the media
        #[arg(short, long)]
        mount: PathBuf,

        /// Show progress
        #[arg(long)]
        progress: bool,
    },

    /// Show archive set statistics
    Summary {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Find which units hold files whose path contains a term
    Search {
        /// Text to look for, case-insensitive
        term: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Find archived files that moved in the source tree
    Renames {
        /// Re-point the archived records at their new paths
        #[arg(long)]
        apply: bool,
    },

    /// Mark a disc as burned
    Finalize {
        /// Unit number
        #[arg(short, long)]
        unit: u32,
    },

    /// Record bytes physically written to a tape
    MediaUsage {
        /// Unit number
        #[arg(short, long)]
        unit: u32,

        /// Bytes on media as reported by the drive
        #[arg(short, long)]
        bytes: u64,
    },

    /// Show index status
    Status,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum MediaArg {
    Disc,
    Csd,
    Tape,
}

impl From<MediaArg> for MediaKind {
    fn from(arg: MediaArg) -> Self {
        match arg {
            MediaArg::Disc => MediaKind::Disc,
            MediaArg::Csd => MediaKind::Csd,
            MediaArg::Tape => MediaKind::Tape,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let index = cli.index;

    match cli.command {
        Commands::Init {
            media,
            capacity,
            block_size,
            sources,
            exclude_paths,
            exclude_files,
            reserved,
            blocking_factor,
        } => {
            let mut config = ArchiveConfig::for_media(media.into(), capacity, block_size);
            config.source_paths = sources;
            config.exclude_paths = exclude_paths;
            config.exclude_files = exclude_files;
            if let Some(reserved) = reserved {
                config.reserved_capacity_bytes = reserved;
            }
            if let Some(factor) = blocking_factor {
                config.tape_blocking_factor = factor;
            }
            cmd_init(index, config)
        }
        Commands::Plan { progress } => cmd_plan(index, progress),
        Commands::Write { unit, mount, progress } => cmd_write(index, unit, mount, progress),
        Commands::Verify { unit, mount, progress } => cmd_verify(index, unit, mount, progress),
        Commands::Summary { json } => cmd_summary(index, json),
        Commands::Search { term, json } => cmd_search(index, &term, json),
        Commands::Renames { apply } => cmd_renames(index, apply),
        Commands::Finalize { unit } => cmd_finalize(index, unit),
        Commands::MediaUsage { unit, bytes } => cmd_media_usage(index, unit, bytes),
        Commands::Status => cmd_status(index),
    }
}

/// Progress bar fed by the library's progress callback
///
/// Returns the bar so the caller can clear it when the command finishes.
fn progress_bar(archiver: &mut Archiver, enabled: bool) -> Option<ProgressBar> {
    if !enabled {
        return None;
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let sink = pb.clone();
    let callback: ProgressCallback = Arc::new(move |info: ProgressInfo| {
        let position = match info.total {
            Some(total) => format!("{}/{}", info.processed, total),
            None => info.processed.to_string(),
        };
        sink.set_message(format!(
            "{} {} files, {} ({:.0} files/s)",
            info.stage,
            position,
            format_bytes(info.bytes_processed),
            info.files_per_second
        ));
    });
    archiver.set_progress_callback(Some(callback));
    Some(pb)
}

fn cmd_init(index: PathBuf, config: ArchiveConfig) -> Result<()> {
    println!("{}", "Initializing archive set...".blue().bold());

    let media = config.media;
    let capacity = config.unit_capacity;
    let sources = config.source_paths.clone();
    let archiver = Archiver::init(index, config)?;

    println!("{} Initialized {} archive set", "✓".green().bold(), media.to_string().cyan());
    println!("  Index: {}", archiver.root().display().to_string().cyan());
    println!("  Unit capacity: {}", format_bytes(capacity).cyan());
    for source in sources {
        println!("  Source: {}", source.display().to_string().cyan());
    }
    println!("\nNext steps:");
    println!("  - Preview the allocation: {}", "mediaspan plan --progress".yellow());
    println!("  - Write the first unit: {}", "mediaspan write --unit 1 --mount <DIR>".yellow());

    Ok(())
}

fn cmd_plan(index: PathBuf, show_progress: bool) -> Result<()> {
    let mut archiver = Archiver::open(index)?;
    let progress = progress_bar(&mut archiver, show_progress);

    println!("{}", "Planning...".blue().bold());
    let mut plan = archiver.plan()?;

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    let stats = plan.stats();
    if stats.cancelled {
        println!("{}", "Plan stopped early; results are partial".yellow());
    }

    println!("\n{}", "Scan:".bold());
    println!("  New files: {}", stats.new_file_count.to_string().green());
    println!("  Already archived: {}", stats.existing_file_count);
    println!("  Excluded: {}", stats.excluded_file_count);
    if stats.deleted_file_count > 0 {
        println!("  Deleted at source: {}", stats.deleted_file_count.to_string().yellow());
    }
    if stats.error_file_count > 0 {
        println!("  Unreadable: {}", stats.error_file_count.to_string().red());
    }
    println!("  Pending size: {}", format_bytes(stats.total_size_pending).cyan());

    if let Some(err) = plan.allocation_error.take() {
        println!("\n{}", "Allocation:".bold());
        println!("  {} No files assigned; {} remain staged", "✗".red().bold(), plan.session.new_files().len());
        return Err(err);
    }

    println!("\n{}", "Allocation:".bold());
    println!("  Files assigned: {}", plan.allocation.assigned_files.to_string().green());
    println!("  Bytes assigned: {}", format_bytes(plan.allocation.assigned_bytes).cyan());
    if !plan.allocation.new_units.is_empty() {
        let numbers: Vec<String> = plan.allocation.new_units.iter().map(|n| n.to_string()).collect();
        println!("  New units: {}", numbers.join(", ").yellow());
    }
    if !plan.free_space.is_sufficient() {
        println!(
            "  {} existing units have {} free; about {} more unit(s) needed",
            "⚠".yellow().bold(),
            format_bytes(plan.free_space.usable_free_space),
            plan.free_space.additional_units
        );
    }

    println!();
    for line in plan.summary().render() {
        println!("{}", line);
    }
    println!(
        "\n{}",
        format!("Total time: {}", format_duration(Duration::from_millis(plan.elapsed_ms))).dimmed()
    );

    Ok(())
}

fn cmd_write(index: PathBuf, unit: u32, mount: PathBuf, show_progress: bool) -> Result<()> {
    let mut archiver = Archiver::open(index)?;
    let progress = progress_bar(&mut archiver, show_progress);
    let start = Instant::now();

    println!("{} {} to {}", "Writing unit".blue().bold(), unit.to_string().yellow(), mount.display());
    let report = archiver.write_unit(unit, &mount)?;

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    println!("{} Wrote {} files", "✓".green().bold(), report.files_written.to_string().green());
    println!("  Bytes: {}", format_bytes(report.bytes_written).cyan());
    println!("  Time: {}", format_duration(start.elapsed()).to_string().cyan());
    if report.missing_sources > 0 {
        println!("  Missing sources: {}", report.missing_sources.to_string().yellow());
    }
    if report.files_remaining > 0 {
        println!("  Still pending: {}", report.files_remaining.to_string().yellow());
    }
    if report.cancelled {
        println!("{}", "Write cancelled".yellow());
    }
    if let Some(mismatch) = &report.capacity_mismatch {
        println!("\n{} {}", "⚠".yellow().bold(), mismatch.user_message().yellow());
    }

    Ok(())
}

fn cmd_verify(index: PathBuf, unit: u32, mount: PathBuf, show_progress: bool) -> Result<()> {
    let mut archiver = Archiver::open(index)?;
    let progress = progress_bar(&mut archiver, show_progress);

    println!("{} {}", "Verifying unit".blue().bold(), unit.to_string().yellow());
    let report = archiver.verify_unit(unit, &mount)?;

    if let Some(pb) = progress {
        pb.finish_and_clear();
    }

    println!("\n{}", "Verification Report:".bold());
    println!(
        "  Files: {}/{} valid",
        report.files_valid.to_string().green(),
        report.total_files_checked
    );
    println!("  Bytes: {}", format_bytes(report.bytes_verified));
    println!(
        "  Time: {}",
        format_duration(Duration::from_millis(report.verification_time_ms))
    );

    if report.is_valid() {
        println!("  Result: {}", "✓ Valid".green());
    } else {
        println!("  Result: {}", "✗ Invalid".red());
        for failure in report.failures.iter().take(10) {
            let reason = match (&failure.error, failure.exists) {
                (Some(e), _) => e.clone(),
                (None, false) => "missing".to_string(),
                (None, true) => "hash mismatch".to_string(),
            };
            println!("  - {} ({})", failure.relative_path, reason.red());
        }
        if report.failures.len() > 10 {
            println!("  ... and {} more", (report.failures.len() - 10).to_string().dimmed());
        }
    }

    Ok(())
}

fn cmd_summary(index: PathBuf, json: bool) -> Result<()> {
    let archiver = Archiver::open(index)?;
    let summary = archiver.summary()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary);
    }
    Ok(())
}

fn cmd_search(index: PathBuf, term: &str, json: bool) -> Result<()> {
    let archiver = Archiver::open(index)?;
    let hits = archiver.search(term)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }

    println!("{}", format!("Matching files: {}", hits.len()).bold());
    for hit in &hits {
        let line = format!("  [{}] {} ({})", hit.unit_name.yellow(), hit.relative_path, format_bytes(hit.size));
        if hit.deleted {
            println!("{} {}", line, "deleted at source".dimmed());
        } else {
            println!("{}", line);
        }
    }
    Ok(())
}

fn cmd_renames(index: PathBuf, apply: bool) -> Result<()> {
    let archiver = Archiver::open(index)?;

    let candidates = if apply {
        archiver.apply_renames()?
    } else {
        archiver.find_renames()?
    };

    if candidates.is_empty() {
        println!("{}", "No renames found".dimmed());
        return Ok(());
    }

    let heading = if apply { "Applied renames:" } else { "Rename candidates:" };
    println!("{}", heading.bold());
    for candidate in &candidates {
        println!(
            "  [{}] {} -> {}",
            candidate.unit.to_string().yellow(),
            candidate.archived_path,
            candidate.new_path.cyan()
        );
    }
    if !apply {
        println!("\n{}", "Run with --apply to update the index".dimmed());
    }
    Ok(())
}

fn cmd_finalize(index: PathBuf, unit: u32) -> Result<()> {
    let archiver = Archiver::open(index)?;
    archiver.finalize_unit(unit)?;
    println!("{} Unit {} finalized", "✓".green().bold(), unit);
    Ok(())
}

fn cmd_media_usage(index: PathBuf, unit: u32, bytes: u64) -> Result<()> {
    let archiver = Archiver::open(index)?;
    archiver.record_media_usage(unit, bytes)?;
    println!("{} Recorded {} on unit {}", "✓".green().bold(), format_bytes(bytes), unit);
    Ok(())
}

fn cmd_status(index: PathBuf) -> Result<()> {
    let archiver = Archiver::open(index)?;
    let status = archiver.status()?;

    println!("{}", "mediaspan Status:".blue().bold());
    println!();
    println!("  Index: {}", status.index_root.display());
    println!("  Media: {}", status.media.to_string().cyan());
    println!("  Created: {}", status.created_at.format("%Y-%m-%d %H:%M:%S"));
    for source in &status.source_paths {
        println!("  Source: {}", source.display());
    }

    println!("\n{}", "Units:".bold());
    println!("  Count: {}", status.unit_count);
    println!("  Files: {}", status.total_files);
    println!("  Data: {}", format_bytes(status.total_data_size));
    if status.deleted_files > 0 {
        println!("  Deleted at source: {}", status.deleted_files.to_string().yellow());
    }

    if !status.units_needing_verification.is_empty() {
        let numbers: Vec<String> = status.units_needing_verification.iter().map(|n| n.to_string()).collect();
        println!("  Needing verification: {}", numbers.join(", ").yellow());
    }
    if !status.capacity_suspect_units.is_empty() {
        let numbers: Vec<String> = status.capacity_suspect_units.iter().map(|n| n.to_string()).collect();
        println!("  Capacity suspect: {}", numbers.join(", ").red());
    }
    if let Some(days) = status.oldest_verification_days {
        println!(
            "  Oldest verification: {} ago",
            format_duration(Duration::from_secs(days.max(0) as u64 * 86_400))
        );
    }

    Ok(())
}
