//! Main entry point for the zipstream CLI application.
//!
//! Scans the given paths, streams them into a ZIP archive on disk and
//! optionally lists or tests the result.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use zipstream::{
    ArchiveOptions, ArchiveSession, Cli, FileSinkFactory, LocalEntry, LocalFileReader, ReadAt,
    Transform, ZipExtractor,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = ArchiveOptions::default()
        .include_directories(cli.directories)
        .speed_interval(Duration::from_secs(cli.speed_interval.max(1)));
    let mut session = ArchiveSession::new(FileSinkFactory::new(&cli.output_dir), options);

    // Ctrl-C stops between chunks and leaves a closed, partial file behind
    let cancel = session.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    if !cli.is_quiet() {
        session.register_current_file(|name| eprintln!("  adding: {name}"));
        session.register_average_speed(|speed| {
            eprintln!(
                "  {} written, {}/s",
                format_size(speed.bytes),
                format_size(speed.bytes_per_second() as u64)
            )
        });
    }

    let roots = cli
        .paths
        .iter()
        .map(|path| LocalEntry::new(path))
        .collect::<Result<Vec<_>>>()?;

    let scan = session.scan(roots).await?;
    if !cli.is_very_quiet() {
        for skipped in &scan.skipped {
            eprintln!("warning: {skipped}");
        }
    }

    let report = match cli.transform.as_deref() {
        Some(script_id) => {
            session
                .compress_with_transform(&cli.file, cli.level, script_id)
                .await?
        }
        None => session.compress(&cli.file, cli.level).await?,
    };

    if !cli.is_quiet() {
        eprintln!(
            "{}: {} entries, {} read, {} written in {:.2}s",
            report.archive_name,
            report.entries,
            format_size(report.bytes_read),
            format_size(report.bytes_written),
            report.elapsed.as_secs_f64()
        );
    }

    if cli.list || cli.verbose || cli.test {
        let path = cli.output_dir.join(&report.archive_name);
        let reader = Arc::new(
            LocalFileReader::new(&path).with_context(|| format!("failed to reopen {}", path.display()))?,
        );
        let extractor = ZipExtractor::new(reader);

        if cli.list || cli.verbose {
            list_files(&extractor, cli.verbose).await?;
        }
        if cli.test {
            let transform = session.transforms().resolve(cli.transform.as_deref())?;
            test_files(&extractor, &transform, cli.is_quiet()).await?;
        }
    }

    Ok(())
}

/// List files in the ZIP archive.
///
/// Supports two output formats:
/// - Simple format (`-l`): Just file names, one per line
/// - Verbose format (`-v`): Detailed table with size, compression ratio, and timestamps
async fn list_files<R: ReadAt + 'static>(extractor: &ZipExtractor<R>, verbose: bool) -> Result<()> {
    let entries = extractor.list_files().await?;

    if verbose {
        println!(
            "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
            "Length", "Size", "Cmpr", "Date", "Time"
        );
        println!("{}", "-".repeat(70));
    }

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in &entries {
        if !verbose {
            println!("{}", entry.file_name);
            continue;
        }

        let (year, month, day) = entry.mod_date();
        let (hour, minute, _second) = entry.mod_time();
        println!(
            "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {}",
            entry.uncompressed_size,
            entry.compressed_size,
            ratio(entry.compressed_size, entry.uncompressed_size),
            year,
            month,
            day,
            hour,
            minute,
            entry.file_name
        );

        if !entry.is_directory {
            total_uncompressed += entry.uncompressed_size;
            total_compressed += entry.compressed_size;
            file_count += 1;
        }
    }

    if verbose {
        println!("{}", "-".repeat(70));
        println!(
            "{:>10}  {:>10}  {}  {:>21}  {} files",
            total_uncompressed,
            total_compressed,
            ratio(total_compressed, total_uncompressed),
            "",
            file_count
        );
    }

    Ok(())
}

/// Inflate every entry, recover its transform and check its CRC.
async fn test_files<R: ReadAt + 'static>(
    extractor: &ZipExtractor<R>,
    transform: &Transform,
    quiet: bool,
) -> Result<()> {
    let recover = (!transform.is_identity()).then_some(transform);
    let mut failures = 0usize;
    for entry in extractor.list_files().await? {
        match extractor
            .extract_with(&entry, recover, &mut std::io::sink())
            .await
        {
            Ok(_) if !quiet => println!("    testing: {:<40}  OK", entry.file_name),
            Ok(_) => {}
            Err(e) => {
                failures += 1;
                println!("    testing: {:<40}  {}", entry.file_name, e);
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} entries failed the test");
    }
    if !quiet {
        println!("No errors detected in compressed data.");
    }
    Ok(())
}

/// Space saved, as a percentage column.
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

/// Format a byte size into a human-readable string.
///
/// ```ignore
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// ```
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
