use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "pfcp",
    version,
    about = "Copy a single large file in concurrent byte-range slices - generally MUCH faster than `cp` on high-latency or bandwidth-shared network mounts",
    long_about = "`pfcp` copies one file by splitting it into contiguous byte-range slices and copying
the slices concurrently, each worker reading from and writing to its own offset. On a
network-mounted filesystem multiple concurrent streams usually achieve far higher
aggregate throughput than one sequential stream, at the expense of increased disk I/O.

The destination is created up front at the full size and every slice is written in
place; a failed run leaves the destination in place but incomplete, and re-running
the whole copy is the supported recovery.

EXAMPLES:
    # Copy with 8 slices and a progress bar
    pfcp /mnt/remote/huge.img /scratch/huge.img -p 8 --progress

    # Derive the slice count from a target slice size
    pfcp /mnt/remote/huge.img /scratch/ --slice-size 256MiB --progress --summary

    # Cap concurrent slice workers and pace chunk I/O
    pfcp src.bin dst.bin -p 32 -j 4 --iops-throttle 1000"
)]
struct Args {
    // Copy options
    /// Number of slices to split the copy into
    #[arg(
        short = 'p',
        long,
        default_value = "5",
        value_name = "N",
        value_parser = clap::value_parser!(u64).range(1..),
        help_heading = "Copy options"
    )]
    parts: u64,

    /// Target slice size; the slice count is derived from the file size
    ///
    /// Accepts byte sizes like "256MiB", "1GiB", or plain numbers in bytes. Conflicts with --parts.
    #[arg(
        long,
        value_name = "SIZE",
        conflicts_with = "parts",
        help_heading = "Copy options"
    )]
    slice_size: Option<bytesize::ByteSize>,

    /// Overwrite an existing destination file
    #[arg(short, long, help_heading = "Copy options")]
    overwrite: bool,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Set the type of progress display
    ///
    /// If specified, --progress flag is implied.
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Set delay between progress updates
    ///
    /// Default is 200ms for interactive mode (`ProgressBar`) and 10s for non-interactive mode (`TextUpdates`). If specified, --progress flag is implied. Accepts human-readable durations like "200ms", "10s", "5min".
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of slices copied simultaneously (0 = one worker per slice)
    #[arg(
        short = 'j',
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    max_concurrent: usize,

    /// Read/write buffer size used by each slice worker
    #[arg(
        long,
        default_value = "1MiB",
        value_name = "SIZE",
        help_heading = "Performance & throttling"
    )]
    chunk_size: bytesize::ByteSize,

    /// Maximum number of open files (0 = no limit, unspecified = 80% of system limit)
    #[arg(long, value_name = "N", help_heading = "Performance & throttling")]
    max_open_files: Option<usize>,

    /// Limit chunk I/O operations per second across all slices (0 = no throttle)
    ///
    /// One chunk is --chunk-size bytes, so the throughput cap is roughly N * chunk size per second.
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source file path
    #[arg(value_name = "SOURCE")]
    source: std::path::PathBuf,

    /// Destination file path; an existing directory means copy into it
    #[arg(value_name = "DEST")]
    destination: std::path::PathBuf,
}

/// `pfcp foo /some/dir` copies to /some/dir/foo, the way `cp` does.
fn resolve_destination(
    source: &std::path::Path,
    destination: &std::path::Path,
) -> Result<std::path::PathBuf> {
    if destination.is_dir() {
        let file_name = source
            .file_name()
            .ok_or_else(|| anyhow!("source {:?} has no file name", source))?;
        Ok(destination.join(file_name))
    } else {
        Ok(destination.to_path_buf())
    }
}

#[instrument(skip(progress))]
async fn async_main(
    args: Args,
    progress: Arc<common::progress::Progress>,
) -> Result<common::copy::Summary, common::copy::Error> {
    let destination = resolve_destination(&args.source, &args.destination)
        .map_err(|error| common::copy::Error::new(error, Default::default()))?;
    if destination.exists() && !args.overwrite {
        return Err(common::copy::Error::new(
            anyhow!(
                "destination {:?} already exists, did you intend to specify --overwrite?",
                destination
            ),
            Default::default(),
        ));
    }
    let slices = match args.slice_size {
        Some(slice_size) => common::copy::SliceSpec::Size(slice_size.0),
        None => common::copy::SliceSpec::Count(args.parts),
    };
    let settings = common::copy::Settings {
        slices,
        // 0 means no cap beyond one worker per slice
        max_concurrent: if args.max_concurrent == 0 {
            usize::MAX
        } else {
            args.max_concurrent
        },
        chunk_size: args.chunk_size.0,
    };
    tracing::debug!("copy settings: {:?}", &settings);
    common::copy_file(&progress, &args.source, &destination, &settings).await
}

fn main() -> Result<()> {
    let args = Args::parse();
    let progress = Arc::new(common::progress::Progress::new());
    let func = {
        let args = args.clone();
        let progress = progress.clone();
        || async_main(args, progress)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_open_files: args.max_open_files,
        iops_throttle: args.iops_throttle,
    };
    let res = common::run(
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress,
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay.clone(),
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
