//! Core library for `pfcp`: slice planning, the parallel copy engine,
//! progress aggregation and the shared binary harness.
//!
//! A copy run plans the source file into contiguous, disjoint byte ranges
//! ([`slice`]), copies them concurrently into a pre-sized destination
//! ([`copy`]) and aggregates per-slice byte counts into an overall
//! completion fraction ([`progress`]). [`run`] is the harness the binaries
//! use: it sets up logging, resource limits, the tokio runtime and the
//! progress display around an async entry point.

use std::io::IsTerminal;

pub mod config;
pub mod copy;
pub mod progress;
pub mod slice;
pub mod testutils;

pub use config::{OutputConfig, ProgressSettings, ProgressType, RuntimeConfig, ThrottleConfig};
pub use copy::copy_file;

const IO_REPLENISH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);
const DEFAULT_BAR_DELAY: std::time::Duration = std::time::Duration::from_millis(200);
const DEFAULT_TEXT_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

/// 80% of the file descriptor limit, after raising the soft limit as far
/// as the hard limit allows. 0 disables the open-files gate.
fn default_max_open_files() -> usize {
    use nix::sys::resource::{Resource, getrlimit, setrlimit};
    let (soft, hard) = match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok(limits) => limits,
        Err(error) => {
            tracing::info!("failed reading the open files limit: {}", error);
            return 0;
        }
    };
    if soft < hard && setrlimit(Resource::RLIMIT_NOFILE, hard, hard).is_err() {
        tracing::info!("failed raising the open files limit (expected on some targets)");
    }
    let limit = getrlimit(Resource::RLIMIT_NOFILE).map_or(soft, |(soft, _)| soft);
    if limit == nix::sys::resource::RLIM_INFINITY {
        return 0;
    }
    usize::try_from(limit / 5 * 4).unwrap_or(0)
}

fn display_delay(settings: &ProgressSettings, interactive: bool) -> std::time::Duration {
    let default = if interactive {
        DEFAULT_BAR_DELAY
    } else {
        DEFAULT_TEXT_DELAY
    };
    settings
        .progress_delay
        .as_deref()
        .and_then(|delay| match humantime::parse_duration(delay) {
            Ok(delay) => Some(delay),
            Err(error) => {
                tracing::error!("invalid progress delay {:?}: {}", delay, error);
                None
            }
        })
        .unwrap_or(default)
}

async fn report_progress(
    settings: ProgressSettings,
    mut done: tokio::sync::watch::Receiver<bool>,
) {
    let interactive = match settings.progress_type {
        ProgressType::Auto => std::io::stderr().is_terminal(),
        ProgressType::ProgressBar => true,
        ProgressType::TextUpdates => false,
    };
    let progress = settings.progress.clone();
    let mut interval = tokio::time::interval(display_delay(&settings, interactive));
    if interactive {
        let bar = indicatif::ProgressBar::with_draw_target(
            None,
            indicatif::ProgressDrawTarget::stderr(),
        );
        bar.set_style(
            indicatif::ProgressStyle::with_template(
                "{bytes} / {total_bytes} ({percent:>3}%)  {wide_bar}  {binary_bytes_per_sec}  eta {eta}",
            )
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar()),
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    bar.set_length(progress.total_bytes());
                    bar.set_position(progress.bytes_copied());
                }
                _ = done.changed() => break,
            }
        }
        bar.set_length(progress.total_bytes());
        bar.set_position(progress.bytes_copied());
        bar.finish_and_clear();
    } else {
        let mut reporter = progress::ProgressReporter::new(&progress);
        loop {
            tokio::select! {
                _ = interval.tick() => eprintln!("{}", reporter.status_line()),
                _ = done.changed() => break,
            }
        }
        eprintln!("{}", reporter.status_line());
    }
}

/// Shared harness for the binaries: tracing subscriber, file descriptor
/// limits, throttling, the tokio runtime and the progress display around
/// the async entry point. Returns `None` on failure; the caller maps that
/// to a nonzero exit code.
pub fn run<SummaryT, F, Fut>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle_config: ThrottleConfig,
    func: F,
) -> Option<SummaryT>
where
    SummaryT: std::fmt::Display,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<SummaryT, copy::Error>>,
{
    let level = match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    let max_open_files = throttle_config
        .max_open_files
        .unwrap_or_else(default_max_open_files);
    if max_open_files > 0 {
        tracing::debug!("limiting open files to {}", max_open_files);
    }
    throttle::set_max_open_files(max_open_files);
    let io_replenish = if throttle_config.iops_throttle > 0 {
        // a tenth of the per-second budget every 100ms
        let replenish = std::cmp::max(1, throttle_config.iops_throttle / 10);
        throttle::init_io_tokens(replenish);
        Some(replenish)
    } else {
        None
    };
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            tracing::error!("failed building the tokio runtime: {}", error);
            return None;
        }
    };
    let result = tokio_runtime.block_on(async move {
        if let Some(replenish) = io_replenish {
            tokio::spawn(throttle::run_io_replenish_task(
                replenish,
                IO_REPLENISH_INTERVAL,
            ));
        }
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);
        let progress_task =
            progress.map(|settings| tokio::spawn(report_progress(settings, done_rx)));
        let result = func().await;
        if let Some(task) = progress_task {
            let _ = done_tx.send(true);
            let _ = task.await;
        }
        result
    });
    match result {
        Ok(summary) => {
            if output.print_summary {
                println!("{}", &summary);
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", &error);
                if output.print_summary {
                    eprintln!("{}", &error.summary);
                }
            }
            None
        }
    }
}
