//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of open files (None = 80% of system limit)
    pub max_open_files: Option<usize>,
    /// Chunk I/O operations per second throttle (0 = no throttle)
    pub iops_throttle: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// The kind of progress display to drive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Pick `ProgressBar` or `TextUpdates` based on whether stderr is a terminal
    #[default]
    #[value(alias = "Auto")]
    Auto,
    /// Animated interactive progress bar
    #[value(alias = "ProgressBar")]
    ProgressBar,
    /// Periodic status lines, appropriate for logging
    #[value(alias = "TextUpdates")]
    TextUpdates,
}

/// Progress display configuration handed to [`crate::run`]
#[derive(Debug)]
pub struct ProgressSettings {
    /// Shared progress state, also handed to the copy engine
    pub progress: std::sync::Arc<crate::progress::Progress>,
    pub progress_type: ProgressType,
    /// Delay between display updates, human readable (e.g. "200ms", "10s");
    /// defaults depend on the display type
    pub progress_delay: Option<String>,
}
