use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Aggregated copy progress, shared between slice workers and the display
/// loop.
///
/// Workers publish cumulative per-slice byte counts with [`Progress::record`];
/// the display side polls [`Progress::fraction`] or [`Progress::bytes_copied`].
/// Updates are wait-free (`fetch_max` on one atomic per slice) so progress
/// reporting never sits on the copy path.
#[derive(Debug)]
pub struct Progress {
    run: OnceLock<RunState>,
    start_time: std::time::Instant,
}

#[derive(Debug)]
struct RunState {
    total_bytes: u64,
    // cumulative bytes per slice; only grows, one writer per index
    copied: Vec<AtomicU64>,
    finished: AtomicUsize,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            run: OnceLock::new(),
            start_time: std::time::Instant::now(),
        }
    }

    /// Install the per-slice counters for this run. Called once by the
    /// orchestrator after planning; later calls are ignored.
    pub fn start_run(&self, total_bytes: u64, slice_count: usize) {
        let mut copied = Vec::with_capacity(slice_count);
        copied.resize_with(slice_count, || AtomicU64::new(0));
        if self
            .run
            .set(RunState {
                total_bytes,
                copied,
                finished: AtomicUsize::new(0),
            })
            .is_err()
        {
            tracing::debug!("progress counters already installed, keeping the existing run");
        }
    }

    /// Publish the cumulative byte count for one slice.
    ///
    /// `fetch_max` keeps each per-slice counter monotonic even if updates
    /// race, which in turn keeps the overall fraction monotonic.
    pub fn record(&self, index: usize, bytes_so_far: u64) {
        if let Some(run) = self.run.get() {
            run.copied[index].fetch_max(bytes_so_far, Ordering::Release);
        }
    }

    /// Mark one slice as having reached a terminal state.
    pub fn finish_slice(&self) {
        if let Some(run) = self.run.get() {
            run.finished.fetch_add(1, Ordering::Release);
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.run.get().map_or(0, |run| run.total_bytes)
    }

    pub fn bytes_copied(&self) -> u64 {
        self.run.get().map_or(0, |run| {
            run.copied
                .iter()
                .map(|count| count.load(Ordering::Acquire))
                .sum()
        })
    }

    pub fn slices_finished(&self) -> usize {
        self.run
            .get()
            .map_or(0, |run| run.finished.load(Ordering::Acquire))
    }

    pub fn slices_total(&self) -> usize {
        self.run.get().map_or(0, |run| run.copied.len())
    }

    /// Overall completion in `[0, 1]`; non-decreasing over the life of a
    /// run and exactly 1.0 once every slice has copied its full range.
    pub fn fraction(&self) -> f64 {
        let Some(run) = self.run.get() else {
            return 0.0;
        };
        if run.total_bytes == 0 {
            // an empty file has no bytes to count; completion is whether
            // its single slice has reached a terminal state
            return if self.slices_finished() == run.copied.len() {
                1.0
            } else {
                0.0
            };
        }
        self.bytes_copied() as f64 / run.total_bytes as f64
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats periodic text status lines for non-interactive runs.
pub struct ProgressReporter<'a> {
    progress: &'a Progress,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_bytes: progress.bytes_copied(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn status_line(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let bytes = self.progress.bytes_copied();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let average_rate = bytes as f64 / total_duration_secs.max(f64::EPSILON);
        let current_rate =
            (bytes - self.last_bytes) as f64 / curr_duration_secs.max(f64::EPSILON);
        self.last_bytes = bytes;
        self.last_update = time_now;
        format!(
            "copied: {} / {} ({:5.1}%)  slices: {}/{}  average: {}/s  current: {}/s",
            bytesize::ByteSize(bytes),
            bytesize::ByteSize(self.progress.total_bytes()),
            self.progress.fraction() * 100.0,
            self.progress.slices_finished(),
            self.progress.slices_total(),
            bytesize::ByteSize(average_rate as u64),
            bytesize::ByteSize(current_rate as u64),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_is_monotonic_and_reaches_one() {
        let progress = Progress::new();
        progress.start_run(10, 3);
        let mut last = progress.fraction();
        assert_eq!(last, 0.0);
        for (index, bytes) in [(0, 2), (1, 1), (0, 4), (2, 3), (1, 3)] {
            progress.record(index, bytes);
            let fraction = progress.fraction();
            assert!(fraction >= last);
            last = fraction;
        }
        assert_eq!(progress.bytes_copied(), 10);
        assert_eq!(last, 1.0);
    }

    #[test]
    fn stale_updates_never_regress() {
        let progress = Progress::new();
        progress.start_run(100, 1);
        progress.record(0, 60);
        progress.record(0, 40);
        assert_eq!(progress.bytes_copied(), 60);
    }

    #[test]
    fn empty_run_completes_when_slices_finish() {
        let progress = Progress::new();
        progress.start_run(0, 1);
        assert_eq!(progress.fraction(), 0.0);
        progress.finish_slice();
        assert_eq!(progress.fraction(), 1.0);
    }

    #[test]
    fn no_run_reports_zero() {
        let progress = Progress::new();
        assert_eq!(progress.fraction(), 0.0);
        assert_eq!(progress.bytes_copied(), 0);
        assert_eq!(progress.slices_total(), 0);
    }

    #[test]
    fn concurrent_updates_sum_correctly() {
        let progress = std::sync::Arc::new(Progress::new());
        progress.start_run(8 * 1000, 8);
        std::thread::scope(|scope| {
            for index in 0..8 {
                let progress = &progress;
                scope.spawn(move || {
                    for bytes in 1..=1000 {
                        progress.record(index, bytes);
                    }
                    progress.finish_slice();
                });
            }
        });
        assert_eq!(progress.bytes_copied(), 8 * 1000);
        assert_eq!(progress.slices_finished(), 8);
        assert_eq!(progress.fraction(), 1.0);
    }

    #[test]
    fn reporter_formats_status() {
        let progress = Progress::new();
        progress.start_run(100, 2);
        progress.record(0, 50);
        let mut reporter = ProgressReporter::new(&progress);
        let line = reporter.status_line();
        assert!(line.contains("copied:"), "unexpected status line: {line}");
        assert!(line.contains("slices: 0/2"), "unexpected status line: {line}");
    }
}
