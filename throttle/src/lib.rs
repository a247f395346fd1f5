//! File handle and I/O rate gating for the parallel copy engine
//!
//! Every slice worker holds two file handles (a reader on the source and a
//! writer on the destination) for as long as it runs, so a copy with many
//! slices can brush up against the process file descriptor limit. Workers
//! also issue one positioned read and one write per chunk, which on a
//! shared network mount may need to be paced. This crate provides the two
//! process-wide gates for that:
//!
//! 1. **Open files limit** - a permit covering a worker's handle pair,
//!    bounding the number of simultaneously open files
//! 2. **I/O throttle** - a token bucket consumed once per chunk and
//!    replenished at a fixed interval by a background task
//!
//! Both gates are inert until configured, so unthrottled runs pay only an
//! atomic load per call.
//!
//! # Usage
//!
//! ```rust,no_run
//! use throttle::{set_max_open_files, open_file_permit, init_io_tokens, get_io_token};
//!
//! # async fn example() {
//! // typically 80% of the system file descriptor limit
//! set_max_open_files(8000);
//!
//! // pace chunk I/O: 100 tokens replenished every 100ms = 1000 chunks/sec
//! init_io_tokens(100);
//! tokio::spawn(throttle::run_io_replenish_task(
//!     100,
//!     std::time::Duration::from_millis(100),
//! ));
//!
//! // held by a slice worker across both of its file handles
//! let _guard = open_file_permit().await;
//! // consumed before each chunk read
//! get_io_token().await;
//! # }
//! ```
//!
//! With a chunk size of 1MiB, an I/O throttle of 1000 chunks/sec caps
//! aggregate throughput at about 1 GiB/s across all slices.

mod semaphore;

static OPEN_FILES_LIMIT: std::sync::LazyLock<semaphore::Semaphore> =
    std::sync::LazyLock::new(semaphore::Semaphore::new);
static IO_THROTTLE: std::sync::LazyLock<semaphore::Semaphore> =
    std::sync::LazyLock::new(semaphore::Semaphore::new);

pub fn set_max_open_files(max_open_files: usize) {
    OPEN_FILES_LIMIT.setup(max_open_files);
}

pub struct OpenFileGuard {
    _permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

/// Acquire a permit before opening file handles; released on drop.
pub async fn open_file_permit() -> OpenFileGuard {
    OpenFileGuard {
        _permit: OPEN_FILES_LIMIT.acquire().await,
    }
}

pub fn init_io_tokens(io_tokens: usize) {
    IO_THROTTLE.setup(io_tokens);
}

/// Consume one I/O token; parks the caller when the bucket is empty.
pub async fn get_io_token() {
    IO_THROTTLE.consume().await;
}

pub async fn run_io_replenish_task(replenish: usize, interval: std::time::Duration) {
    IO_THROTTLE.run_replenish_task(replenish, interval).await;
}
