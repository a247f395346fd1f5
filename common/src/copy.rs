use std::sync::Arc;

use anyhow::anyhow;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

use crate::progress;
use crate::slice::{self, Slice};

/// Error type for copy runs that preserves the run summary even on failure.
///
/// # Logging Convention
/// The Display implementation automatically shows the full error chain, so you can log it
/// with any format specifier:
/// ```ignore
/// tracing::error!("copy failed: {}", &error);   // ✅ Shows full chain
/// tracing::error!("copy failed: {:#}", &error); // ✅ Shows full chain
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

/// Failures that stop a run before any slice worker starts, plus the
/// aggregate failure raised when slice workers report errors.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid slice plan")]
    InvalidPlan(#[from] slice::PlanError),
    #[error("cannot read source {path:?}")]
    SourceUnreadable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("source {path:?} is not a regular file")]
    SourceNotFile { path: std::path::PathBuf },
    #[error("cannot write destination {path:?}")]
    DestUnwritable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{failed} of {total} slices failed ({skipped} never started); destination is incomplete")]
    SlicesFailed {
        failed: usize,
        skipped: usize,
        total: usize,
    },
}

/// How to split the source file into slices.
#[derive(Debug, Copy, Clone)]
pub enum SliceSpec {
    /// Explicit number of slices.
    Count(u64),
    /// Derive the count from a target slice size in bytes.
    Size(u64),
}

impl SliceSpec {
    fn count_for(self, file_size: u64) -> Result<u64, slice::PlanError> {
        match self {
            SliceSpec::Count(count) => Ok(count),
            SliceSpec::Size(size) => slice::count_for_size(file_size, size),
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Settings {
    pub slices: SliceSpec,
    /// Maximum number of slice workers running at once.
    pub max_concurrent: usize,
    /// Read/write buffer size for each worker, independent of slice size.
    pub chunk_size: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// The source yielded fewer bytes than the slice range demands.
    ShortRead,
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SliceFailure {
    pub kind: FailureKind,
    /// Absolute byte offset reached when the slice stopped.
    pub offset: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SliceOutcome {
    Copied,
    Failed(SliceFailure),
    /// Never started because an earlier slice failed.
    Skipped,
}

/// Terminal result of one slice, produced exactly once per slice.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SliceResult {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    pub bytes_copied: u64,
    pub outcome: SliceOutcome,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub file_size: u64,
    pub bytes_copied: u64,
    pub slices_copied: usize,
    pub slices_failed: usize,
    pub slices_skipped: usize,
    /// One entry per planned slice, ordered by index.
    pub slices: Vec<SliceResult>,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied:   {} / {}\n\
            slices copied:  {}\n\
            slices failed:  {}\n\
            slices skipped: {}",
            bytesize::ByteSize(self.bytes_copied),
            bytesize::ByteSize(self.file_size),
            self.slices_copied,
            self.slices_failed,
            self.slices_skipped,
        )?;
        for result in &self.slices {
            if let SliceOutcome::Failed(failure) = &result.outcome {
                write!(
                    f,
                    "\nslice {} [{}, {}) failed at offset {}: {}",
                    result.index, result.start, result.end, failure.offset, failure.message,
                )?;
            }
        }
        Ok(())
    }
}

/// Copy one byte range from `src` into the same range of `dst`.
///
/// Each worker owns its own pair of file handles and never touches bytes
/// outside `[slice.start, slice.end)`, which is what makes concurrent
/// writes to disjoint regions of one destination file safe without
/// locking. Failures are captured in the returned [`SliceResult`], never
/// propagated as errors; there is no internal retry.
#[instrument(skip(progress))]
async fn copy_slice(
    src: &std::path::Path,
    dst: &std::path::Path,
    slice: Slice,
    chunk_size: u64,
    progress: &progress::Progress,
) -> SliceResult {
    let outcome = copy_slice_range(src, dst, slice, chunk_size, progress).await;
    progress.finish_slice();
    match outcome {
        Ok(bytes_copied) => {
            tracing::debug!("slice {} copied {} bytes", slice.index, bytes_copied);
            SliceResult {
                index: slice.index,
                start: slice.start,
                end: slice.end,
                bytes_copied,
                outcome: SliceOutcome::Copied,
            }
        }
        Err(failure) => {
            tracing::error!(
                "slice {} failed at offset {}: {}",
                slice.index,
                failure.offset,
                failure.message
            );
            SliceResult {
                index: slice.index,
                start: slice.start,
                end: slice.end,
                // every failure site reports the offset of the last fully
                // written byte, so this never underflows
                bytes_copied: failure.offset - slice.start,
                outcome: SliceOutcome::Failed(failure),
            }
        }
    }
}

async fn copy_slice_range(
    src: &std::path::Path,
    dst: &std::path::Path,
    slice: Slice,
    chunk_size: u64,
    progress: &progress::Progress,
) -> Result<u64, SliceFailure> {
    let fail = |kind, offset, message| SliceFailure {
        kind,
        offset,
        message,
    };
    let _open_guard = throttle::open_file_permit().await;
    let mut reader = tokio::fs::File::open(src).await.map_err(|error| {
        fail(
            FailureKind::Read,
            slice.start,
            format!("failed opening source for reading: {error}"),
        )
    })?;
    let mut writer = tokio::fs::OpenOptions::new()
        .write(true)
        .open(dst)
        .await
        .map_err(|error| {
            fail(
                FailureKind::Write,
                slice.start,
                format!("failed opening destination for writing: {error}"),
            )
        })?;
    reader
        .seek(std::io::SeekFrom::Start(slice.start))
        .await
        .map_err(|error| {
            fail(
                FailureKind::Read,
                slice.start,
                format!("failed seeking source: {error}"),
            )
        })?;
    writer
        .seek(std::io::SeekFrom::Start(slice.start))
        .await
        .map_err(|error| {
            fail(
                FailureKind::Write,
                slice.start,
                format!("failed seeking destination: {error}"),
            )
        })?;
    let len = slice.len();
    let mut buf = vec![0u8; usize::try_from(chunk_size.min(len.max(1))).unwrap_or(usize::MAX)];
    let mut copied = 0u64;
    while copied < len {
        throttle::get_io_token().await;
        let offset = slice.start + copied;
        let want = usize::try_from((len - copied).min(chunk_size)).unwrap_or(buf.len());
        let read = reader.read(&mut buf[..want]).await.map_err(|error| {
            fail(FailureKind::Read, offset, format!("read failed: {error}"))
        })?;
        if read == 0 {
            return Err(fail(
                FailureKind::ShortRead,
                offset,
                format!("source ended {} bytes short of the slice range", len - copied),
            ));
        }
        writer.write_all(&buf[..read]).await.map_err(|error| {
            fail(FailureKind::Write, offset, format!("write failed: {error}"))
        })?;
        copied += read as u64;
        progress.record(slice.index, copied);
    }
    writer.flush().await.map_err(|error| {
        fail(
            FailureKind::Write,
            slice.start + copied,
            format!("flush failed: {error}"),
        )
    })?;
    Ok(copied)
}

/// Copy `src` to `dst` as a set of concurrently copied slices.
///
/// Configuration and setup problems (bad settings, unreadable source,
/// unwritable destination) fail the run before any worker starts. Once
/// workers run, per-slice failures are collected, the remaining queued
/// slices are skipped, and the aggregate failure is returned with the full
/// per-slice detail in its summary. The destination is left in place on
/// failure; it is explicitly not guaranteed complete. Re-running the whole
/// copy is the supported recovery path.
#[instrument(skip(progress))]
pub async fn copy_file(
    progress: &Arc<progress::Progress>,
    src: &std::path::Path,
    dst: &std::path::Path,
    settings: &Settings,
) -> Result<Summary, Error> {
    if settings.max_concurrent == 0 {
        return Err(Error::new(
            RunError::InvalidConfig("max_concurrent must be at least 1".to_string()).into(),
            Summary::default(),
        ));
    }
    if settings.chunk_size == 0 {
        return Err(Error::new(
            RunError::InvalidConfig("chunk_size must be at least 1 byte".to_string()).into(),
            Summary::default(),
        ));
    }
    tracing::debug!("reading source metadata");
    let src_metadata = tokio::fs::metadata(src).await.map_err(|source| {
        Error::new(
            RunError::SourceUnreadable {
                path: src.to_path_buf(),
                source,
            }
            .into(),
            Summary::default(),
        )
    })?;
    if !src_metadata.is_file() {
        return Err(Error::new(
            RunError::SourceNotFile {
                path: src.to_path_buf(),
            }
            .into(),
            Summary::default(),
        ));
    }
    // truncating the destination would destroy the source if they alias
    if let (Ok(src_canon), Ok(dst_canon)) = (
        tokio::fs::canonicalize(src).await,
        tokio::fs::canonicalize(dst).await,
    ) && src_canon == dst_canon
    {
        return Err(Error::new(
            RunError::InvalidConfig(format!(
                "source and destination are the same file: {src_canon:?}"
            ))
            .into(),
            Summary::default(),
        ));
    }
    let file_size = src_metadata.len();
    let slice_count = settings
        .slices
        .count_for(file_size)
        .map_err(|error| Error::new(RunError::from(error).into(), Summary::default()))?;
    let slices = slice::plan(file_size, slice_count)
        .map_err(|error| Error::new(RunError::from(error).into(), Summary::default()))?;
    tracing::debug!(
        "copying {} bytes in {} slices, at most {} concurrent",
        file_size,
        slices.len(),
        settings.max_concurrent
    );
    // pre-size the destination so every worker can seek-and-write its own
    // range without the file growing underneath concurrent writers
    let dst_file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)
        .await
        .map_err(|source| {
            Error::new(
                RunError::DestUnwritable {
                    path: dst.to_path_buf(),
                    source,
                }
                .into(),
                Summary::default(),
            )
        })?;
    dst_file.set_len(file_size).await.map_err(|source| {
        Error::new(
            RunError::DestUnwritable {
                path: dst.to_path_buf(),
                source,
            }
            .into(),
            Summary::default(),
        )
    })?;
    drop(dst_file);
    progress.start_run(file_size, slices.len());
    let mut results: Vec<Option<SliceResult>> = vec![None; slices.len()];
    let mut failed = false;
    let mut join_set = tokio::task::JoinSet::new();
    // dispatch in index order; the JoinSet acts as the bounded worker pool
    for slice in &slices {
        while !failed && join_set.len() >= settings.max_concurrent {
            let result: SliceResult = join_set
                .join_next()
                .await
                .expect("JoinSet must not be empty here!")
                .map_err(|error| {
                    Error::new(
                        anyhow!(error).context("slice worker did not complete"),
                        assemble_summary(file_size, &slices, &results),
                    )
                })?;
            failed |= matches!(result.outcome, SliceOutcome::Failed(_));
            let index = result.index;
            results[index] = Some(result);
        }
        if failed {
            // in-flight slices run to their own completion but nothing new
            // starts once a failure has been observed
            break;
        }
        let src = src.to_path_buf();
        let dst = dst.to_path_buf();
        let progress = progress.clone();
        let chunk_size = settings.chunk_size;
        let slice = *slice;
        join_set
            .spawn(async move { copy_slice(&src, &dst, slice, chunk_size, &progress).await });
    }
    while let Some(res) = join_set.join_next().await {
        let result = res.map_err(|error| {
            Error::new(
                anyhow!(error).context("slice worker did not complete"),
                assemble_summary(file_size, &slices, &results),
            )
        })?;
        let index = result.index;
        results[index] = Some(result);
    }
    let summary = assemble_summary(file_size, &slices, &results);
    if summary.slices_failed > 0 || summary.slices_skipped > 0 {
        return Err(Error::new(
            RunError::SlicesFailed {
                failed: summary.slices_failed,
                skipped: summary.slices_skipped,
                total: summary.slices.len(),
            }
            .into(),
            summary,
        ));
    }
    Ok(summary)
}

/// Fill never-started slices in as `Skipped` and fold everything into a
/// [`Summary`] ordered by slice index.
fn assemble_summary(
    file_size: u64,
    slices: &[Slice],
    results: &[Option<SliceResult>],
) -> Summary {
    let mut summary = Summary {
        file_size,
        ..Default::default()
    };
    for slice in slices {
        let result = results[slice.index].clone().unwrap_or(SliceResult {
            index: slice.index,
            start: slice.start,
            end: slice.end,
            bytes_copied: 0,
            outcome: SliceOutcome::Skipped,
        });
        match &result.outcome {
            SliceOutcome::Copied => summary.slices_copied += 1,
            SliceOutcome::Failed(_) => summary.slices_failed += 1,
            SliceOutcome::Skipped => summary.slices_skipped += 1,
        }
        summary.bytes_copied += result.bytes_copied;
        summary.slices.push(result);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;

    fn test_settings(parts: u64) -> Settings {
        Settings {
            slices: SliceSpec::Count(parts),
            max_concurrent: 4,
            chunk_size: 64 * 1024,
        }
    }

    async fn check_round_trip(size: usize, parts: u64) -> anyhow::Result<Summary> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src.bin");
        let dst = tmp_dir.join("dst.bin");
        let data = testutils::patterned_bytes(size);
        tokio::fs::write(&src, &data).await?;
        let progress = Arc::new(progress::Progress::new());
        let summary = copy_file(&progress, &src, &dst, &test_settings(parts)).await?;
        let copied = tokio::fs::read(&dst).await?;
        assert_eq!(copied, data, "destination bytes differ from source");
        assert_eq!(summary.bytes_copied, size as u64);
        assert_eq!(summary.slices_failed, 0);
        assert_eq!(summary.slices_skipped, 0);
        assert_eq!(progress.fraction(), 1.0);
        Ok(summary)
    }

    #[tokio::test]
    async fn round_trip_uneven_remainder() -> anyhow::Result<()> {
        let summary = check_round_trip(10, 3).await?;
        assert_eq!(summary.slices_copied, 3);
        Ok(())
    }

    #[tokio::test]
    async fn round_trip_large_file() -> anyhow::Result<()> {
        // not a multiple of the chunk size or the slice count
        let summary = check_round_trip(1024 * 1024 + 7, 4).await?;
        assert_eq!(summary.slices_copied, 4);
        Ok(())
    }

    #[tokio::test]
    async fn round_trip_single_slice() -> anyhow::Result<()> {
        let summary = check_round_trip(4096, 1).await?;
        assert_eq!(summary.slices_copied, 1);
        Ok(())
    }

    #[tokio::test]
    async fn round_trip_empty_file() -> anyhow::Result<()> {
        let summary = check_round_trip(0, 5).await?;
        assert_eq!(summary.slices_copied, 1);
        assert_eq!(summary.bytes_copied, 0);
        Ok(())
    }

    #[tokio::test]
    async fn more_parts_than_bytes() -> anyhow::Result<()> {
        let summary = check_round_trip(3, 10).await?;
        assert_eq!(summary.slices_copied, 3);
        Ok(())
    }

    #[tokio::test]
    async fn slice_count_from_target_size() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src.bin");
        let dst = tmp_dir.join("dst.bin");
        let data = testutils::patterned_bytes(100_000);
        tokio::fs::write(&src, &data).await?;
        let progress = Arc::new(progress::Progress::new());
        let settings = Settings {
            slices: SliceSpec::Size(30_000),
            max_concurrent: 4,
            chunk_size: 8 * 1024,
        };
        let summary = copy_file(&progress, &src, &dst, &settings).await?;
        assert_eq!(summary.slices_copied, 4);
        assert_eq!(tokio::fs::read(&dst).await?, data);
        Ok(())
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let progress = Arc::new(progress::Progress::new());
        let settings = Settings {
            slices: SliceSpec::Count(2),
            max_concurrent: 0,
            chunk_size: 1024,
        };
        let error = copy_file(
            &progress,
            &tmp_dir.join("src.bin"),
            &tmp_dir.join("dst.bin"),
            &settings,
        )
        .await
        .expect_err("expected invalid configuration");
        assert!(matches!(
            error.source.downcast_ref::<RunError>(),
            Some(RunError::InvalidConfig(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_fails_fast() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let progress = Arc::new(progress::Progress::new());
        let error = copy_file(
            &progress,
            &tmp_dir.join("no-such-file"),
            &tmp_dir.join("dst.bin"),
            &test_settings(2),
        )
        .await
        .expect_err("expected unreadable source");
        assert!(matches!(
            error.source.downcast_ref::<RunError>(),
            Some(RunError::SourceUnreadable { .. })
        ));
        // fail-fast: no destination was created
        assert!(!tmp_dir.join("dst.bin").exists());
        Ok(())
    }

    #[tokio::test]
    async fn directory_source_fails_fast() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let progress = Arc::new(progress::Progress::new());
        let error = copy_file(
            &progress,
            &tmp_dir,
            &tmp_dir.join("dst.bin"),
            &test_settings(2),
        )
        .await
        .expect_err("expected source-not-file");
        assert!(matches!(
            error.source.downcast_ref::<RunError>(),
            Some(RunError::SourceNotFile { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn unwritable_destination_fails_fast() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src.bin");
        tokio::fs::write(&src, testutils::patterned_bytes(128)).await?;
        let progress = Arc::new(progress::Progress::new());
        let error = copy_file(
            &progress,
            &src,
            &tmp_dir.join("missing-dir").join("dst.bin"),
            &test_settings(2),
        )
        .await
        .expect_err("expected unwritable destination");
        assert!(matches!(
            error.source.downcast_ref::<RunError>(),
            Some(RunError::DestUnwritable { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn aliased_source_and_destination_are_rejected() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src.bin");
        tokio::fs::write(&src, testutils::patterned_bytes(128)).await?;
        let progress = Arc::new(progress::Progress::new());
        let error = copy_file(&progress, &src, &src, &test_settings(2))
            .await
            .expect_err("expected aliasing rejection");
        assert!(matches!(
            error.source.downcast_ref::<RunError>(),
            Some(RunError::InvalidConfig(_))
        ));
        // the source must not have been truncated
        assert_eq!(tokio::fs::metadata(&src).await?.len(), 128);
        Ok(())
    }

    #[tokio::test]
    async fn short_read_is_reported_with_offset() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src.bin");
        let dst = tmp_dir.join("dst.bin");
        tokio::fs::write(&src, testutils::patterned_bytes(10)).await?;
        tokio::fs::write(&dst, b"").await?;
        let progress = progress::Progress::new();
        progress.start_run(100, 1);
        // the slice demands more bytes than the source holds
        let slice = Slice {
            index: 0,
            start: 0,
            end: 100,
        };
        let result = copy_slice(&src, &dst, slice, 4, &progress).await;
        assert_eq!(result.bytes_copied, 10);
        match result.outcome {
            SliceOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::ShortRead);
                assert_eq!(failure.offset, 10);
            }
            other => panic!("expected a short read, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn write_failure_is_reported() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src.bin");
        tokio::fs::write(&src, testutils::patterned_bytes(10)).await?;
        let progress = progress::Progress::new();
        progress.start_run(10, 1);
        // a directory cannot be opened for writing
        let slice = Slice {
            index: 0,
            start: 0,
            end: 10,
        };
        let result = copy_slice(&src, &tmp_dir, slice, 4, &progress).await;
        assert_eq!(result.bytes_copied, 0);
        match result.outcome {
            SliceOutcome::Failed(failure) => assert_eq!(failure.kind, FailureKind::Write),
            other => panic!("expected a write failure, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn failure_skips_pending_slices() -> anyhow::Result<()> {
        if nix::unistd::geteuid().is_root() {
            // root bypasses file permissions; the induced failure cannot happen
            return Ok(());
        }
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src.bin");
        let dst = tmp_dir.join("dst.bin");
        tokio::fs::write(&src, testutils::patterned_bytes(64 * 1024)).await?;
        // stat still works but every worker's open will fail
        let mut perms = tokio::fs::metadata(&src).await?.permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o000);
        tokio::fs::set_permissions(&src, perms).await?;
        let progress = Arc::new(progress::Progress::new());
        let settings = Settings {
            slices: SliceSpec::Count(8),
            max_concurrent: 2,
            chunk_size: 1024,
        };
        let error = copy_file(&progress, &src, &dst, &settings)
            .await
            .expect_err("expected slice failures");
        let summary = &error.summary;
        assert!(summary.slices_failed >= 1);
        assert!(
            summary.slices_skipped >= 1,
            "queued slices must not start after a failure: {summary:?}"
        );
        assert_eq!(summary.slices.len(), 8);
        assert!(matches!(
            error.source.downcast_ref::<RunError>(),
            Some(RunError::SlicesFailed { .. })
        ));
        Ok(())
    }
}
