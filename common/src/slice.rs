//! Slice planning: partition a file into contiguous, disjoint byte ranges.

/// A contiguous byte range of the source file assigned to one worker.
///
/// `start` is inclusive, `end` exclusive. Ranges produced by [`plan`] are
/// sorted by `index`, pairwise disjoint and cover `[0, file_size)` exactly.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Slice {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Slice {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("slice count must be at least 1")]
    ZeroSliceCount,
    #[error("slice size must be at least 1 byte")]
    ZeroSliceSize,
}

/// Split `file_size` bytes into `slice_count` ranges.
///
/// The remainder of the integer division is spread over the leading slices
/// so no two slices differ in length by more than one byte. A slice count
/// larger than the file is clamped down to one byte per slice; an empty
/// file yields a single `[0, 0)` slice so a copy run always has at least
/// one slice to report a terminal result for.
pub fn plan(file_size: u64, slice_count: u64) -> Result<Vec<Slice>, PlanError> {
    if slice_count == 0 {
        return Err(PlanError::ZeroSliceCount);
    }
    if file_size == 0 {
        return Ok(vec![Slice {
            index: 0,
            start: 0,
            end: 0,
        }]);
    }
    let slice_count = slice_count.min(file_size);
    let base = file_size / slice_count;
    let remainder = file_size % slice_count;
    let mut slices = Vec::with_capacity(usize::try_from(slice_count).unwrap_or(usize::MAX));
    let mut start = 0u64;
    for index in 0..slice_count {
        let len = if index < remainder { base + 1 } else { base };
        slices.push(Slice {
            index: index as usize,
            start,
            end: start + len,
        });
        start += len;
    }
    Ok(slices)
}

/// Derive a slice count from a target slice size, rounding up so every
/// slice is at most `target_size` bytes.
pub fn count_for_size(file_size: u64, target_size: u64) -> Result<u64, PlanError> {
    if target_size == 0 {
        return Err(PlanError::ZeroSliceSize);
    }
    if file_size == 0 {
        return Ok(1);
    }
    Ok(file_size.div_ceil(target_size))
}
