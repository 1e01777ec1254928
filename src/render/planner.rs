use serde::{Deserialize, Serialize};

use crate::foundation::{
    core::{FrameIndex, FrameRange},
    error::{FramecastError, FramecastResult},
};

/// Half-open frame range owned by exactly one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub index: usize,
    pub start: FrameIndex,
    pub end: FrameIndex,
}

impl Part {
    pub fn range(self) -> FrameRange {
        FrameRange {
            start: self.start,
            end: self.end,
        }
    }

    pub fn len_frames(self) -> u64 {
        self.range().len_frames()
    }
}

/// Never more workers than frames, never fewer than one.
pub fn effective_concurrency(requested: usize, total_frames: u64) -> usize {
    let cap = usize::try_from(total_frames).unwrap_or(usize::MAX);
    requested.clamp(1, cap.max(1))
}

/// Splits `[start, start + total_frames)` into `concurrency` contiguous parts of
/// `floor(total / concurrency)` frames; the last part absorbs the remainder.
pub fn split_into_parts(
    start: FrameIndex,
    total_frames: u64,
    concurrency: usize,
) -> FramecastResult<Vec<Part>> {
    if total_frames == 0 {
        return Err(FramecastError::validation(
            "cannot plan a render of zero frames",
        ));
    }
    if concurrency == 0 {
        return Err(FramecastError::validation("concurrency must be >= 1"));
    }

    let count = effective_concurrency(concurrency, total_frames);
    let part_len = total_frames / count as u64;
    let remainder = total_frames % count as u64;

    Ok((0..count)
        .map(|index| {
            let first = start.0 + index as u64 * part_len;
            let mut last = first + part_len;
            if index == count - 1 {
                last += remainder;
            }
            Part {
                index,
                start: FrameIndex(first),
                end: FrameIndex(last),
            }
        })
        .collect())
}

#[cfg(test)]
#[path = "../../tests/unit/render/planner.rs"]
mod tests;
