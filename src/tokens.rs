//! Token estimation for batching and rate-limit budgeting.
//!
//! The provider bills by its own tokenizer, which is not available here;
//! the limits this pipeline enforces were tuned against an estimate of
//! roughly four bytes per token, and the rate limiter's safety factor
//! absorbs the estimator error.

/// Estimated token count for a piece of text.
pub fn estimate(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Per-line estimates, used when truncating oversized diffs so the cut
/// lands on a line boundary.
pub fn estimate_lines(text: &str) -> Vec<(usize, u64)> {
    text.lines()
        .enumerate()
        // +1 accounts for the newline each line carries in the original
        .map(|(i, line)| (i, (line.len() as u64 + 1).div_ceil(4)))
        .collect()
}
