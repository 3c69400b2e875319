//! Greedy bin-packing of per-file diffs into model-sized batches.

use tracing::debug;

/// One file's prepared diff plus its estimated token cost.
#[derive(Debug, Clone)]
pub struct FileDiff {
    pub path: String,
    pub diff: String,
    pub tokens: u64,
}

/// Allowance for the instruction prompt and per-file framing that gets
/// prepended to every batch.
pub const PROMPT_OVERHEAD: u64 = 5_000;

/// Packs diffs into batches that respect both the token ceiling and the
/// file-count ceiling. Largest diffs are placed first so a single huge file
/// does not strand a batch at two members.
pub fn pack(mut diffs: Vec<FileDiff>, max_tokens: u64, max_files: usize) -> Vec<Vec<FileDiff>> {
    diffs.sort_by(|a, b| b.tokens.cmp(&a.tokens));

    let mut batches: Vec<Vec<FileDiff>> = Vec::new();
    let mut current: Vec<FileDiff> = Vec::new();
    let mut current_tokens: u64 = 0;

    for file in diffs {
        let batch_is_full = current.len() >= max_files;
        let tokens_would_exceed = current_tokens + file.tokens + PROMPT_OVERHEAD > max_tokens;

        if (batch_is_full || tokens_would_exceed) && !current.is_empty() {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }

        current_tokens += file.tokens;
        current.push(file);
    }

    if !current.is_empty() {
        batches.push(current);
    }

    debug!(batches = batches.len(), "Packed diffs into batches");
    batches
}
