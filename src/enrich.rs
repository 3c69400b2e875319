//! AI enrichment: generated introductions and keywords.
//!
//! Each published document gets a one-paragraph `description` and a
//! ten-keyword `keywords` list written into its frontmatter. Results are
//! cached per document under the cache directory, keyed by a content hash,
//! so reruns only pay for documents that actually changed.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::docs;
use crate::error::{Error, Result};
use crate::frontmatter;
use crate::llm::{normalize_json_response, LanguageModel};
use crate::tokens;

const PROMPT: &str = r#"You are an AI assistant helping to enrich technical documents for an environmental monitoring documentation library.

Your tasks:
1. Read and understand the entire attached document. Ignore yml metadata and focus on the main content.
2. Generate a professional, engaging **Introduction** (max 1 paragraph) that clearly explains the document's purpose, scope, and technical focus.
3. Extract exactly 10 **precise and conceptually meaningful keywords or key phrases** that reflect the core scientific or technical content of the document.
4. Use British English spelling and terminology.

Keyword guidance:
- Do **not** use general terms like "metadata", "documentation", "nomenclature", or "report".
- Focus on **specific concepts, methods, environmental indicators, technical systems, data processing strategies**, or **analytical results** that are central to the document.
- Use **multi-word phrases** when needed for clarity and specificity.
- Think like an expert indexing the document for scientific search or semantic web use.

Return only the result as a raw JSON object (no code block, no explanation):

{
  "introduction": "...",
  "keywords": ["keyword1", "keyword2", ..., "keyword10"]
}

Avoid trailing commas in the JSON output.
"#;

/// Cached enrichment for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedEnrichment {
    hash: String,
    intro: String,
    keywords: Vec<String>,
}

/// What the model is asked to return.
#[derive(Debug, Deserialize)]
struct EnrichmentOutput {
    introduction: String,
    keywords: Vec<String>,
}

/// Outcome of an enrichment run.
#[derive(Debug, Default)]
pub struct EnrichReport {
    pub enriched: usize,
    pub from_cache: usize,
    pub skipped_budget: usize,
    pub tokens_sent: u64,
}

fn cache_path(cache_dir: &Path, key: &str) -> std::path::PathBuf {
    cache_dir.join(format!("{}.json", key.replace('/', "__")))
}

fn file_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

fn load_cache(path: &Path) -> Option<CachedEnrichment> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Enriches every document under `docs_dir`.
///
/// `modified` holds store keys (docs-dir-name-prefixed relative paths) that
/// must be re-generated regardless of the hash check; CI passes the list of
/// paths touched by the triggering commit.
pub async fn run<M: LanguageModel + ?Sized>(
    model: &M,
    docs_dir: &Path,
    cache_dir: &Path,
    excluded_dirs: &[String],
    modified: &HashSet<String>,
    token_budget: u64,
) -> Result<EnrichReport> {
    fs::create_dir_all(cache_dir)?;
    let docs_name = docs_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut report = EnrichReport::default();

    for doc_path in docs::find_qmd_files(docs_dir, excluded_dirs)? {
        let key = format!("{}/{}", docs_name, docs::rel_key(&doc_path, docs_dir));
        let content = fs::read_to_string(&doc_path)?;
        let current_hash = file_hash(content.as_bytes());
        let cpath = cache_path(cache_dir, &key);
        let mut cache = load_cache(&cpath);

        let stale = cache.as_ref().map(|c| c.hash != current_hash).unwrap_or(true);
        if modified.contains(&key) || stale {
            let input_tokens = tokens::estimate(&content);
            if report.tokens_sent + input_tokens > token_budget {
                warn!(
                    path = %doc_path.display(),
                    input_tokens,
                    "Would exceed token budget, skipping until next run"
                );
                report.skipped_budget += 1;
                // A stale cache entry is still better than nothing below.
            } else {
                info!(path = %doc_path.display(), input_tokens, "Requesting introduction and keywords");
                let raw = model.generate(PROMPT, &content).await?;
                report.tokens_sent += input_tokens;

                let normalized = normalize_json_response(&raw);
                let output: EnrichmentOutput = serde_json::from_str(&normalized).map_err(|e| {
                    error!(path = %doc_path.display(), error = %e, response = %raw, "Invalid enrichment response");
                    Error::Model(format!("invalid enrichment response for {key}: {e}"))
                })?;

                let fresh = CachedEnrichment {
                    hash: current_hash.clone(),
                    intro: output.introduction,
                    keywords: output.keywords,
                };
                fs::write(&cpath, serde_json::to_string_pretty(&fresh)?)?;
                cache = Some(fresh);
                report.enriched += 1;
            }
        } else {
            report.from_cache += 1;
        }

        if let Some(cache) = cache {
            let description = cache.intro.replace('\n', " ").trim().to_string();
            frontmatter::update_file(&doc_path, |m| {
                frontmatter::set_str(m, "description", &description);
                frontmatter::set_str_seq(m, "keywords", &cache.keywords);
            })?;
        }
    }

    info!(
        enriched = report.enriched,
        from_cache = report.from_cache,
        skipped = report.skipped_budget,
        tokens_sent = report.tokens_sent,
        "Enrichment complete"
    );
    Ok(report)
}
