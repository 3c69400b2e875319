//! High-level pipeline: orchestrates the version-and-changelog update.
//!
//! This module provides the top-level orchestration for versioning every
//! changed document since the last release:
//!   - Resolves the release baseline from git tags (branch-aware)
//!   - Extracts and prepares per-document diffs (clean, truncate)
//!   - Packs diffs into batches and submits them to a [`LanguageModel`]
//!     under provider rate limits, splitting and retrying incomplete
//!     batches
//!   - Applies the decisions: bumps semantic versions in frontmatter and
//!     merges changelog entries into the persistent stores
//!
//! # Major Types
//! - [`VersionRecord`]: per-document tracking state in `versions.json`
//! - [`BumpDecision`]: what the model returns per document
//! - [`VersioningReport`]: output report for downstream audit
//!
//! # Responsibilities
//! - Fail-fast orchestration: a batch that stays incomplete after splitting,
//!   a model-reported `error` bump, or daily-quota exhaustion aborts the run
//! - Idempotent store merges: re-running a release replaces entries instead
//!   of duplicating them
//! - Does not mutate git state; all inputs come from read-only plumbing
//!
//! # Error Handling
//! Each failed step returns immediately with a typed error; callers log and
//! surface these to CI.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::batching::{pack, FileDiff};
use crate::changelog::{self, ChangelogEntry};
use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::frontmatter;
use crate::gitops::{clean_diff, truncate_diff, GitRepo, Rename};
use crate::llm::{normalize_json_response, LanguageModel};
use crate::rate_limit::RateLimiter;
use crate::tokens;

/// File name of the versions store inside the cache directory.
pub const VERSIONS_FILE: &str = "versions.json";
/// File name of the changelog store inside the cache directory.
pub const CHANGELOGS_FILE: &str = "change_logs.json";

/// How many times an incomplete batch may be split in half before the run
/// gives up.
const MAX_BATCH_SPLITS: u32 = 2;

/// Per-document tracking state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionRecord {
    pub current_version: String,
    pub major_from_filename: u32,
    pub last_updated: String,
    pub last_release_tag: String,
    pub last_bump: String,
    pub last_bump_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_changelog: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renamed_at: Option<String>,
}

/// Repo-relative document path -> tracking state. A `BTreeMap` keeps the
/// serialized store diff-friendly.
pub type VersionsStore = BTreeMap<String, VersionRecord>;

pub fn load_versions(path: &Path) -> Result<VersionsStore> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(VersionsStore::new())
    }
}

pub fn save_versions(path: &Path, store: &VersionsStore) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    fs::write(tmp.path(), serde_json::to_string_pretty(store)?)?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    info!(path = %path.display(), "Saved version metadata");
    Ok(())
}

/// The model's verdict for one document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BumpDecision {
    pub version: VersionVerdict,
    pub changelog: ChangelogVerdict,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VersionVerdict {
    pub bump: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChangelogVerdict {
    pub format: String,
    pub summary: String,
}

/// Outcome of a versioning run.
#[derive(Debug, Default)]
pub struct VersioningReport {
    pub processed: usize,
    pub first_release: bool,
    pub renames: usize,
    pub requests: u32,
    pub dry_run: bool,
}

/// The major version lives in the filename: `<name>_v<major>.qmd`.
pub fn extract_major_version(filename: &str) -> Result<u32> {
    let re = Regex::new(r"_v(\d+)\.qmd$").expect("static regex");
    re.captures(filename)
        .and_then(|c| c[1].parse().ok())
        .ok_or_else(|| Error::MissingMajorVersion(filename.to_string()))
}

/// Applies a bump to `current`, resetting to `{major}.0.0` when the stored
/// version disagrees with the filename major or cannot be parsed.
pub fn calculate_new_version(current: &str, bump: &str, major_from_filename: u32) -> String {
    let parts: Vec<u32> = current.split('.').filter_map(|p| p.parse().ok()).collect();
    let [major, mut minor, mut patch] = match parts.as_slice() {
        [a, b, c] => [*a, *b, *c],
        _ => {
            error!(current, "Unparseable current version, resetting");
            return format!("{major_from_filename}.0.0");
        }
    };

    if major != major_from_filename {
        warn!(
            current,
            filename_major = major_from_filename,
            "Major version mismatch, resetting"
        );
        return format!("{major_from_filename}.0.0");
    }

    match bump {
        "minor" => {
            minor += 1;
            patch = 0;
        }
        "patch" => patch += 1,
        other => {
            warn!(bump = other, "Unknown bump type, defaulting to patch");
            patch += 1;
        }
    }
    format!("{major}.{minor}.{patch}")
}

/// Copies tracking state from a renamed document's old path to its new one
/// so its version history survives the rename.
pub fn migrate_rename_metadata(renames: &[Rename], store: &mut VersionsStore, now: &str) {
    for rename in renames {
        if let Some(old_record) = store.get(&rename.old).cloned() {
            info!(old = %rename.old, new = %rename.new, "Migrating metadata for renamed document");
            let mut new_record = old_record.clone();
            new_record.renamed_from = Some(rename.old.clone());
            new_record.renamed_at = Some(now.to_string());
            store.insert(rename.new.clone(), new_record);
            if let Some(old_entry) = store.get_mut(&rename.old) {
                old_entry.renamed_to = Some(rename.new.clone());
            }
        } else {
            info!(old = %rename.old, new = %rename.new, "No metadata for old path, treating as new document");
        }
    }
}

fn batch_prompt(paths: &[&str]) -> String {
    let file_list = paths
        .iter()
        .enumerate()
        .map(|(i, p)| format!("{}. {}", i + 1, p))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"You are a release assistant for a technical documentation library. You will receive git diffs for {num} documentation files. Analyse each diff and decide, per file, both the semantic version bump and a reader-facing changelog summary.

The {num} files are:
{file_list}

Bump rules:
- "minor": content was added, removed, or changed in meaning (new sections, revised methodology, updated figures or tables).
- "patch": typo fixes, formatting, metadata-only or reference-only changes.
- "error": the diff cannot be analysed; explain why in the reason.

Changelog rules:
- One short paragraph of plain text, or an HTML list using only <ul> and <li> tags when several unrelated changes need itemising. Set "format" to "paragraph" or "list" accordingly.
- Write for readers of the published document, in British English. Do not mention git, diffs or commits.

Return ONLY a raw JSON object (no code block, no commentary) with one key per file path, exactly as listed above, covering ALL {num} files:

{{
  "<file path>": {{
    "version": {{"bump": "minor", "reason": "..."}},
    "changelog": {{"format": "paragraph", "summary": "..."}}
  }}
}}

Avoid trailing commas."#,
        num = paths.len(),
        file_list = file_list,
    )
}

fn batch_attachment(batch: &[FileDiff]) -> String {
    let mut input = String::from("=== BATCH ANALYSIS (GIT DIFFS) ===\n\n");
    for file in batch {
        input.push_str(&format!("### FILE: {}\n", file.path));
        input.push_str("=== GIT DIFF ===\n");
        input.push_str(&file.diff);
        input.push_str("\n\n---\n\n");
    }
    input
}

async fn process_batch<M: LanguageModel + ?Sized>(
    model: &M,
    limiter: &mut RateLimiter,
    batch: &[FileDiff],
    batch_label: &str,
    dry_run: bool,
) -> Result<HashMap<String, BumpDecision>> {
    let attachment = batch_attachment(batch);
    let input_tokens = tokens::estimate(&attachment);
    info!(
        batch = batch_label,
        files = batch.len(),
        input_tokens,
        "Analysing batch"
    );

    if dry_run {
        info!(batch = batch_label, "Dry run: skipping API call");
        return Ok(batch
            .iter()
            .map(|f| {
                (
                    f.path.clone(),
                    BumpDecision {
                        version: VersionVerdict {
                            bump: "patch".to_string(),
                            reason: "[DRY RUN] no analysis performed".to_string(),
                        },
                        changelog: ChangelogVerdict {
                            format: "paragraph".to_string(),
                            summary: "[DRY RUN] no analysis performed".to_string(),
                        },
                    },
                )
            })
            .collect());
    }

    limiter.admit(input_tokens).await?;

    let paths: Vec<&str> = batch.iter().map(|f| f.path.as_str()).collect();
    let prompt = batch_prompt(&paths);
    let raw = model.generate(&prompt, &attachment).await?;

    let normalized = normalize_json_response(&raw);
    let results: HashMap<String, BumpDecision> =
        serde_json::from_str(&normalized).map_err(|e| {
            error!(batch = batch_label, error = %e, response = %raw, "Unparseable batch response");
            Error::Model(format!("batch {batch_label}: invalid JSON response: {e}"))
        })?;

    let missing: Vec<String> = paths
        .iter()
        .filter(|p| !results.contains_key(**p))
        .map(|p| (*p).to_string())
        .collect();
    if !missing.is_empty() {
        warn!(
            batch = batch_label,
            missing = missing.len(),
            "Model response omitted files"
        );
        return Err(Error::IncompleteBatch { missing });
    }

    info!(batch = batch_label, files = results.len(), "Batch analysed");
    Ok(results)
}

/// Runs every batch through the model, splitting incomplete batches in half
/// and retrying the halves. A batch that cannot be completed after
/// [`MAX_BATCH_SPLITS`] splits (or that is already a single file) fails the
/// run: partial results must never be silently applied.
pub async fn analyze_batches<M: LanguageModel + ?Sized>(
    model: &M,
    limiter: &mut RateLimiter,
    batches: Vec<Vec<FileDiff>>,
    dry_run: bool,
) -> Result<HashMap<String, BumpDecision>> {
    let total = batches.len();
    if total > 1 {
        info!(batches = total, "Split files into multiple batches");
    }

    let mut all_results = HashMap::new();
    for (i, batch) in batches.into_iter().enumerate() {
        // Worklist of (sub-batch, label, splits remaining); splitting pushes
        // two halves that each retry independently.
        let mut work: Vec<(Vec<FileDiff>, String, u32)> =
            vec![(batch, format!("{}/{}", i + 1, total), MAX_BATCH_SPLITS)];

        while let Some((sub_batch, label, splits_left)) = work.pop() {
            match process_batch(model, limiter, &sub_batch, &label, dry_run).await {
                Ok(results) => all_results.extend(results),
                Err(Error::IncompleteBatch { missing }) => {
                    if splits_left == 0 || sub_batch.len() <= 1 {
                        error!(batch = %label, ?missing, "Batch still incomplete, giving up");
                        return Err(Error::IncompleteBatch { missing });
                    }
                    warn!(batch = %label, "Splitting incomplete batch into halves");
                    let mid = sub_batch.len() / 2;
                    let mut first = sub_batch;
                    let second = first.split_off(mid);
                    work.push((second, format!("{label}b"), splits_left - 1));
                    work.push((first, format!("{label}a"), splits_left - 1));
                }
                Err(e) => return Err(e),
            }
        }
    }

    info!(files = all_results.len(), "All batches completed");
    Ok(all_results)
}

fn today() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// Initialises versions for the first release: no baseline, no model calls,
/// every document starts at `{major}.0.0`.
pub fn initialize_first_release(
    repo_root: &Path,
    files: &[PathBuf],
    versions_path: &Path,
    changelogs_path: &Path,
    docs_prefix: &str,
    dry_run: bool,
) -> Result<usize> {
    info!(files = files.len(), "First release: initialising versions");
    let mut versions = load_versions(versions_path)?;
    let mut changelogs = changelog::load_store(changelogs_path)?;
    let date = today();
    let mut initialised = 0;

    for path in files {
        let key = crate::docs::rel_key(path, repo_root);
        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let major = match extract_major_version(filename) {
            Ok(m) => m,
            Err(e) => {
                error!(path = %key, error = %e, "Skipping document");
                continue;
            }
        };
        let initial_version = format!("{major}.0.0");

        if !dry_run {
            frontmatter::update_file(path, |m| {
                frontmatter::set_str(m, "version", &initial_version);
            })?;
        }

        changelog::merge_entry(
            &mut changelogs,
            &changelog::normalize_key(&key, docs_prefix),
            ChangelogEntry {
                version: initial_version.clone(),
                date: date.clone(),
                summary: "Initial release".to_string(),
            },
        );
        versions.insert(
            key,
            VersionRecord {
                current_version: initial_version,
                major_from_filename: major,
                last_updated: date.clone(),
                last_release_tag: "initial".to_string(),
                last_bump: "initial".to_string(),
                last_bump_reason: "First release".to_string(),
                ..Default::default()
            },
        );
        initialised += 1;
    }

    if !dry_run {
        save_versions(versions_path, &versions)?;
        changelog::save_store(changelogs_path, &changelogs)?;
    }
    info!(initialised, "First release initialisation complete");
    Ok(initialised)
}

/// Runs the full version-and-changelog update against the checkout behind
/// `repo`.
pub async fn run<M: LanguageModel + ?Sized>(
    repo: &GitRepo,
    model: &M,
    config: &PipelineConfig,
    dry_run: bool,
) -> Result<VersioningReport> {
    info!(dry_run, "Starting version & changelog update");
    let repo_root = repo.root();
    let docs_dir = repo_root.join(&config.paths.docs_dir);
    let docs_prefix = format!("{}/", config.paths.docs_dir.to_string_lossy());
    let cache_dir = repo_root.join(&config.paths.cache_dir);
    let versions_path = cache_dir.join(VERSIONS_FILE);
    let changelogs_path = cache_dir.join(CHANGELOGS_FILE);

    let mut report = VersioningReport {
        dry_run,
        ..Default::default()
    };

    let last_tag = repo.last_release_tag()?;

    let Some(last_tag) = last_tag else {
        let files = crate::docs::find_qmd_files(&docs_dir, &config.grouping.excluded_dirs)?;
        report.first_release = true;
        report.processed = initialize_first_release(
            repo_root,
            &files,
            &versions_path,
            &changelogs_path,
            &docs_prefix,
            dry_run,
        )?;
        return Ok(report);
    };

    let (changed_files, renames) = repo.changed_files_with_renames(&last_tag, &docs_prefix)?;
    info!(
        changed = changed_files.len(),
        renames = renames.len(),
        tag = %last_tag,
        "Found changed documents since last release"
    );
    report.renames = renames.len();

    if changed_files.is_empty() {
        info!("No documents changed since last release");
        return Ok(report);
    }

    let mut versions = load_versions(&versions_path)?;
    let date = today();
    if !renames.is_empty() {
        migrate_rename_metadata(&renames, &mut versions, &date);
    }

    // Prepare per-file diffs for batch analysis.
    struct FileInfo {
        major: u32,
        current_version: String,
    }
    let mut diffs: Vec<FileDiff> = Vec::new();
    let mut file_info: HashMap<String, FileInfo> = HashMap::new();

    for path in &changed_files {
        let filename = path.rsplit('/').next().unwrap_or(path);
        let major = match extract_major_version(filename) {
            Ok(m) => m,
            Err(e) => {
                error!(path = %path, error = %e, "Skipping document");
                continue;
            }
        };
        let diff = match repo.diff_for_file(path, &last_tag) {
            Ok(Some(diff)) => diff,
            Ok(None) => {
                debug!(path = %path, "No net changes, skipping");
                continue;
            }
            Err(e) => {
                error!(path = %path, error = %e, "Git error, cannot analyse");
                continue;
            }
        };
        let diff = clean_diff(&diff);
        let diff = truncate_diff(&diff, path, config.versioning.absolute_max_tokens);
        let tokens = tokens::estimate(&diff);

        let current_version = versions
            .get(path)
            .map(|r| r.current_version.clone())
            .unwrap_or_else(|| format!("{major}.0.0"));
        file_info.insert(
            path.clone(),
            FileInfo {
                major,
                current_version,
            },
        );
        diffs.push(FileDiff {
            path: path.clone(),
            diff,
            tokens,
        });
    }

    if diffs.is_empty() {
        info!("No valid documents to process");
        return Ok(report);
    }

    let ordered_paths: Vec<String> = diffs.iter().map(|d| d.path.clone()).collect();
    let batches = pack(
        diffs,
        config.versioning.max_tokens_per_batch,
        config.versioning.max_files_per_batch,
    );

    let mut limiter = RateLimiter::from_config(&config.versioning);
    let decisions = analyze_batches(model, &mut limiter, batches, dry_run).await?;
    report.requests = limiter.requests_today();

    // Apply decisions.
    let mut changelogs = changelog::load_store(&changelogs_path)?;
    info!("Applying version and changelog updates");

    for path in &ordered_paths {
        let info = &file_info[path];
        let Some(decision) = decisions.get(path) else {
            error!(path = %path, "Model analysis missing for document");
            return Err(Error::Model(format!("analysis missing for {path}")));
        };

        if decision.version.bump == "error" {
            error!(path = %path, reason = %decision.version.reason, "Model could not analyse document");
            return Err(Error::Model(format!(
                "{path} cannot be versioned automatically: {}",
                decision.version.reason
            )));
        }

        let summary = changelog::sanitize_summary(&decision.changelog.summary);
        let new_version =
            calculate_new_version(&info.current_version, &decision.version.bump, info.major);

        changelog::merge_entry(
            &mut changelogs,
            &changelog::normalize_key(path, &docs_prefix),
            ChangelogEntry {
                version: new_version.clone(),
                date: date.clone(),
                summary: summary.clone(),
            },
        );
        versions.insert(
            path.clone(),
            VersionRecord {
                current_version: new_version.clone(),
                major_from_filename: info.major,
                last_updated: date.clone(),
                last_release_tag: last_tag.clone(),
                last_bump: decision.version.bump.clone(),
                last_bump_reason: decision.version.reason.clone(),
                last_changelog: Some(summary.chars().take(200).collect()),
                ..versions.get(path).cloned().unwrap_or_default()
            },
        );

        if !dry_run {
            frontmatter::update_file(&repo_root.join(path), |m| {
                frontmatter::set_str(m, "version", &new_version);
            })?;
        }

        info!(
            path,
            from = %info.current_version,
            to = %new_version,
            bump = %decision.version.bump,
            "Updated document version"
        );
        report.processed += 1;
    }

    if !dry_run {
        save_versions(&versions_path, &versions)?;
        changelog::save_store(&changelogs_path, &changelogs)?;
    }

    info!(
        processed = report.processed,
        requests = report.requests,
        "Version & changelog update complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_version_comes_from_filename() {
        assert_eq!(extract_major_version("guide_v2.qmd").unwrap(), 2);
        assert_eq!(extract_major_version("a_b_v10.qmd").unwrap(), 10);
        assert!(extract_major_version("guide.qmd").is_err());
        assert!(extract_major_version("guide_v2.md").is_err());
    }

    #[test]
    fn bumps_apply_semver_rules() {
        assert_eq!(calculate_new_version("1.2.3", "minor", 1), "1.3.0");
        assert_eq!(calculate_new_version("1.2.3", "patch", 1), "1.2.4");
        // unknown bump degrades to patch
        assert_eq!(calculate_new_version("1.2.3", "major", 1), "1.2.4");
    }

    #[test]
    fn filename_major_mismatch_resets() {
        assert_eq!(calculate_new_version("1.2.3", "patch", 2), "2.0.0");
        assert_eq!(calculate_new_version("nonsense", "patch", 3), "3.0.0");
    }

    #[test]
    fn rename_migration_copies_history() {
        let mut store = VersionsStore::new();
        store.insert(
            "DOCS/old_v1.qmd".to_string(),
            VersionRecord {
                current_version: "1.4.2".to_string(),
                major_from_filename: 1,
                ..Default::default()
            },
        );
        let renames = vec![Rename {
            old: "DOCS/old_v1.qmd".to_string(),
            new: "DOCS/products/new_v1.qmd".to_string(),
            similarity: "R097".to_string(),
        }];
        migrate_rename_metadata(&renames, &mut store, "2026-02-01");

        let migrated = &store["DOCS/products/new_v1.qmd"];
        assert_eq!(migrated.current_version, "1.4.2");
        assert_eq!(migrated.renamed_from.as_deref(), Some("DOCS/old_v1.qmd"));
        assert_eq!(migrated.renamed_at.as_deref(), Some("2026-02-01"));
        assert_eq!(
            store["DOCS/old_v1.qmd"].renamed_to.as_deref(),
            Some("DOCS/products/new_v1.qmd")
        );
    }

    #[test]
    fn rename_without_history_is_a_new_document() {
        let mut store = VersionsStore::new();
        let renames = vec![Rename {
            old: "DOCS/unknown_v1.qmd".to_string(),
            new: "DOCS/new_v1.qmd".to_string(),
            similarity: "R100".to_string(),
        }];
        migrate_rename_metadata(&renames, &mut store, "2026-02-01");
        assert!(!store.contains_key("DOCS/new_v1.qmd"));
    }

    #[test]
    fn prompt_lists_every_file() {
        let prompt = batch_prompt(&["DOCS/a_v1.qmd", "DOCS/b_v2.qmd"]);
        assert!(prompt.contains("1. DOCS/a_v1.qmd"));
        assert!(prompt.contains("2. DOCS/b_v2.qmd"));
        assert!(prompt.contains("ALL 2 files"));
    }

    #[test]
    fn attachment_frames_each_diff() {
        let batch = vec![FileDiff {
            path: "DOCS/a_v1.qmd".to_string(),
            diff: "+added line".to_string(),
            tokens: 3,
        }];
        let attachment = batch_attachment(&batch);
        assert!(attachment.contains("### FILE: DOCS/a_v1.qmd"));
        assert!(attachment.contains("+added line"));
    }
}
