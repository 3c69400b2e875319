//! Changelog store and "Change Log" section injection.
//!
//! The versioning stage appends `{version, date, summary}` entries to a
//! per-document history in `change_logs.json`; this module owns that store
//! (merge rules, duplicate handling, history cap) and renders the history
//! into each published document as a trailing table.
//!
//! Summaries come back from a language model and may contain HTML list
//! markup. Only `<ul>`/`<li>` survive sanitisation; anything else is
//! flattened to plain text before it can reach the rendered site.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::docs;
use crate::error::Result;

/// One recorded change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub version: String,
    pub date: String,
    pub summary: String,
}

/// Document path (publish-tree relative) -> newest-first history.
pub type ChangelogStore = BTreeMap<String, Vec<ChangelogEntry>>;

/// Histories are capped so a long-lived document cannot grow an unbounded
/// table in its rendered output.
pub const MAX_ENTRIES_PER_DOC: usize = 20;

pub fn load_store(path: &Path) -> Result<ChangelogStore> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(ChangelogStore::new())
    }
}

/// Saves the store atomically (write-then-rename) so a crashed run never
/// leaves a half-written history behind.
pub fn save_store(path: &Path, store: &ChangelogStore) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    fs::write(tmp.path(), serde_json::to_string_pretty(store)?)?;
    tmp.persist(path)
        .map_err(|e| crate::error::Error::Io(e.error))?;
    Ok(())
}

/// Strips the publish-tree prefix (e.g. `DOCS/`) once, so store keys are
/// stable regardless of where the tree was checked out.
pub fn normalize_key(path: &str, docs_prefix: &str) -> String {
    path.strip_prefix(docs_prefix).unwrap_or(path).to_string()
}

/// Merges one entry into a document's history: an entry for an existing
/// version replaces it in place (reruns of the same release are idempotent),
/// a new version is prepended, and the history is capped.
pub fn merge_entry(store: &mut ChangelogStore, key: &str, entry: ChangelogEntry) {
    let history = store.entry(key.to_string()).or_default();
    if let Some(existing) = history.iter_mut().find(|e| e.version == entry.version) {
        debug!(key, version = %entry.version, "Replacing existing changelog entry");
        *existing = entry;
    } else {
        history.insert(0, entry);
    }
    history.truncate(MAX_ENTRIES_PER_DOC);
}

const SUSPICIOUS_PATTERNS: &[&str] = &[
    r"javascript:",
    r"on\w+\s*=",
    r"<script",
    r"<iframe",
    r"<object",
    r"<embed",
    r"<link",
    r"<meta",
    r"<style",
];

fn strip_all_tags(text: &str) -> String {
    Regex::new(r"<[^>]+>")
        .expect("static regex")
        .replace_all(text, "")
        .into_owned()
}

/// Sanitises a model-produced summary down to `<ul>`/`<li>` markup or plain
/// text. Attributes are dropped, unknown tags or anything resembling active
/// content demotes the whole summary to plain text, and unbalanced lists
/// are flattened rather than published broken.
pub fn sanitize_summary(summary: &str) -> String {
    if !summary.trim_start().starts_with("<ul>") {
        return summary.to_string();
    }

    // Drop attributes before inspecting tags.
    let attr_re = Regex::new(r"<(\w+)\s+[^>]*>").expect("static regex");
    let summary = attr_re.replace_all(summary, "<$1>").into_owned();

    let tag_re = Regex::new(r"</?(\w+)>").expect("static regex");
    for cap in tag_re.captures_iter(&summary) {
        let tag = cap[1].to_lowercase();
        if tag != "ul" && tag != "li" {
            return strip_all_tags(&summary);
        }
    }

    for pattern in SUSPICIOUS_PATTERNS {
        let re = Regex::new(&format!("(?i){pattern}")).expect("static pattern");
        if re.is_match(&summary) {
            return strip_all_tags(&summary);
        }
    }

    if summary.matches("<ul>").count() != summary.matches("</ul>").count()
        || summary.matches("<li>").count() != summary.matches("</li>").count()
    {
        return strip_all_tags(&summary);
    }

    summary
}

fn summary_cell(summary: &str) -> String {
    let sanitized = sanitize_summary(summary.trim());
    if sanitized.starts_with("<ul>") {
        let li_re = Regex::new(r"(?s)<li>(.*?)</li>").expect("static regex");
        let items: Vec<String> = li_re
            .captures_iter(&sanitized)
            .map(|c| strip_all_tags(&c[1]).trim().to_string())
            .collect();
        if !items.is_empty() {
            return items.join("<br>");
        }
        return strip_all_tags(&sanitized);
    }
    sanitized.replace('|', r"\|").replace('\n', " ")
}

/// Renders a document's history as the "Change Log" section appended to the
/// published body.
pub fn render_section(entries: &[ChangelogEntry]) -> String {
    let mut out = String::from("\n\n# Change Log {#change-log}\n\n");
    out.push_str("| Date | Version | Summary |\n");
    out.push_str("|------|---------|---------|\n");
    for entry in entries {
        out.push_str(&format!(
            "| {} | {} | {} |\n",
            entry.date,
            entry.version,
            summary_cell(&entry.summary)
        ));
    }
    out
}

/// Outcome of an injection run.
#[derive(Debug, Default)]
pub struct InjectReport {
    pub injected: usize,
    pub without_history: usize,
}

/// Appends the rendered history to every published document that has one.
///
/// `path_mapping` resolves a document's current publish path to the path
/// its history was recorded under (documents move when their category
/// changes); paths absent from the mapping are looked up as-is.
pub fn inject(
    docs_dir: &Path,
    excluded_dirs: &[String],
    store: &ChangelogStore,
    path_mapping: &BTreeMap<String, String>,
) -> Result<InjectReport> {
    let mut report = InjectReport::default();

    for doc_path in docs::find_qmd_files(docs_dir, excluded_dirs)? {
        let rel = docs::rel_key(&doc_path, docs_dir);
        let history_key = path_mapping.get(&rel).unwrap_or(&rel);

        let Some(entries) = store.get(history_key).filter(|e| !e.is_empty()) else {
            report.without_history += 1;
            continue;
        };

        let content = fs::read_to_string(&doc_path)?;
        if content.contains("# Change Log {#change-log}") {
            debug!(path = %rel, "Change log already present, skipping");
            continue;
        }
        fs::write(&doc_path, format!("{}{}", content, render_section(entries)))?;
        report.injected += 1;
    }

    info!(
        injected = report.injected,
        without_history = report.without_history,
        "Changelog injection complete"
    );
    Ok(report)
}

/// Loads the regrouped-path -> original-path mapping written by grouping.
pub fn load_path_mapping(path: &Path) -> BTreeMap<String, String> {
    // A corrupt or missing mapping file degrades to identity lookups.
    fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}
