//! Regroups the authored source tree into the publish tree.
//!
//! Authors commit documents per project; the site renders them per
//! category. This stage copies each document (and its `-media` directory)
//! into the directory its frontmatter category maps to, prefixing file
//! names with the project so parallel projects cannot collide, and
//! rewrites in-document media references to match. Secret documents get a
//! persistent random base name instead, so their URLs are unguessable but
//! stable across rebuilds.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::docs;
use crate::error::Result;
use crate::frontmatter;

/// One secret document's persistent identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretMapping {
    pub source: String,
    pub base: String,
    pub url: String,
}

/// Persistent map of secret source documents to their random output names.
/// Never publish this file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SecretMap {
    #[serde(default)]
    pub mappings: Vec<SecretMapping>,
}

impl SecretMap {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn get(&self, source: &str) -> Option<&SecretMapping> {
        self.mappings.iter().find(|m| m.source == source)
    }

    /// Returns the existing mapping for `source` or mints a new one.
    /// The boolean reports whether the map changed.
    pub fn get_or_insert(&mut self, source: &str) -> (SecretMapping, bool) {
        if let Some(existing) = self.get(source) {
            return (existing.clone(), false);
        }
        let base = random_base();
        let mapping = SecretMapping {
            source: source.to_string(),
            base: base.clone(),
            url: format!("/{base}.html"),
        };
        self.mappings.push(mapping.clone());
        (mapping, true)
    }
}

/// 64 lowercase hex characters; long enough that the URL is unguessable.
fn random_base() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Outcome of a grouping run.
#[derive(Debug, Default)]
pub struct GroupingReport {
    pub grouped: usize,
    pub secret: usize,
    pub media_dirs: usize,
    pub bibliographies: usize,
    pub config_files: usize,
}

/// Runs the full regrouping stage.
pub fn run(config: &PipelineConfig) -> Result<GroupingReport> {
    let source_dir = &config.paths.source_dir;
    let docs_dir = &config.paths.docs_dir;
    let mut report = GroupingReport::default();

    report.bibliographies = update_bibliography_paths(
        source_dir,
        &config.paths.bibliography_dir,
        &config.grouping.excluded_dirs,
    )?;

    fs::create_dir_all(docs_dir)?;

    let secret_map_path = resolve_state_path(&config.paths.cache_dir, &config.grouping.secret_map_file);
    let mut secret_map = SecretMap::load(&secret_map_path)?;
    let mut secret_map_updated = false;
    let mut path_mapping: BTreeMap<String, String> = BTreeMap::new();

    let qmd_files = docs::find_qmd_files(source_dir, &config.grouping.excluded_dirs)?;
    if qmd_files.is_empty() {
        warn!(source_dir = %source_dir.display(), "No QMD files found to group");
    } else {
        info!(count = qmd_files.len(), "Found QMD files to group");
    }

    for qmd_file in &qmd_files {
        let rel_source = docs::rel_key(qmd_file, source_dir);
        let category = extract_category(qmd_file);
        let project = rel_source.split('/').next().filter(|_| rel_source.contains('/'));

        if category.as_deref() == Some("secret") {
            let (mapping, inserted) = secret_map.get_or_insert(&rel_source);
            if inserted {
                secret_map_updated = true;
                info!(source = %rel_source, base = %mapping.base, "Assigned new random base for secret document");
            }
            copy_secret_doc(qmd_file, docs_dir, &mapping.base)?;
            path_mapping.insert(format!("secret/{}.qmd", mapping.base), rel_source.clone());
            report.secret += 1;
        } else {
            let target_directory = directory_for_category(category.as_deref(), &config.grouping.category_map);
            let target_folder = docs_dir.join(&target_directory);
            fs::create_dir_all(&target_folder)?;

            let file_name = qmd_file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            let prefix = project.map(|p| format!("{p}_")).unwrap_or_default();
            let target_file = target_folder.join(format!("{prefix}{file_name}"));
            fs::copy(qmd_file, &target_file)?;

            let stem = qmd_file
                .file_stem()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            if copy_media_dir(qmd_file, &target_folder, stem, &format!("{prefix}{stem}"))? {
                report.media_dirs += 1;
            }
            if !prefix.is_empty() {
                rewrite_media_references(&target_file, stem, &format!("{prefix}{stem}"))?;
            }

            path_mapping.insert(
                format!("{target_directory}/{prefix}{file_name}"),
                rel_source.clone(),
            );
            debug!(
                source = %rel_source,
                target = %target_file.display(),
                category = category.as_deref().unwrap_or("<none>"),
                "Copied document"
            );
            report.grouped += 1;
        }
    }

    copy_excluded_dirs(source_dir, docs_dir, &config.grouping.excluded_dirs)?;
    report.config_files =
        copy_site_config_files(source_dir, docs_dir, &config.grouping.site_config_files)?;

    if secret_map_updated {
        secret_map.save(&secret_map_path)?;
        info!(path = %secret_map_path.display(), "Updated secret document map");
    }

    let mapping_path = resolve_state_path(&config.paths.cache_dir, &config.grouping.path_mapping_file);
    if let Some(parent) = mapping_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&mapping_path, serde_json::to_string_pretty(&path_mapping)?)?;
    info!(path = %mapping_path.display(), entries = path_mapping.len(), "Wrote path mapping");

    info!(
        grouped = report.grouped,
        secret = report.secret,
        media_dirs = report.media_dirs,
        "Grouping complete"
    );
    Ok(report)
}

/// State files given as relative paths live under the cache directory.
fn resolve_state_path(cache_dir: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        cache_dir.join(file)
    }
}

fn extract_category(path: &Path) -> Option<String> {
    match frontmatter::read_mapping(path) {
        Ok(mapping) => frontmatter::get_str(&mapping, "category"),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Could not read frontmatter");
            None
        }
    }
}

fn directory_for_category(category: Option<&str>, map: &BTreeMap<String, String>) -> String {
    match category {
        None => "uncategorized".to_string(),
        Some(cat) => map.get(cat).cloned().unwrap_or_else(|| cat.to_string()),
    }
}

fn copy_secret_doc(qmd_file: &Path, docs_dir: &Path, base: &str) -> Result<()> {
    let secret_dir = docs_dir.join("secret");
    fs::create_dir_all(&secret_dir)?;
    let target_file = secret_dir.join(format!("{base}.qmd"));
    fs::copy(qmd_file, &target_file)?;

    let stem = qmd_file
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if copy_media_dir(qmd_file, &secret_dir, stem, base)? {
        debug!(base, "Copied and renamed secret media directory");
    }
    rewrite_media_references(&target_file, stem, base)?;
    Ok(())
}

/// Copies `<stem>-media/` next to the document when it exists, renaming it
/// to `<new_base>-media/`. Returns whether a media directory was copied.
fn copy_media_dir(qmd_file: &Path, target_folder: &Path, stem: &str, new_base: &str) -> Result<bool> {
    let source_media = match qmd_file.parent() {
        Some(parent) => parent.join(format!("{stem}-media")),
        None => return Ok(false),
    };
    if !source_media.is_dir() {
        return Ok(false);
    }
    let target_media = target_folder.join(format!("{new_base}-media"));
    if target_media.exists() {
        fs::remove_dir_all(&target_media)?;
    }
    copy_dir_recursive(&source_media, &target_media)?;
    debug!(target = %target_media.display(), "Copied media directory");
    Ok(true)
}

/// Rewrites `<old_stem>-media/` references inside a copied document to the
/// renamed media directory.
fn rewrite_media_references(target_file: &Path, old_stem: &str, new_base: &str) -> Result<()> {
    if old_stem == new_base {
        return Ok(());
    }
    let content = fs::read_to_string(target_file)?;
    let old_media = format!("{old_stem}-media/");
    let new_media = format!("{new_base}-media/");
    if content.contains(&old_media) {
        fs::write(target_file, content.replace(&old_media, &new_media))?;
        debug!(file = %target_file.display(), "Rewrote media references");
    }
    Ok(())
}

/// Excluded directories (themes, templates, includes) are passed through
/// verbatim so the renderer still finds them in the publish tree.
fn copy_excluded_dirs(source_dir: &Path, docs_dir: &Path, excluded_dirs: &[String]) -> Result<()> {
    for excluded in excluded_dirs {
        let src = source_dir.join(excluded);
        if src.is_dir() {
            let dst = docs_dir.join(excluded);
            if dst.exists() {
                fs::remove_dir_all(&dst)?;
            }
            copy_dir_recursive(&src, &dst)?;
        }
    }
    Ok(())
}

fn copy_site_config_files(source_dir: &Path, docs_dir: &Path, files: &[String]) -> Result<usize> {
    fs::create_dir_all(docs_dir)?;
    let mut copied = 0;
    for file in files {
        let src = source_dir.join(file);
        if src.is_file() {
            fs::copy(&src, docs_dir.join(file))?;
            copied += 1;
        } else {
            warn!(file = %file, source_dir = %source_dir.display(), "Site config file not found");
        }
    }
    Ok(copied)
}

/// Moves each project's `.bib` file into the shared bibliography directory
/// and rewrites `bibliography:` frontmatter references to point there.
/// Documents without a bibliography field are left alone.
fn update_bibliography_paths(
    source_dir: &Path,
    bibliography_dir: &Path,
    excluded_dirs: &[String],
) -> Result<usize> {
    if !source_dir.is_dir() {
        return Ok(0);
    }
    fs::create_dir_all(bibliography_dir)?;
    let bib_dir_name = bibliography_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut moved = 0;
    for entry in fs::read_dir(source_dir)? {
        let project_dir = entry?.path();
        if !project_dir.is_dir() {
            continue;
        }
        let project_name = project_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        if excluded_dirs.iter().any(|ex| *ex == project_name) {
            continue;
        }

        let mut bib_files: Vec<PathBuf> = fs::read_dir(&project_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("bib"))
            .collect();
        bib_files.sort();
        if bib_files.is_empty() {
            continue;
        }
        if bib_files.len() > 1 {
            warn!(project = %project_name, count = bib_files.len(), "Multiple .bib files, using the first");
        }

        let new_bib_name = format!("{project_name}.bib");
        let new_reference = format!("../../{bib_dir_name}/{new_bib_name}");

        for qmd in docs::find_qmd_files(&project_dir, excluded_dirs)? {
            frontmatter::update_file(&qmd, |mapping| {
                if frontmatter::get_str(mapping, "bibliography").is_some() {
                    frontmatter::set_str(mapping, "bibliography", &new_reference);
                }
            })?;
        }

        fs::copy(&bib_files[0], bibliography_dir.join(&new_bib_name))?;
        info!(project = %project_name, bib = %new_bib_name, "Consolidated bibliography");
        moved += 1;
    }
    Ok(moved)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if path.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_base_is_64_lowercase_chars() {
        let base = random_base();
        assert_eq!(base.len(), 64);
        assert!(base.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn secret_map_reuses_existing_bases() {
        let mut map = SecretMap::default();
        let (first, inserted) = map.get_or_insert("proj/hidden_v1.qmd");
        assert!(inserted);
        let (second, inserted_again) = map.get_or_insert("proj/hidden_v1.qmd");
        assert!(!inserted_again);
        assert_eq!(first, second);
    }

    #[test]
    fn unmapped_categories_fall_back_to_their_own_name() {
        let mut map = BTreeMap::new();
        map.insert("products".to_string(), "products".to_string());
        assert_eq!(directory_for_category(Some("products"), &map), "products");
        assert_eq!(directory_for_category(Some("reference"), &map), "reference");
        assert_eq!(directory_for_category(None, &map), "uncategorized");
    }
}
