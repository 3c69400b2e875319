//! URL-mapping bookkeeping and redirect emission.
//!
//! Every document's canonical html/pdf URL is derived from its category and
//! slug. When a document changes category its URL moves; this module records
//! the move as a redirect, flattens chains of historical moves so old links
//! land directly on the current location, prunes mappings for deleted
//! documents, and emits the static artefacts the site serves: one redirect
//! page per moved URL, a `redirect_map.json` for the client-side fallback,
//! and a 404 page that consults it.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::docs;
use crate::error::{Error, Result};
use crate::frontmatter;

const REDIRECT_PREFIX: &str = "redirect:";

const REDIRECT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Page Moved - Redirecting...</title>

    <!-- Immediate redirect via meta refresh -->
    <meta http-equiv="refresh" content="0; url=/{target_url}">

    <!-- Canonical URL for SEO -->
    <link rel="canonical" href="{canonical_url}">

    <!-- JavaScript redirect (faster than meta refresh) -->
    <script>
        window.location.replace("/{target_url}");
    </script>

</head>
<body>
    <div class="redirect-message">
        <h2>Page Moved</h2>
        <p>This page has moved to a new location.</p>
        <p>If you are not redirected automatically, <a href="/{target_url}">click here</a>.</p>
    </div>
</body>
</html>"#;

const NOT_FOUND_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Page Not Found</title>
</head>
<body>
    <div class="error-message">
        <h1>404 - Page Not Found</h1>
        <p>The page you're looking for might have moved to a new category.</p>
        <p>Checking for redirects...</p>
        <div id="redirect-status"></div>
        <p><a href="/">Return to Home</a></p>
    </div>

    <script>
        fetch('/redirect_map.json')
            .then(response => response.json())
            .then(redirectMap => {
                const currentPath = window.location.pathname.replace(/^\//, '');
                if (redirectMap[currentPath]) {
                    document.getElementById('redirect-status').innerHTML =
                        '<p>Found redirect! Redirecting to new location...</p>';
                    setTimeout(() => {
                        window.location.replace('/' + redirectMap[currentPath]);
                    }, 2000);
                } else {
                    document.getElementById('redirect-status').innerHTML =
                        '<p>No redirect found for this URL.</p>';
                }
            })
            .catch(() => {
                document.getElementById('redirect-status').innerHTML =
                    '<p>Could not check for redirects.</p>';
            });
    </script>
</body>
</html>"#;

/// Persistent URL mapping.
///
/// Keys are `<rel>.qmd` for html URLs, `<rel>.qmd:pdf` for pdf URLs and
/// `redirect:<old-url>` for recorded moves.
pub struct UrlMapper {
    mapping_file: PathBuf,
    pub mappings: BTreeMap<String, String>,
}

impl UrlMapper {
    pub fn load(mapping_file: impl Into<PathBuf>) -> Result<Self> {
        let mapping_file = mapping_file.into();
        let mappings = if mapping_file.exists() {
            serde_json::from_str(&fs::read_to_string(&mapping_file)?)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            mapping_file,
            mappings,
        })
    }

    pub fn save(&self) -> Result<()> {
        let parent = self.mapping_file.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let tmp = tempfile::NamedTempFile::new_in(parent)?;
        fs::write(tmp.path(), serde_json::to_string_pretty(&self.mappings)?)?;
        tmp.persist(&self.mapping_file).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn url_paths(category: &str, filename: &str) -> (String, String) {
        let slug = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(filename);
        (
            format!("{category}/{slug}.html"),
            format!("{category}/{slug}.pdf"),
        )
    }

    fn record_move(&mut self, key: &str, new_url: &str) {
        if let Some(old_url) = self.mappings.get(key).cloned() {
            if old_url != new_url {
                info!(old = %old_url, new = %new_url, "URL moved, recording redirect");
                self.mappings
                    .insert(format!("{REDIRECT_PREFIX}{old_url}"), new_url.to_string());
            }
        }
        self.mappings.insert(key.to_string(), new_url.to_string());
    }

    /// Rescans the source tree and refreshes every document's canonical
    /// URLs, recording redirects for any that moved. Returns the number of
    /// documents processed.
    pub fn update_mappings(&mut self, source_dir: &Path, excluded_dirs: &[String]) -> Result<usize> {
        let mut processed = 0;
        for qmd_file in docs::find_qmd_files(source_dir, excluded_dirs)? {
            let rel = docs::rel_key(&qmd_file, source_dir);
            let category = match frontmatter::read_mapping(&qmd_file) {
                Ok(mapping) => frontmatter::get_str(&mapping, "category")
                    .unwrap_or_else(|| "uncategorized".to_string()),
                Err(e) => {
                    warn!(path = %rel, error = %e, "Could not read frontmatter, skipping");
                    continue;
                }
            };
            let filename = qmd_file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            let (html_url, pdf_url) = Self::url_paths(&category, filename);

            self.record_move(&rel, &html_url);
            self.record_move(&format!("{rel}:pdf"), &pdf_url);
            processed += 1;
        }
        Ok(processed)
    }

    fn current_urls(&self) -> HashSet<&String> {
        self.mappings
            .iter()
            .filter(|(k, _)| !k.starts_with(REDIRECT_PREFIX))
            .map(|(_, v)| v)
            .collect()
    }

    fn final_destination(&self, url: &str) -> String {
        let current = self.current_urls();
        let mut seen = HashSet::new();
        let mut at = url.to_string();
        loop {
            if !seen.insert(at.clone()) {
                warn!(url, "Circular redirect detected");
                return at;
            }
            if current.contains(&at) {
                return at;
            }
            match self.mappings.get(&format!("{REDIRECT_PREFIX}{at}")) {
                Some(next) => at = next.clone(),
                None => return at,
            }
        }
    }

    /// Rewrites every redirect to point at its final destination so old
    /// links never hop through intermediate moves. Returns how many were
    /// rewritten.
    pub fn optimize_redirect_chains(&mut self) -> usize {
        let redirect_keys: Vec<String> = self
            .mappings
            .keys()
            .filter(|k| k.starts_with(REDIRECT_PREFIX))
            .cloned()
            .collect();

        let mut optimized = 0;
        for key in redirect_keys {
            let target = self.mappings[&key].clone();
            let destination = self.final_destination(&target);
            if destination != target {
                info!(redirect = %key, from = %target, to = %destination, "Flattened redirect chain");
                self.mappings.insert(key, destination);
                optimized += 1;
            }
        }
        optimized
    }

    /// Drops mappings for documents that no longer exist in the source tree.
    pub fn cleanup_missing_files(
        &mut self,
        source_dir: &Path,
        excluded_dirs: &[String],
    ) -> Result<usize> {
        let existing: HashSet<String> = docs::find_qmd_files(source_dir, excluded_dirs)?
            .iter()
            .map(|p| docs::rel_key(p, source_dir))
            .collect();

        let stale: Vec<String> = self
            .mappings
            .keys()
            .filter(|k| !k.starts_with(REDIRECT_PREFIX))
            .map(|k| k.trim_end_matches(":pdf").to_string())
            .filter(|source| source.ends_with(".qmd") && !existing.contains(source))
            .collect();

        let mut removed = 0;
        for source in stale {
            for suffix in ["", ":pdf"] {
                if self.mappings.remove(&format!("{source}{suffix}")).is_some() {
                    removed += 1;
                }
            }
            info!(source = %source, "Removed mapping for missing document");
        }
        Ok(removed)
    }

    /// Drops redirects whose target is no longer a live URL.
    pub fn cleanup_dead_redirects(&mut self) -> usize {
        let valid: HashSet<String> = self.current_urls().into_iter().cloned().collect();
        let dead: Vec<String> = self
            .mappings
            .iter()
            .filter(|(k, v)| k.starts_with(REDIRECT_PREFIX) && !valid.contains(*v))
            .map(|(k, _)| k.clone())
            .collect();

        for key in &dead {
            info!(redirect = %key, "Removed dead redirect");
            self.mappings.remove(key);
        }
        dead.len()
    }

    /// Writes a static redirect page per moved html URL under `site_dir`.
    pub fn write_redirect_pages(&self, site_dir: &Path, domain: &str) -> Result<usize> {
        let mut written = 0;
        for (key, target_url) in &self.mappings {
            let Some(old_url) = key.strip_prefix(REDIRECT_PREFIX) else {
                continue;
            };
            if !target_url.ends_with(".html") {
                continue;
            }
            let page_path = site_dir.join(old_url);
            if let Some(parent) = page_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let canonical_url = format!("{}/{}", domain.trim_end_matches('/'), target_url);
            let html = REDIRECT_TEMPLATE
                .replace("{target_url}", target_url)
                .replace("{canonical_url}", &canonical_url);
            fs::write(&page_path, html)?;
            info!(old = %old_url, new = %target_url, "Created redirect page");
            written += 1;
        }
        Ok(written)
    }

    /// Writes `redirect_map.json` (old url -> new url) for the client-side
    /// fallback and returns the map.
    pub fn write_redirect_map(&self, out_dir: &Path) -> Result<BTreeMap<String, String>> {
        let map: BTreeMap<String, String> = self
            .mappings
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(REDIRECT_PREFIX)
                    .map(|old| (old.to_string(), v.clone()))
            })
            .collect();

        fs::create_dir_all(out_dir)?;
        fs::write(
            out_dir.join("redirect_map.json"),
            serde_json::to_string_pretty(&map)?,
        )?;
        Ok(map)
    }

    /// Writes the fallback 404 page that consults `redirect_map.json`.
    pub fn write_404_page(&self, out_dir: &Path) -> Result<()> {
        fs::create_dir_all(out_dir)?;
        fs::write(out_dir.join("404.html"), NOT_FOUND_TEMPLATE)?;
        Ok(())
    }
}

/// Outcome of a redirects run.
#[derive(Debug, Default)]
pub struct RedirectsReport {
    pub processed: usize,
    pub optimized: usize,
    pub removed_files: usize,
    pub removed_redirects: usize,
    pub redirect_pages: usize,
    pub map_entries: usize,
}

/// Runs the full redirects stage: refresh mappings, flatten chains, clean
/// up, emit artefacts.
pub fn run(config: &PipelineConfig) -> Result<RedirectsReport> {
    let source_dir = &config.paths.source_dir;
    let mapping_path = if config.redirects.mapping_file.is_absolute() {
        config.redirects.mapping_file.clone()
    } else {
        config.paths.cache_dir.join(&config.redirects.mapping_file)
    };

    let mut mapper = UrlMapper::load(mapping_path)?;
    let mut report = RedirectsReport::default();

    report.processed = mapper.update_mappings(source_dir, &config.redirects.excluded_dirs)?;
    report.optimized = mapper.optimize_redirect_chains();

    // Cleanup runs after redirect creation so a deleted document's last
    // known redirect survives exactly one generation, then dies with its
    // target.
    report.removed_files =
        mapper.cleanup_missing_files(source_dir, &config.redirects.excluded_dirs)?;
    report.removed_redirects = mapper.cleanup_dead_redirects();
    mapper.save()?;

    report.redirect_pages =
        mapper.write_redirect_pages(&config.paths.site_dir, &config.redirects.domain)?;
    report.map_entries = mapper.write_redirect_map(&config.paths.site_dir)?.len();
    mapper.write_404_page(&config.paths.site_dir)?;

    info!(
        processed = report.processed,
        redirect_pages = report.redirect_pages,
        map_entries = report.map_entries,
        "Redirects stage complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper_with(entries: &[(&str, &str)]) -> UrlMapper {
        UrlMapper {
            mapping_file: PathBuf::from("unused.json"),
            mappings: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn url_paths_derive_from_category_and_stem() {
        let (html, pdf) = UrlMapper::url_paths("products", "atlas_v2.qmd");
        assert_eq!(html, "products/atlas_v2.html");
        assert_eq!(pdf, "products/atlas_v2.pdf");
    }

    #[test]
    fn moves_record_redirects() {
        let mut mapper = mapper_with(&[("proj/a_v1.qmd", "guidelines/a_v1.html")]);
        mapper.record_move("proj/a_v1.qmd", "products/a_v1.html");
        assert_eq!(mapper.mappings["proj/a_v1.qmd"], "products/a_v1.html");
        assert_eq!(
            mapper.mappings["redirect:guidelines/a_v1.html"],
            "products/a_v1.html"
        );
    }

    #[test]
    fn unchanged_urls_do_not_create_redirects() {
        let mut mapper = mapper_with(&[("proj/a_v1.qmd", "products/a_v1.html")]);
        mapper.record_move("proj/a_v1.qmd", "products/a_v1.html");
        assert_eq!(mapper.mappings.len(), 1);
    }

    #[test]
    fn chains_flatten_to_final_destination() {
        let mut mapper = mapper_with(&[
            ("proj/a_v1.qmd", "c/a_v1.html"),
            ("redirect:a/a_v1.html", "b/a_v1.html"),
            ("redirect:b/a_v1.html", "c/a_v1.html"),
        ]);
        let optimized = mapper.optimize_redirect_chains();
        assert_eq!(optimized, 1);
        assert_eq!(mapper.mappings["redirect:a/a_v1.html"], "c/a_v1.html");
    }

    #[test]
    fn circular_redirects_terminate() {
        let mut mapper = mapper_with(&[
            ("redirect:x.html", "y.html"),
            ("redirect:y.html", "x.html"),
        ]);
        // Must not loop forever; the cycle is left as-is.
        mapper.optimize_redirect_chains();
    }

    #[test]
    fn dead_redirects_are_removed() {
        let mut mapper = mapper_with(&[
            ("proj/a_v1.qmd", "products/a_v1.html"),
            ("redirect:old/a_v1.html", "products/a_v1.html"),
            ("redirect:old/gone.html", "nowhere/gone.html"),
        ]);
        let removed = mapper.cleanup_dead_redirects();
        assert_eq!(removed, 1);
        assert!(mapper.mappings.contains_key("redirect:old/a_v1.html"));
        assert!(!mapper.mappings.contains_key("redirect:old/gone.html"));
    }

    #[test]
    fn missing_files_lose_both_mappings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("kept_v1.qmd"),
            "---\ncategory: products\n---\n",
        )
        .unwrap();

        let mut mapper = mapper_with(&[
            ("kept_v1.qmd", "products/kept_v1.html"),
            ("kept_v1.qmd:pdf", "products/kept_v1.pdf"),
            ("gone_v1.qmd", "products/gone_v1.html"),
            ("gone_v1.qmd:pdf", "products/gone_v1.pdf"),
        ]);
        let removed = mapper.cleanup_missing_files(dir.path(), &[]).unwrap();
        assert_eq!(removed, 2);
        assert!(mapper.mappings.contains_key("kept_v1.qmd"));
        assert!(!mapper.mappings.contains_key("gone_v1.qmd"));
        assert!(!mapper.mappings.contains_key("gone_v1.qmd:pdf"));
    }

    #[test]
    fn redirect_pages_only_cover_html_targets() {
        let dir = tempfile::tempdir().unwrap();
        let mapper = mapper_with(&[
            ("proj/a_v1.qmd", "products/a_v1.html"),
            ("redirect:old/a_v1.html", "products/a_v1.html"),
            ("redirect:old/a_v1.pdf", "products/a_v1.pdf"),
        ]);
        let written = mapper
            .write_redirect_pages(dir.path(), "https://docs.example.org")
            .unwrap();
        assert_eq!(written, 1);

        let page = std::fs::read_to_string(dir.path().join("old/a_v1.html")).unwrap();
        assert!(page.contains("url=/products/a_v1.html"));
        assert!(page.contains("https://docs.example.org/products/a_v1.html"));
    }
}
