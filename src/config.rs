use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

/// The top-level pipeline configuration.
///
/// Everything here is static, non-secret build configuration; API keys are
/// read from the environment by the clients that need them (see
/// [`crate::llm::GeminiClient::new_from_env`] and
/// [`crate::convert::ChatdocClient::new_from_env`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub grouping: GroupingConfig,
    #[serde(default)]
    pub validate: ValidateConfig,
    #[serde(default)]
    pub enrich: EnrichConfig,
    #[serde(default)]
    pub versioning: VersioningConfig,
    #[serde(default)]
    pub redirects: RedirectsConfig,
    #[serde(default)]
    pub convert: ConvertConfig,
}

impl PipelineConfig {
    pub fn trace_loaded(&self) {
        info!(
            source_dir = %self.paths.source_dir.display(),
            docs_dir = %self.paths.docs_dir.display(),
            cache_dir = %self.paths.cache_dir.display(),
            "Loaded pipeline config"
        );
    }
}

/// Directory layout of the corpus checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Tree the authors commit to, organised per project.
    pub source_dir: PathBuf,
    /// Regrouped publish tree the site is rendered from.
    pub docs_dir: PathBuf,
    /// State files shared between stages (versions, changelogs, caches).
    pub cache_dir: PathBuf,
    /// Consolidated bibliography directory.
    pub bibliography_dir: PathBuf,
    /// Rendered site output (redirect pages land here).
    pub site_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("origin_DOCS"),
            docs_dir: PathBuf::from("DOCS"),
            cache_dir: PathBuf::from(".llm_cache"),
            bibliography_dir: PathBuf::from("bibliography"),
            site_dir: PathBuf::from("DOCS/_site"),
        }
    }
}

/// Controls the category regrouping stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Directory names excluded from document discovery anywhere in the tree.
    pub excluded_dirs: Vec<String>,
    /// Category name -> target directory. Unmapped categories use their own
    /// name; documents without a category land in `uncategorized`.
    pub category_map: BTreeMap<String, String>,
    /// Site configuration files copied verbatim from the source root.
    pub site_config_files: Vec<String>,
    /// Persistent mapping of secret documents to their random base names.
    pub secret_map_file: PathBuf,
    /// Regrouped-path -> original-path mapping consumed by changelog injection.
    pub path_mapping_file: PathBuf,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        let mut category_map = BTreeMap::new();
        category_map.insert("guidelines".to_string(), "guidelines".to_string());
        category_map.insert("products".to_string(), "products".to_string());
        Self {
            excluded_dirs: vec![
                "templates".to_string(),
                "theme".to_string(),
                "includes".to_string(),
            ],
            category_map,
            site_config_files: vec![
                "_quarto.yml".to_string(),
                "_quarto-index.yml".to_string(),
                "_quarto-no-headers.yml".to_string(),
            ],
            secret_map_file: PathBuf::from("secret_doc_map.json"),
            path_mapping_file: PathBuf::from("path_mapping.json"),
        }
    }
}

/// Frontmatter validation rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateConfig {
    pub allowed_categories: Vec<String>,
}

impl Default for ValidateConfig {
    fn default() -> Self {
        Self {
            allowed_categories: vec![
                "guidelines".to_string(),
                "products".to_string(),
                "uncategorized".to_string(),
            ],
        }
    }
}

/// Controls the introduction/keyword enrichment stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichConfig {
    pub model: String,
    /// Input tokens the stage may send in one run; documents past the budget
    /// are skipped and picked up on the next run.
    pub token_budget: u64,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            token_budget: 950_000,
        }
    }
}

/// Controls the versioning-and-changelog orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersioningConfig {
    pub model: String,
    /// Requests per minute granted by the provider.
    pub rpm_limit: u32,
    /// Input tokens per minute granted by the provider.
    pub tpm_limit: u64,
    /// Requests per day granted by the provider. Exhausting this aborts.
    pub rpd_limit: u32,
    /// Primary batch constraint (input tokens).
    pub max_tokens_per_batch: u64,
    /// Secondary batch constraint (response-size safety).
    pub max_files_per_batch: usize,
    /// Hard ceiling per diff; larger diffs are truncated head+tail.
    pub absolute_max_tokens: u64,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            rpm_limit: 30,
            tpm_limit: 1_000_000,
            rpd_limit: 200,
            max_tokens_per_batch: 600_000,
            max_files_per_batch: 15,
            absolute_max_tokens: 800_000,
        }
    }
}

/// Controls URL-mapping bookkeeping and redirect emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectsConfig {
    /// Canonical site domain, used for `rel=canonical` in redirect pages.
    pub domain: String,
    pub mapping_file: PathBuf,
    /// Directory names ignored while scanning the source tree for documents.
    pub excluded_dirs: Vec<String>,
}

impl Default for RedirectsConfig {
    fn default() -> Self {
        Self {
            domain: "https://library.land.copernicus.eu".to_string(),
            mapping_file: PathBuf::from("url_mapping.json"),
            excluded_dirs: vec![
                "_meta".to_string(),
                "_site".to_string(),
                ".quarto".to_string(),
                "assets".to_string(),
            ],
        }
    }
}

/// Controls PDF-to-QMD conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertConfig {
    pub base_url: String,
    /// Seconds between polls while the vendor parses the upload.
    pub poll_interval_secs: u64,
    /// Give up waiting for a single document after this many seconds.
    pub max_wait_secs: u64,
    /// Concurrent conversions when several PDFs are submitted at once.
    pub concurrency: usize,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.chatdoc.com/api/v2".to_string(),
            poll_interval_secs: 15,
            max_wait_secs: 300,
            concurrency: 4,
        }
    }
}
