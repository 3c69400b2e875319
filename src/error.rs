//! Error type shared by every pipeline stage.
//!
//! The library surfaces one enum so stage orchestration can match on the
//! failure class (git plumbing, model responses, validation) while the CLI
//! boundary wraps everything in `anyhow` for display.

use thiserror::Error;

/// Errors produced by the pipeline stages.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("git {command} failed: {detail}")]
    Git { command: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("frontmatter error in {path}: {detail}")]
    Frontmatter { path: String, detail: String },

    /// Filenames must end in `_vX.qmd`; the major version lives in the name.
    #[error("filename {0} does not carry a major version suffix (_vX.qmd)")]
    MissingMajorVersion(String),

    /// The model returned a parseable response that omitted some of the
    /// files it was asked about. The batch is split and retried on this.
    #[error("model response incomplete: {} file(s) missing", missing.len())]
    IncompleteBatch { missing: Vec<String> },

    #[error("model error: {0}")]
    Model(String),

    #[error("daily request limit reached ({0} requests)")]
    DailyLimitReached(u32),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("validation failed: {0} invalid document(s)")]
    Validation(usize),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
