//! PDF-to-QMD conversion through a vendor parsing API.
//!
//! Uploads a PDF, waits for the vendor to parse it, downloads the parsed
//! markdown and post-processes it into a publishable QMD: inline base64
//! images are extracted into a `<stem>-media/` directory (deduplicated by
//! content hash), references are rewritten, and a YAML header is added when
//! the parser did not produce one. The raw download is kept as a `.bak`
//! next to the result.
//!
//! The vendor API sits behind the [`PdfParser`] trait so tests can script
//! upload/poll sequences without a network.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::config::ConvertConfig;
use crate::error::{Error, Result};

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

/// Result of polling the parser for a document.
#[derive(Debug, Clone)]
pub enum ParseStatus {
    /// Parsing finished; here is the markdown.
    Ready(String),
    /// Still parsing, poll again later.
    Pending,
}

/// Contract for the vendor PDF parsing service.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait PdfParser: Send + Sync {
    /// Upload a PDF for parsing; returns the vendor's upload id.
    async fn upload(&self, pdf_path: &Path) -> Result<String>;

    /// Fetch the parsed markdown for an earlier upload.
    async fn fetch_markdown(&self, upload_id: &str) -> Result<ParseStatus>;
}

#[derive(Deserialize)]
struct UploadResponse {
    status: String,
    #[serde(default)]
    data: Option<UploadData>,
}

#[derive(Deserialize)]
struct UploadData {
    id: serde_json::Value,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    detail: String,
}

/// Client for the ChatDOC parsing API.
pub struct ChatdocClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ChatdocClient {
    /// Builds a client from the `CHATDOC_API_KEY` environment variable,
    /// loading `.env` first if present.
    pub fn new_from_env(config: &ConvertConfig) -> Result<Self> {
        dotenvy::dotenv().ok();
        let token = std::env::var("CHATDOC_API_KEY")
            .map_err(|_| Error::Config("CHATDOC_API_KEY environment variable not set".into()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl PdfParser for ChatdocClient {
    async fn upload(&self, pdf_path: &Path) -> Result<String> {
        let bytes = std::fs::read(pdf_path)?;
        let file_name = pdf_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document.pdf")
            .to_string();
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/pdf")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{}/documents/upload", self.base_url))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let payload: UploadResponse = response.json().await?;
        if payload.status != "ok" {
            return Err(Error::Other(format!(
                "upload rejected with status {:?}",
                payload.status
            )));
        }
        let id = match payload.data.map(|d| d.id) {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return Err(Error::Other("upload response missing 'id'".into())),
        };
        info!(id = %id, "Uploaded PDF for parsing");
        Ok(id)
    }

    async fn fetch_markdown(&self, upload_id: &str) -> Result<ParseStatus> {
        let response = self
            .http
            .get(format!("{}/pdf_parser/{}/markdown", self.base_url, upload_id))
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(ParseStatus::Ready(response.text().await?));
        }
        if status.as_u16() == 400 {
            let body = response.text().await.unwrap_or_default();
            let detail: ErrorDetail = serde_json::from_str(&body).unwrap_or(ErrorDetail {
                detail: String::new(),
            });
            if detail.detail == "Document parsing not completed." {
                return Ok(ParseStatus::Pending);
            }
            return Err(Error::Api {
                status: 400,
                body,
            });
        }
        Err(Error::Api {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        })
    }
}

/// Options for a conversion run.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Re-upload and overwrite even when a non-empty QMD already exists.
    pub force: bool,
    pub poll_interval: Duration,
    pub max_wait: Duration,
    pub concurrency: usize,
}

impl ConvertOptions {
    pub fn from_config(config: &ConvertConfig, force: bool) -> Self {
        Self {
            force,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            max_wait: Duration::from_secs(config.max_wait_secs),
            concurrency: config.concurrency.max(1),
        }
    }
}

/// Outcome for one PDF.
#[derive(Debug)]
pub enum ConvertOutcome {
    Converted { qmd: PathBuf, images: usize },
    Skipped { qmd: PathBuf },
}

/// Converts a single PDF, polling until the vendor finishes parsing.
pub async fn convert_pdf<P: PdfParser + ?Sized>(
    parser: &P,
    pdf_path: &Path,
    options: &ConvertOptions,
) -> Result<ConvertOutcome> {
    if !pdf_path.is_file() {
        return Err(Error::Other(format!(
            "PDF not found: {}",
            pdf_path.display()
        )));
    }
    let qmd_path = pdf_path.with_extension("qmd");

    if !options.force
        && qmd_path.exists()
        && std::fs::metadata(&qmd_path).map(|m| m.len() > 0).unwrap_or(false)
    {
        info!(qmd = %qmd_path.display(), "QMD already exists, skipping upload");
        return Ok(ConvertOutcome::Skipped { qmd: qmd_path });
    }

    let upload_id = parser.upload(pdf_path).await?;

    let started = Instant::now();
    let markdown = loop {
        match parser.fetch_markdown(&upload_id).await? {
            ParseStatus::Ready(text) => break text,
            ParseStatus::Pending => {
                if started.elapsed() > options.max_wait {
                    return Err(Error::Timeout("document parsing to complete".into()));
                }
                info!(id = %upload_id, "Parsing not completed, polling again");
                tokio::time::sleep(options.poll_interval).await;
            }
        }
    };

    std::fs::write(&qmd_path, &markdown)?;

    let stem = qmd_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    let media_dir = qmd_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!("{stem}-media"));
    let images = extract_images(&qmd_path, &media_dir)?;

    info!(qmd = %qmd_path.display(), images, "Converted PDF to QMD");
    Ok(ConvertOutcome::Converted { qmd: qmd_path, images })
}

/// Outcome of converting a set of PDFs.
#[derive(Debug, Default)]
pub struct ConvertReport {
    pub converted: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Converts several PDFs with bounded concurrency. Failures do not abort
/// the other conversions; they are collected in the report.
pub async fn convert_all<P: PdfParser + ?Sized>(
    parser: &P,
    pdfs: &[PathBuf],
    options: &ConvertOptions,
) -> ConvertReport {
    let results: Vec<(PathBuf, Result<ConvertOutcome>)> = stream::iter(pdfs)
        .map(|pdf| async move { (pdf.clone(), convert_pdf(parser, pdf, options).await) })
        .buffer_unordered(options.concurrency)
        .collect()
        .await;

    let mut report = ConvertReport::default();
    for (pdf, result) in results {
        match result {
            Ok(ConvertOutcome::Converted { qmd, .. }) => report.converted.push(qmd),
            Ok(ConvertOutcome::Skipped { qmd }) => report.skipped.push(qmd),
            Err(e) => {
                error!(pdf = %pdf.display(), error = %e, "Conversion failed");
                report.failed.push((pdf, e.to_string()));
            }
        }
    }
    report
}

/// Extracts inline `data:image/...;base64,...` payloads from a QMD into
/// `media_dir`, rewriting each occurrence to a relative file reference.
/// Identical payloads share one file. Returns the number of unique images
/// written; the pre-extraction text is kept as `<file>.qmd.bak`.
pub fn extract_images(qmd_path: &Path, media_dir: &Path) -> Result<usize> {
    let text = std::fs::read_to_string(qmd_path)?;
    std::fs::create_dir_all(media_dir)?;
    let media_dir_name = media_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let re = Regex::new(r"data:image/([a-zA-Z0-9+.\-]+);base64,([A-Za-z0-9+/=]+)")
        .expect("static regex");

    let mut written = 0usize;
    let new_text = re.replace_all(&text, |caps: &regex::Captures| {
        let format = caps[1].to_lowercase();
        let payload = &caps[2];
        let binary = match BASE64.decode(payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(format = %format, error = %e, "Failed to decode inline image, leaving as-is");
                return caps[0].to_string();
            }
        };

        let mut hasher = Sha256::new();
        hasher.update(&binary);
        let hash = format!("{:x}", hasher.finalize());
        let ext = if format == "svg+xml" { "svg" } else { &format };
        let filename = format!("img-{hash}.{ext}");
        let file_path = media_dir.join(&filename);

        if !file_path.exists() {
            if let Err(e) = std::fs::write(&file_path, &binary) {
                warn!(file = %file_path.display(), error = %e, "Failed to write image, leaving as-is");
                return caps[0].to_string();
            }
            written += 1;
        }
        format!("{media_dir_name}/{filename}")
    });

    let final_text = ensure_yaml_header(&new_text);

    let backup_path = qmd_path.with_extension("qmd.bak");
    std::fs::write(&backup_path, &text)?;
    std::fs::write(qmd_path, final_text.as_ref())?;

    info!(
        images = written,
        media_dir = %media_dir.display(),
        backup = %backup_path.display(),
        "Extracted inline images"
    );
    Ok(written)
}

/// Prepends a skeleton YAML header when the parsed markdown has none, so
/// the document enters the pipeline with the mandatory fields present.
pub fn ensure_yaml_header(text: &str) -> std::borrow::Cow<'_, str> {
    if text.trim_start().starts_with("---") {
        return std::borrow::Cow::Borrowed(text);
    }
    let date = chrono::Local::now().format("%Y-%m-%d");
    let header = format!(
        r#"---
title: "TITLE"
subtitle: "SUBTITLE"
date: "{date}"
version: 1.0.0

category: products

toc: true
toc-title: "Content"
toc-depth: 3
---

"#
    );
    std::borrow::Cow::Owned(format!("{header}{text}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_added_only_when_missing() {
        let with_header = "---\ntitle: X\n---\nbody";
        assert_eq!(ensure_yaml_header(with_header), with_header);

        let without = ensure_yaml_header("# Parsed Document");
        assert!(without.starts_with("---"));
        assert!(without.contains("category: products"));
        assert!(without.ends_with("# Parsed Document"));
    }

    #[test]
    fn inline_images_are_extracted_and_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let qmd = dir.path().join("report.qmd");
        // the same payload twice, plus an svg
        let payload = BASE64.encode(b"fake image bytes");
        let svg_payload = BASE64.encode(b"<svg></svg>");
        std::fs::write(
            &qmd,
            format!(
                "---\ntitle: R\n---\n![a](data:image/png;base64,{payload}) ![b](data:image/png;base64,{payload}) ![c](data:image/svg+xml;base64,{svg_payload})"
            ),
        )
        .unwrap();

        let media = dir.path().join("report-media");
        let written = extract_images(&qmd, &media).unwrap();
        assert_eq!(written, 2);

        let text = std::fs::read_to_string(&qmd).unwrap();
        assert!(!text.contains("base64"));
        assert!(text.contains("report-media/img-"));
        assert!(text.contains(".svg"));

        // backup keeps the original
        let backup = std::fs::read_to_string(dir.path().join("report.qmd.bak")).unwrap();
        assert!(backup.contains("base64"));

        let files: Vec<_> = std::fs::read_dir(&media).unwrap().collect();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn undecodable_payloads_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let qmd = dir.path().join("broken.qmd");
        std::fs::write(&qmd, "---\nt: x\n---\n![x](data:image/png;base64,!!!notbase64)").unwrap();

        let written = extract_images(&qmd, &dir.path().join("broken-media")).unwrap();
        assert_eq!(written, 0);
        // the regex only matches valid base64 alphabets, so the text survives
        let text = std::fs::read_to_string(&qmd).unwrap();
        assert!(text.contains("!!!notbase64"));
    }
}
