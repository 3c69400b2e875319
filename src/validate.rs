//! Frontmatter validation over the publish tree.
//!
//! Every document must carry parseable YAML frontmatter with a category
//! from the allowed set; the CI gate fails the build otherwise.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::docs;
use crate::error::Result;
use crate::frontmatter;

/// Why a document failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    NoFrontmatter,
    EmptyFrontmatter,
    YamlError(String),
    MissingCategory { available: Vec<String> },
    InvalidCategory { found: String },
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::NoFrontmatter => write!(f, "NO YAML header"),
            Failure::EmptyFrontmatter => write!(f, "EMPTY YAML header"),
            Failure::YamlError(e) => write!(f, "YAML error: {e}"),
            Failure::MissingCategory { available } => {
                write!(f, "MISSING category field (available: {available:?})")
            }
            Failure::InvalidCategory { found } => write!(f, "INVALID category '{found}'"),
        }
    }
}

/// One invalid document.
#[derive(Debug, Clone)]
pub struct InvalidDocument {
    pub path: String,
    pub failure: Failure,
}

/// Outcome of a validation run.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub checked: usize,
    pub invalid: Vec<InvalidDocument>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// Validates every document under `docs_dir`.
pub fn run(
    docs_dir: &Path,
    excluded_dirs: &[String],
    allowed_categories: &[String],
) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();

    for doc_path in docs::find_qmd_files(docs_dir, excluded_dirs)? {
        report.checked += 1;
        let rel = docs::rel_key(&doc_path, docs_dir);
        if let Some(failure) = check_document(&doc_path, allowed_categories)? {
            warn!(path = %rel, failure = %failure, "Invalid document");
            report.invalid.push(InvalidDocument { path: rel, failure });
        }
    }

    info!(
        checked = report.checked,
        invalid = report.invalid.len(),
        "Validation complete"
    );
    Ok(report)
}

fn check_document(path: &Path, allowed_categories: &[String]) -> Result<Option<Failure>> {
    let content = fs::read_to_string(path)?;
    let Some((yaml_block, _)) = frontmatter::split(&content) else {
        return Ok(Some(Failure::NoFrontmatter));
    };

    let mapping = match serde_yaml::from_str::<serde_yaml::Value>(&yaml_block) {
        Ok(serde_yaml::Value::Mapping(m)) if !m.is_empty() => m,
        Ok(serde_yaml::Value::Null) => return Ok(Some(Failure::EmptyFrontmatter)),
        Ok(serde_yaml::Value::Mapping(_)) => return Ok(Some(Failure::EmptyFrontmatter)),
        Ok(_) => return Ok(Some(Failure::EmptyFrontmatter)),
        Err(e) => return Ok(Some(Failure::YamlError(e.to_string()))),
    };

    match frontmatter::get_str(&mapping, "category") {
        None => {
            let available = mapping
                .keys()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect();
            Ok(Some(Failure::MissingCategory { available }))
        }
        Some(category) if !allowed_categories.iter().any(|a| *a == category) => {
            Ok(Some(Failure::InvalidCategory { found: category }))
        }
        Some(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn allowed() -> Vec<String> {
        vec!["products".to_string(), "guidelines".to_string()]
    }

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn valid_document_passes() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a_v1.qmd", "---\ntitle: A\ncategory: products\n---\nbody");
        let report = run(dir.path(), &[], &allowed()).unwrap();
        assert_eq!(report.checked, 1);
        assert!(report.is_valid());
    }

    #[test]
    fn missing_and_invalid_categories_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "missing_v1.qmd", "---\ntitle: A\n---\nbody");
        write(dir.path(), "bad_v1.qmd", "---\ncategory: blog\n---\nbody");
        write(dir.path(), "plain_v1.qmd", "no frontmatter at all");

        let report = run(dir.path(), &[], &allowed()).unwrap();
        assert_eq!(report.checked, 3);
        assert_eq!(report.invalid.len(), 3);

        let failures: Vec<_> = report.invalid.iter().map(|i| &i.failure).collect();
        assert!(failures
            .iter()
            .any(|f| matches!(f, Failure::MissingCategory { .. })));
        assert!(failures
            .iter()
            .any(|f| matches!(f, Failure::InvalidCategory { found } if found == "blog")));
        assert!(failures.iter().any(|f| matches!(f, Failure::NoFrontmatter)));
    }

    #[test]
    fn broken_yaml_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "broken_v1.qmd", "---\ntitle: [unclosed\n---\nbody");
        let report = run(dir.path(), &[], &allowed()).unwrap();
        assert_eq!(report.invalid.len(), 1);
        assert!(matches!(report.invalid[0].failure, Failure::YamlError(_)));
    }
}
