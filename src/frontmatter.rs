//! QMD frontmatter primitives.
//!
//! Every stage that touches document metadata goes through this module: it
//! splits the leading `---` delimited YAML block from the markdown body,
//! parses it into a `serde_yaml::Mapping` (which preserves field order, so
//! rewrites do not reshuffle author metadata), and writes the block back
//! without ever touching the body.

use std::fs;
use std::path::Path;

use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::error::{Error, Result};

/// Splits QMD content into its YAML block and the remaining body.
///
/// Returns `None` when the document has no frontmatter (first line is not
/// `---`, or the closing marker is missing).
pub fn split(content: &str) -> Option<(String, String)> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.first().map(|l| l.trim()) != Some("---") {
        return None;
    }
    let end_idx = lines[1..].iter().position(|l| l.trim() == "---")? + 1;
    let yaml_block = lines[1..end_idx].join("\n");
    let body = lines[end_idx + 1..].join("\n");
    Some((yaml_block, body))
}

/// Parses the frontmatter of `content`, if present.
pub fn parse(content: &str) -> Result<Option<Mapping>> {
    let Some((yaml_block, _)) = split(content) else {
        return Ok(None);
    };
    let value: Value = serde_yaml::from_str(&yaml_block)?;
    match value {
        Value::Mapping(m) => Ok(Some(m)),
        Value::Null => Ok(Some(Mapping::new())),
        other => Err(Error::Other(format!(
            "frontmatter is not a mapping: {other:?}"
        ))),
    }
}

/// Reads and parses the frontmatter of the file at `path`.
pub fn read_mapping(path: &Path) -> Result<Mapping> {
    let content = fs::read_to_string(path)?;
    parse(&content)?.ok_or_else(|| Error::Frontmatter {
        path: path.display().to_string(),
        detail: "no YAML frontmatter found".to_string(),
    })
}

/// Reassembles a document from its frontmatter and body.
pub fn render(mapping: &Mapping, body: &str) -> Result<String> {
    let yaml_block = serde_yaml::to_string(mapping)?;
    Ok(format!("---\n{}---\n{}", yaml_block, body))
}

/// Rewrites only the YAML block of the file at `path`, leaving the body
/// untouched. Returns `false` (and warns) when the file has no frontmatter,
/// matching the skip-and-continue behaviour expected by batch callers.
pub fn update_file<F>(path: &Path, f: F) -> Result<bool>
where
    F: FnOnce(&mut Mapping),
{
    let content = fs::read_to_string(path)?;
    let Some((yaml_block, body)) = split(&content) else {
        warn!(path = %path.display(), "No YAML frontmatter found, skipping");
        return Ok(false);
    };
    let value: Value = serde_yaml::from_str(&yaml_block)?;
    let mut mapping = match value {
        Value::Mapping(m) => m,
        Value::Null => Mapping::new(),
        other => {
            return Err(Error::Frontmatter {
                path: path.display().to_string(),
                detail: format!("frontmatter is not a mapping: {other:?}"),
            })
        }
    };
    f(&mut mapping);
    fs::write(path, render(&mapping, &body)?)?;
    Ok(true)
}

/// Fetches a string field, accepting bare and quoted scalars.
pub fn get_str(mapping: &Mapping, key: &str) -> Option<String> {
    match mapping.get(key)? {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Inserts or replaces a string field.
pub fn set_str(mapping: &mut Mapping, key: &str, value: &str) {
    mapping.insert(
        Value::String(key.to_string()),
        Value::String(value.to_string()),
    );
}

/// Inserts or replaces a string-sequence field.
pub fn set_str_seq(mapping: &mut Mapping, key: &str, values: &[String]) {
    mapping.insert(
        Value::String(key.to_string()),
        Value::Sequence(
            values
                .iter()
                .map(|v| Value::String(v.clone()))
                .collect::<Vec<_>>(),
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "---\ntitle: \"Mapping Guide\"\ncategory: products\nversion: 1.2.0\n---\n\n# Body\n\ntext";

    #[test]
    fn split_separates_yaml_and_body() {
        let (yaml, body) = split(DOC).expect("has frontmatter");
        assert!(yaml.contains("category: products"));
        assert!(body.starts_with("\n# Body"));
    }

    #[test]
    fn split_rejects_missing_marker() {
        assert!(split("# no frontmatter here").is_none());
        assert!(split("---\nunterminated: yes\n").is_none());
    }

    #[test]
    fn parse_reads_fields() {
        let mapping = parse(DOC).unwrap().expect("mapping");
        assert_eq!(get_str(&mapping, "category").as_deref(), Some("products"));
        assert_eq!(get_str(&mapping, "title").as_deref(), Some("Mapping Guide"));
    }

    #[test]
    fn update_preserves_body_and_field_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc_v1.qmd");
        std::fs::write(&path, DOC).unwrap();

        let updated = update_file(&path, |m| set_str(m, "version", "1.3.0")).unwrap();
        assert!(updated);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("version: 1.3.0"));
        assert!(content.ends_with("# Body\n\ntext"));
        // title still precedes category after the rewrite
        let title_pos = content.find("title:").unwrap();
        let category_pos = content.find("category:").unwrap();
        assert!(title_pos < category_pos);
    }

    #[test]
    fn update_skips_documents_without_frontmatter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.qmd");
        std::fs::write(&path, "just text").unwrap();

        let updated = update_file(&path, |m| set_str(m, "version", "1.0.0")).unwrap();
        assert!(!updated);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "just text");
    }
}
