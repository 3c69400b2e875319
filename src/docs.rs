//! Document discovery over a corpus tree.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

/// Recursively collects `.qmd` files under `root`, skipping any file whose
/// relative path contains one of `excluded_dirs`. Results are sorted so
/// reruns process documents in a stable order.
pub fn find_qmd_files(root: &Path, excluded_dirs: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    visit_dir(root, excluded_dirs, &mut files)?;
    files.sort();
    Ok(files)
}

fn visit_dir(dir: &Path, excluded_dirs: &[String], results: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry_res in std::fs::read_dir(dir)? {
        let entry = entry_res?;
        let path = entry.path();
        if path.is_dir() {
            let dir_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if excluded_dirs.iter().any(|ex| ex == dir_name) {
                debug!(path = %path.display(), "Skipping excluded directory");
                continue;
            }
            visit_dir(&path, excluded_dirs, results)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("qmd") {
            results.push(path);
        }
    }
    Ok(())
}

/// Relative path of `path` under `root`, normalised to forward slashes so
/// store keys are identical across platforms.
pub fn rel_key(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn finds_qmd_files_and_skips_excluded_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("proj/theme")).unwrap();
        fs::write(dir.path().join("proj/doc_v1.qmd"), "---\n---\n").unwrap();
        fs::write(dir.path().join("proj/theme/skipme.qmd"), "---\n---\n").unwrap();
        fs::write(dir.path().join("proj/notes.txt"), "not a doc").unwrap();

        let found = find_qmd_files(dir.path(), &["theme".to_string()]).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("proj/doc_v1.qmd"));
    }

    #[test]
    fn rel_key_uses_forward_slashes() {
        let root = Path::new("/corpus");
        let path = Path::new("/corpus/products/doc_v2.qmd");
        assert_eq!(rel_key(path, root), "products/doc_v2.qmd");
    }
}
