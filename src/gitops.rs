//! Git plumbing for the versioning stage.
//!
//! Shells out to the `git` CLI the same way the rest of the pipeline treats
//! external tools: one command per question, non-zero exit mapped to a typed
//! error, structured tracing around every call.

use std::path::PathBuf;
use std::process::Command;

use regex::Regex;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::tokens;

/// Handle on the corpus checkout.
pub struct GitRepo {
    root: PathBuf,
}

/// A rename detected between the release baseline and HEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    pub old: String,
    pub new: String,
    /// Raw similarity status, e.g. `R100`.
    pub similarity: String,
}

impl GitRepo {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root of the checkout; repo-relative paths resolve against this.
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()
            .map_err(|e| Error::Git {
                command: args.join(" "),
                detail: format!("failed to launch git: {e}"),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(command = %args.join(" "), stderr = %stderr, "git command failed");
            return Err(Error::Git {
                command: args.join(" "),
                detail: stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    pub fn current_branch(&self) -> Result<String> {
        Ok(self.run(&["branch", "--show-current"])?.trim().to_string())
    }

    /// All tags, newest version first.
    pub fn sorted_tags(&self) -> Result<Vec<String>> {
        Ok(self
            .run(&["tag", "-l", "--sort=-v:refname"])?
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// The most recent release tag for the current branch.
    ///
    /// The `test` branch releases under `-test`-suffixed tags and `main`
    /// under plain ones; each branch must only see its own baseline or
    /// reruns on one branch would version against the other's history.
    pub fn last_release_tag(&self) -> Result<Option<String>> {
        let branch = self.current_branch()?;
        info!(branch = %branch, "Resolving release baseline");

        let all_tags = self.sorted_tags()?;
        if all_tags.is_empty() {
            info!("No release tags found, treating as first release");
            return Ok(None);
        }

        let filtered: Vec<&String> = match branch.as_str() {
            "test" => all_tags.iter().filter(|t| t.contains("-test")).collect(),
            "main" => all_tags.iter().filter(|t| !t.contains("-test")).collect(),
            _ => all_tags.iter().collect(),
        };

        match filtered.first() {
            Some(tag) => {
                info!(tag = %tag, "Found last release tag");
                Ok(Some((*tag).clone()))
            }
            None => {
                info!(branch = %branch, "No release tags for branch, treating as first release");
                Ok(None)
            }
        }
    }

    /// Changed documents since `last_tag`, with renames reported separately.
    /// Deletions are ignored; the stores are cleaned up by the redirects
    /// stage instead.
    pub fn changed_files_with_renames(
        &self,
        last_tag: &str,
        docs_prefix: &str,
    ) -> Result<(Vec<String>, Vec<Rename>)> {
        let output = self.run(&["diff", "--name-status", last_tag, "HEAD"])?;
        Ok(parse_name_status(&output, docs_prefix))
    }

    /// Diff for one document since `since_tag`. `None` means no net change.
    pub fn diff_for_file(&self, path: &str, since_tag: &str) -> Result<Option<String>> {
        let diff = self.run(&["diff", since_tag, "HEAD", "--", path])?;
        if diff.trim().is_empty() {
            debug!(path, "No net changes since baseline");
            Ok(None)
        } else {
            Ok(Some(diff))
        }
    }
}

/// Parses `git diff --name-status` output, keeping only documents under
/// `docs_prefix`.
pub fn parse_name_status(output: &str, docs_prefix: &str) -> (Vec<String>, Vec<Rename>) {
    let mut changed_files = Vec::new();
    let mut renames = Vec::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split('\t').collect();
        let status = parts[0];

        if status.starts_with('R') {
            if parts.len() >= 3 {
                let (old_path, new_path) = (parts[1], parts[2]);
                if new_path.starts_with(docs_prefix) && new_path.ends_with(".qmd") {
                    renames.push(Rename {
                        old: old_path.to_string(),
                        new: new_path.to_string(),
                        similarity: status.to_string(),
                    });
                    changed_files.push(new_path.to_string());
                }
            }
        } else if (status == "M" || status == "A") && parts.len() >= 2 {
            let filepath = parts[1];
            if filepath.starts_with(docs_prefix) && filepath.ends_with(".qmd") {
                changed_files.push(filepath.to_string());
            }
        }
        // 'D' rows fall through
    }

    (changed_files, renames)
}

/// Replaces binary-file markers so the model sees a readable placeholder
/// instead of an opaque diff line.
pub fn clean_diff(diff: &str) -> String {
    let re = Regex::new(r"(?m)^Binary files .* differ$").expect("static regex");
    re.replace_all(diff, "# [Binary file (image/media) was updated]")
        .into_owned()
}

/// Truncates an oversized diff to `max_tokens`, keeping the beginning and
/// end with an elision marker in between. Changes usually cluster at the
/// head (frontmatter) and tail (appendices), so both ends carry signal.
pub fn truncate_diff(diff: &str, path: &str, max_tokens: u64) -> String {
    let total = tokens::estimate(diff);
    if total <= max_tokens {
        return diff.to_string();
    }

    tracing::warn!(
        path,
        tokens = total,
        max_tokens,
        "Diff too large, truncating head and tail"
    );

    let keep_tokens = max_tokens.saturating_sub(1_000);
    let half_tokens = keep_tokens / 2;
    let line_costs = tokens::estimate_lines(diff);
    let lines: Vec<&str> = diff.lines().collect();

    let mut beginning_end = 0usize;
    let mut acc = 0u64;
    for (idx, cost) in &line_costs {
        if acc + cost > half_tokens {
            break;
        }
        acc += cost;
        beginning_end = idx + 1;
    }

    let mut ending_start = lines.len();
    let mut acc = 0u64;
    for (idx, cost) in line_costs.iter().rev() {
        if acc + cost > half_tokens || *idx < beginning_end {
            break;
        }
        acc += cost;
        ending_start = *idx;
    }

    let skipped = ending_start.saturating_sub(beginning_end);
    format!(
        "{}\n\n... [{} lines omitted due to size - file was extensively modified] ...\n\n{}",
        lines[..beginning_end].join("\n"),
        skipped,
        lines[ending_start..].join("\n"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_status_separates_changes_and_renames() {
        let output = "M\tDOCS/products/a_v1.qmd\n\
                      A\tDOCS/guidelines/b_v2.qmd\n\
                      R100\tDOCS/old_v1.qmd\tDOCS/products/new_v1.qmd\n\
                      D\tDOCS/gone_v1.qmd\n\
                      M\tREADME.md\n";
        let (changed, renames) = parse_name_status(output, "DOCS/");
        assert_eq!(
            changed,
            vec![
                "DOCS/products/a_v1.qmd",
                "DOCS/guidelines/b_v2.qmd",
                "DOCS/products/new_v1.qmd",
            ]
        );
        assert_eq!(renames.len(), 1);
        assert_eq!(renames[0].old, "DOCS/old_v1.qmd");
        assert_eq!(renames[0].similarity, "R100");
    }

    #[test]
    fn deleted_and_foreign_files_are_ignored() {
        let output = "D\tDOCS/gone_v1.qmd\nM\tscripts/build.sh\n";
        let (changed, renames) = parse_name_status(output, "DOCS/");
        assert!(changed.is_empty());
        assert!(renames.is_empty());
    }

    #[test]
    fn binary_markers_are_replaced() {
        let diff = "diff --git a/x b/x\nBinary files a/img.png and b/img.png differ\n+added";
        let cleaned = clean_diff(diff);
        assert!(cleaned.contains("# [Binary file (image/media) was updated]"));
        assert!(!cleaned.contains("Binary files"));
    }

    #[test]
    fn small_diffs_pass_through_untruncated() {
        let diff = "+one\n+two";
        assert_eq!(truncate_diff(diff, "a.qmd", 10_000), diff);
    }

    #[test]
    fn oversized_diffs_keep_head_and_tail() {
        let head = "HEAD-LINE-MARKER";
        let tail = "TAIL-LINE-MARKER";
        let mut lines = vec![head.to_string()];
        lines.extend((0..5000).map(|i| format!("+ filler line number {i} with some payload text")));
        lines.push(tail.to_string());
        let diff = lines.join("\n");

        let truncated = truncate_diff(&diff, "big_v1.qmd", 5_000);
        assert!(truncated.contains(head));
        assert!(truncated.contains(tail));
        assert!(truncated.contains("lines omitted due to size"));
        assert!(tokens::estimate(&truncated) < tokens::estimate(&diff));
    }
}
