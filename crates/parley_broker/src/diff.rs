//! Diff validation and analysis.
//!
//! Validation shells out to `git apply --check` against the configured
//! repo root; affected-file extraction parses unified-diff headers
//! directly. Both sit behind the `DiffValidator` capability so operations
//! and tests can swap the implementation.

use parley_protocol::AffectedFile;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Outcome of validating a diff against a working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Ok,
    Failed(String),
}

impl Validation {
    pub fn is_ok(&self) -> bool {
        matches!(self, Validation::Ok)
    }
}

/// Capability set for diff handling.
#[async_trait::async_trait]
pub trait DiffValidator: Send + Sync {
    /// Does the diff apply cleanly against the working tree at `cwd`?
    async fn validate(&self, diff_text: &str, cwd: Option<&std::path::Path>) -> Validation;

    /// Parse a unified diff into its affected-file list. Parse failure
    /// yields an empty list, never an error.
    fn extract_affected_files(&self, diff_text: &str) -> Vec<AffectedFile> {
        extract_affected_files(diff_text)
    }
}

/// Production validator backed by `git apply --check`.
pub struct GitDiffValidator;

#[async_trait::async_trait]
impl DiffValidator for GitDiffValidator {
    async fn validate(&self, diff_text: &str, cwd: Option<&std::path::Path>) -> Validation {
        let mut command = Command::new("git");
        command
            .args(["apply", "--check"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return Validation::Failed(format!("failed to run git apply: {err}")),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(diff_text.as_bytes()).await {
                return Validation::Failed(format!("failed to write diff to git apply: {err}"));
            }
            drop(stdin);
        }

        match child.wait_with_output().await {
            Ok(output) if output.status.success() => Validation::Ok,
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                Validation::Failed(stderr)
            }
            Err(err) => Validation::Failed(format!("failed to wait for git apply: {err}")),
        }
    }
}

/// Discover the git repository root for diff validation.
pub async fn discover_repo_root() -> Option<PathBuf> {
    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if root.is_empty() {
        None
    } else {
        Some(PathBuf::from(root))
    }
}

/// Parse a unified diff and describe each touched file.
///
/// Recognizes `diff --git` / `---` / `+++` headers, `new file` /
/// `deleted file` markers, and counts added/removed lines per file.
/// Returns an empty list when the text does not look like a diff.
pub fn extract_affected_files(diff_text: &str) -> Vec<AffectedFile> {
    struct Current {
        old_path: Option<String>,
        new_path: Option<String>,
        created: bool,
        deleted: bool,
        added: u64,
        removed: u64,
    }

    impl Current {
        fn new() -> Self {
            Self {
                old_path: None,
                new_path: None,
                created: false,
                deleted: false,
                added: 0,
                removed: 0,
            }
        }

        fn finish(self) -> Option<AffectedFile> {
            let path = match (&self.new_path, &self.old_path) {
                (Some(new), _) if new != "/dev/null" => new.clone(),
                (_, Some(old)) if old != "/dev/null" => old.clone(),
                _ => return None,
            };
            let operation = if self.created || self.old_path.as_deref() == Some("/dev/null") {
                "create"
            } else if self.deleted || self.new_path.as_deref() == Some("/dev/null") {
                "delete"
            } else {
                "modify"
            };
            Some(AffectedFile {
                path,
                operation: operation.to_string(),
                added: self.added,
                removed: self.removed,
            })
        }
    }

    let mut files = Vec::new();
    let mut current: Option<Current> = None;
    let mut in_hunk = false;

    let mut lines = diff_text.lines().peekable();
    while let Some(line) = lines.next() {
        if line.starts_with("diff --git ") {
            if let Some(done) = current.take().and_then(Current::finish) {
                files.push(done);
            }
            current = Some(Current::new());
            in_hunk = false;
            continue;
        }

        // A `--- `/`+++ ` pair opens the next file even without a
        // `diff --git` header; the lookahead distinguishes it from a
        // removed line inside a hunk.
        if line.starts_with("--- ")
            && lines
                .peek()
                .map_or(false, |next| next.starts_with("+++ "))
        {
            // Reuse the entry a `diff --git` header just opened so its
            // new-file/deleted-file markers are kept.
            let headers_pending = current
                .as_ref()
                .map_or(false, |entry| entry.old_path.is_none() && entry.new_path.is_none());
            if !headers_pending {
                if let Some(done) = current.take().and_then(Current::finish) {
                    files.push(done);
                }
            }
            let entry = current.get_or_insert_with(Current::new);
            entry.old_path = Some(strip_diff_path(&line[4..]));
            if let Some(plus) = lines.next() {
                entry.new_path = Some(strip_diff_path(&plus[4..]));
            }
            in_hunk = false;
            continue;
        }

        if line.starts_with("new file mode") {
            if let Some(entry) = current.as_mut() {
                entry.created = true;
            }
            continue;
        }
        if line.starts_with("deleted file mode") {
            if let Some(entry) = current.as_mut() {
                entry.deleted = true;
            }
            continue;
        }
        if line.starts_with("@@") {
            in_hunk = true;
            continue;
        }

        if in_hunk {
            if let Some(entry) = current.as_mut() {
                if line.starts_with('+') && !line.starts_with("+++") {
                    entry.added += 1;
                } else if line.starts_with('-') && !line.starts_with("---") {
                    entry.removed += 1;
                }
            }
        }
    }

    if let Some(done) = current.and_then(Current::finish) {
        files.push(done);
    }
    files
}

fn strip_diff_path(raw: &str) -> String {
    // Header paths look like "a/src/lib.rs", "b/src/lib.rs", or "/dev/null";
    // a trailing tab may carry a timestamp.
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw == "/dev/null" {
        return raw.to_string();
    }
    raw.strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODIFY_DIFF: &str = "\
diff --git a/src/lib.rs b/src/lib.rs
index 1111111..2222222 100644
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -1,3 +1,4 @@
 fn main() {
-    println!(\"old\");
+    println!(\"new\");
+    println!(\"extra\");
 }
";

    const CREATE_DIFF: &str = "\
diff --git a/docs/notes.md b/docs/notes.md
new file mode 100644
index 0000000..3333333
--- /dev/null
+++ b/docs/notes.md
@@ -0,0 +1,2 @@
+first
+second
";

    const DELETE_DIFF: &str = "\
diff --git a/old.txt b/old.txt
deleted file mode 100644
index 4444444..0000000
--- a/old.txt
+++ /dev/null
@@ -1,1 +0,0 @@
-gone
";

    #[test]
    fn modify_counts_added_and_removed() {
        let files = extract_affected_files(MODIFY_DIFF);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "src/lib.rs");
        assert_eq!(files[0].operation, "modify");
        assert_eq!(files[0].added, 2);
        assert_eq!(files[0].removed, 1);
    }

    #[test]
    fn create_is_detected() {
        let files = extract_affected_files(CREATE_DIFF);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "docs/notes.md");
        assert_eq!(files[0].operation, "create");
        assert_eq!(files[0].added, 2);
        assert_eq!(files[0].removed, 0);
    }

    #[test]
    fn delete_is_detected() {
        let files = extract_affected_files(DELETE_DIFF);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "old.txt");
        assert_eq!(files[0].operation, "delete");
        assert_eq!(files[0].removed, 1);
    }

    #[test]
    fn multi_file_diff_yields_one_entry_per_file() {
        let combined = format!("{MODIFY_DIFF}{CREATE_DIFF}");
        let files = extract_affected_files(&combined);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "src/lib.rs");
        assert_eq!(files[1].path, "docs/notes.md");
    }

    // Plain unified diffs carry no `diff --git` headers at all.
    const PLAIN_MULTI_FILE_DIFF: &str = "\
--- a/alpha.py
+++ b/alpha.py
@@ -1 +1,2 @@
 x = 1
+y = 2
--- a/beta.py
+++ b/beta.py
@@ -1,2 +1 @@
 a = 10
-b = 20
";

    #[test]
    fn plain_headers_split_files_without_git_header() {
        let files = extract_affected_files(PLAIN_MULTI_FILE_DIFF);
        assert_eq!(files.len(), 2);

        assert_eq!(files[0].path, "alpha.py");
        assert_eq!(files[0].operation, "modify");
        assert_eq!(files[0].added, 1);
        assert_eq!(files[0].removed, 0);

        assert_eq!(files[1].path, "beta.py");
        assert_eq!(files[1].operation, "modify");
        assert_eq!(files[1].added, 0);
        assert_eq!(files[1].removed, 1);
    }

    #[test]
    fn plain_headers_detect_create_and_delete() {
        let diff = "\
--- /dev/null
+++ b/newfile.py
@@ -0,0 +1,2 @@
+def new_func():
+    pass
--- a/oldfile.py
+++ /dev/null
@@ -1,2 +0,0 @@
-def old_func():
-    pass
";
        let files = extract_affected_files(diff);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, "newfile.py");
        assert_eq!(files[0].operation, "create");
        assert_eq!(files[0].added, 2);
        assert_eq!(files[1].path, "oldfile.py");
        assert_eq!(files[1].operation, "delete");
        assert_eq!(files[1].removed, 2);
    }

    #[test]
    fn garbage_input_yields_empty_list() {
        assert!(extract_affected_files("not a diff at all").is_empty());
        assert!(extract_affected_files("").is_empty());
    }
}
