//! Git-diff driven discovery of changed functions.
//!
//! The analyzer asks git for a zero-context unified diff, turns every hunk into
//! new-side line numbers, re-indexes each touched file and intersects those
//! lines with function spans.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AnalysisConfig;
use crate::error::{FlowlensError, Result};
use super::{CodeParser, FunctionDef, ParsedFile};

/// Which changes the diff covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffTarget {
    /// Unstaged working-tree changes (plus untracked files when enabled)
    WorkingTree,
    /// Changes staged in the index
    Staged,
    /// A revision range such as `main..feature` or `HEAD~3`
    Range(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Untracked,
}

/// Per-file result of parsing the diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// Path relative to the repository root
    pub path: PathBuf,
    pub status: FileStatus,
    /// New-side line numbers touched by the change
    pub changed_lines: BTreeSet<usize>,
    /// Old content reassembled from `-` lines (only meaningful for deletions)
    pub removed_text: String,
}

impl FileDiff {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            status: FileStatus::Modified,
            changed_lines: BTreeSet::new(),
            removed_text: String::new(),
        }
    }
}

/// A function whose span intersects the change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFunction {
    #[serde(flatten)]
    pub function: FunctionDef,
    pub changed_lines: BTreeSet<usize>,
    pub file_status: FileStatus,
}

impl ChangedFunction {
    pub fn id(&self) -> String {
        self.function.id()
    }
}

/// Output of one analysis pass
#[derive(Debug, Clone, Default)]
pub struct DiffAnalysis {
    pub changed_functions: Vec<ChangedFunction>,
    /// Indexed files still present on disk, keyed by absolute path
    pub parsed_files: HashMap<PathBuf, ParsedFile>,
    /// Per-file problems that did not abort the pass
    pub warnings: Vec<String>,
}

pub struct DiffAnalyzer {
    config: AnalysisConfig,
    parser: CodeParser,
}

impl DiffAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            config: config.clone(),
            parser: CodeParser::new(config),
        }
    }

    /// Run the diff, index touched files and collect changed functions
    pub fn analyze(&self, repo_path: &Path, target: &DiffTarget) -> Result<DiffAnalysis> {
        let repo_root = std::fs::canonicalize(repo_path)
            .map_err(|e| FlowlensError::Diff(format!("{}: {}", repo_path.display(), e)))?;
        if !repo_root.is_dir() {
            return Err(FlowlensError::Diff(format!("{} is not a directory", repo_root.display())));
        }

        let file_diffs = self.collect_file_diffs(&repo_root, target)?;
        info!("Diff touched {} files", file_diffs.len());

        let mut analysis = DiffAnalysis::default();

        let on_disk: Vec<PathBuf> = file_diffs
            .iter()
            .filter(|d| d.status != FileStatus::Deleted)
            .map(|d| repo_root.join(&d.path))
            .filter(|p| p.is_file())
            .collect();
        let mut indexed = self.parser.index_files(&on_disk);

        for file_diff in &file_diffs {
            let abs_path = repo_root.join(&file_diff.path);

            if file_diff.status == FileStatus::Deleted {
                match self.parser.index_source(&abs_path, &file_diff.removed_text) {
                    Ok(parsed) => analysis
                        .changed_functions
                        .extend(deleted_functions(&parsed.functions)),
                    Err(e) => analysis.warnings.push(e.to_string()),
                }
                continue;
            }

            match indexed.remove(&abs_path) {
                Some(Ok(parsed)) => {
                    analysis.changed_functions.extend(changed_functions_for_file(file_diff, &parsed.functions));
                    analysis.parsed_files.insert(abs_path, parsed);
                }
                Some(Err(e)) => analysis.warnings.push(e.to_string()),
                None => {
                    let message = format!("{} is no longer on disk, skipping", abs_path.display());
                    warn!("{}", message);
                    analysis.warnings.push(message);
                }
            }
        }

        info!(
            "Found {} changed functions ({} warnings)",
            analysis.changed_functions.len(),
            analysis.warnings.len()
        );
        Ok(analysis)
    }

    /// Diff plus untracked files, restricted to configured source extensions
    pub fn collect_file_diffs(&self, repo_root: &Path, target: &DiffTarget) -> Result<Vec<FileDiff>> {
        let diff_text = self.run_git_diff(repo_root, target)?;
        let mut diffs = parse_unified_diff(&diff_text);

        if self.config.skip_trivial_hunks {
            diffs.retain(|d| d.status == FileStatus::Deleted || !d.changed_lines.is_empty());
        }

        if target == &DiffTarget::WorkingTree && self.config.include_untracked {
            for path in self.list_untracked(repo_root)? {
                let abs = repo_root.join(&path);
                let line_count = std::fs::read_to_string(&abs)
                    .map(|content| content.lines().count())
                    .unwrap_or(0);
                diffs.push(FileDiff {
                    path,
                    status: FileStatus::Untracked,
                    changed_lines: (1..=line_count).collect(),
                    removed_text: String::new(),
                });
            }
        }

        diffs.retain(|d| self.config.is_source_file(&d.path));
        Ok(diffs)
    }

    pub fn run_git_diff(&self, repo_root: &Path, target: &DiffTarget) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(repo_root)
            .args(["diff", "--relative", "--no-color", "--no-ext-diff", "-U0"]);

        if self.config.ignore_whitespace {
            cmd.args(["--ignore-space-at-eol", "-b", "-w", "--ignore-blank-lines"]);
        }

        match target {
            DiffTarget::WorkingTree => {}
            DiffTarget::Staged => {
                cmd.arg("--cached");
            }
            DiffTarget::Range(range) => {
                if range.starts_with('-') {
                    return Err(FlowlensError::Diff(format!("invalid revision range '{}'", range)));
                }
                cmd.arg(range).arg("--");
            }
        }

        debug!("Running {:?}", cmd);
        let output = cmd
            .output()
            .map_err(|e| FlowlensError::Diff(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FlowlensError::Diff(format!("git diff failed: {}", stderr.trim())));
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        if self.config.skip_trivial_hunks {
            Ok(drop_trivial_hunks(&text))
        } else {
            Ok(text)
        }
    }

    pub fn list_untracked(&self, repo_root: &Path) -> Result<Vec<PathBuf>> {
        let output = Command::new("git")
            .arg("-C")
            .arg(repo_root)
            .args(["ls-files", "--others", "--exclude-standard"])
            .output()
            .map_err(|e| FlowlensError::Diff(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FlowlensError::Diff(format!("git ls-files failed: {}", stderr.trim())));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(PathBuf::from)
            .collect())
    }
}

/// New-side `(start, count)` of a `@@ -a,b +c,d @@` header
fn parse_hunk_header(line: &str) -> Option<(usize, usize)> {
    let rest = line.strip_prefix("@@ -")?;
    let (_, after_old) = rest.split_once(" +")?;
    let new_range = after_old.split_whitespace().next()?;
    match new_range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((new_range.parse().ok()?, 1)),
    }
}

/// Parse `git diff` output into per-file changed line sets
pub fn parse_unified_diff(diff_text: &str) -> Vec<FileDiff> {
    let mut files = Vec::new();
    let mut current: Option<FileDiff> = None;
    // Next new-side line number inside the current hunk
    let mut new_line = 0usize;
    let mut in_hunk = false;

    for line in diff_text.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(done) = current.take() {
                files.push(done);
            }
            // Fallback path from `a/x b/x` until `+++`/`---` lines refine it
            let path = rest
                .rsplit_once(" b/")
                .map(|(_, b)| b.to_string())
                .unwrap_or_default();
            current = Some(FileDiff::new(PathBuf::from(path)));
            in_hunk = false;
            continue;
        }

        let Some(file) = current.as_mut() else {
            continue;
        };

        if !in_hunk {
            if line.starts_with("new file mode") {
                file.status = FileStatus::Added;
            } else if line.starts_with("deleted file mode") {
                file.status = FileStatus::Deleted;
            } else if let Some(path) = line.strip_prefix("+++ b/") {
                file.path = PathBuf::from(path.trim_end());
            } else if let Some(path) = line.strip_prefix("--- a/") {
                if file.path.as_os_str().is_empty() {
                    file.path = PathBuf::from(path.trim_end());
                }
            }
        }

        if let Some((new_start, new_count)) = parse_hunk_header(line) {
            if new_count == 0 && file.status != FileStatus::Deleted {
                // Pure deletion: attribute to the new-side line it happened at
                file.changed_lines.insert(new_start.max(1));
            }
            new_line = new_start;
            in_hunk = true;
            continue;
        }

        if !in_hunk {
            continue;
        }

        if line.starts_with('+') {
            file.changed_lines.insert(new_line);
            new_line += 1;
        } else if let Some(removed) = line.strip_prefix('-') {
            file.removed_text.push_str(removed);
            file.removed_text.push('\n');
        } else if line.starts_with(' ') {
            new_line += 1;
        }
    }

    if let Some(done) = current.take() {
        files.push(done);
    }

    for file in &mut files {
        if file.status == FileStatus::Deleted {
            file.changed_lines.clear();
        }
    }
    files
}

/// Functions whose `[start_line, end_line]` span intersects the changed lines
pub fn changed_functions_for_file(file_diff: &FileDiff, functions: &[FunctionDef]) -> Vec<ChangedFunction> {
    functions
        .iter()
        .filter_map(|function| {
            let changed_lines: BTreeSet<usize> = file_diff
                .changed_lines
                .range(function.start_line..=function.end_line)
                .copied()
                .collect();
            if changed_lines.is_empty() {
                return None;
            }
            Some(ChangedFunction {
                function: function.clone(),
                changed_lines,
                file_status: file_diff.status,
            })
        })
        .collect()
}

/// Functions of a removed file; bodies are empty and no line intersection happens
fn deleted_functions(functions: &[FunctionDef]) -> Vec<ChangedFunction> {
    functions
        .iter()
        .map(|function| ChangedFunction {
            function: FunctionDef {
                body_text: String::new(),
                ..function.clone()
            },
            changed_lines: BTreeSet::new(),
            file_status: FileStatus::Deleted,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Trivial hunk filtering
// ---------------------------------------------------------------------------

/// Rewrite a diff without hunks whose only effect is cosmetic
fn drop_trivial_hunks(diff_text: &str) -> String {
    let mut out = String::with_capacity(diff_text.len());
    let mut hunk: Vec<&str> = Vec::new();
    let mut in_hunk = false;
    let mut deleted_file = false;

    for line in diff_text.lines() {
        if line.starts_with("diff --git ") {
            flush_hunk(&mut hunk, &mut out, deleted_file);
            in_hunk = false;
            deleted_file = false;
            out.push_str(line);
            out.push('\n');
            continue;
        }
        if line.starts_with("@@") {
            flush_hunk(&mut hunk, &mut out, deleted_file);
            in_hunk = true;
            hunk.push(line);
            continue;
        }
        if in_hunk {
            hunk.push(line);
        } else {
            if line.starts_with("deleted file mode") {
                deleted_file = true;
            }
            out.push_str(line);
            out.push('\n');
        }
    }
    flush_hunk(&mut hunk, &mut out, deleted_file);
    out
}

fn flush_hunk(hunk: &mut Vec<&str>, out: &mut String, keep_all: bool) {
    if hunk.is_empty() {
        return;
    }
    if keep_all || is_important_hunk(&hunk[1..]) {
        for line in hunk.iter() {
            out.push_str(line);
            out.push('\n');
        }
    }
    hunk.clear();
}

static DEF_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:async\s+)?def\s+([A-Za-z_]\w*)\s*\((.*)\)\s*(?:->\s*.*)?:\s*$").ok()
});

static PARAM_ANNOTATION: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s*:\s*[^,=\)\]]+").ok());

/// A hunk matters unless it only reformats `def` signatures or touches comments
pub fn is_important_hunk(hunk_lines: &[&str]) -> bool {
    let added: Vec<&str> = hunk_lines.iter().filter_map(|l| l.strip_prefix('+')).collect();
    let removed: Vec<&str> = hunk_lines.iter().filter_map(|l| l.strip_prefix('-')).collect();

    if added.is_empty() && removed.is_empty() {
        return false;
    }

    let is_noise = |l: &str| {
        let t = l.trim();
        t.is_empty() || t.starts_with('#')
    };
    if added.iter().chain(removed.iter()).all(|l| is_noise(l)) {
        return false;
    }

    let Some(def_re) = DEF_LINE.as_ref() else {
        return true;
    };
    let substantive_added = added
        .iter()
        .filter(|l| !is_noise(l) && !def_re.is_match(l))
        .count();
    let substantive_removed = removed
        .iter()
        .filter(|l| !is_noise(l) && !def_re.is_match(l))
        .count();
    if substantive_added > 0 || substantive_removed > 0 {
        return true;
    }

    // Only def lines changed: trivial when every pair is near-identical
    let mut pairs = 0;
    for r in &removed {
        let Some(r_caps) = def_re.captures(r) else { continue };
        let Some(a) = added.iter().find(|a| {
            def_re
                .captures(a)
                .map_or(false, |c| c.get(1).map(|m| m.as_str()) == r_caps.get(1).map(|m| m.as_str()))
        }) else {
            return true;
        };
        let (Some(nr), Some(na)) = (normalize_def_line(r), normalize_def_line(a)) else {
            return true;
        };
        if nr != na && similarity(&nr, &na) < 0.85 {
            return true;
        }
        pairs += 1;
    }
    pairs == 0 && !added.is_empty()
}

/// `def name(params)` with annotations and return type stripped
fn normalize_def_line(line: &str) -> Option<String> {
    let caps = DEF_LINE.as_ref()?.captures(line)?;
    let name = caps.get(1)?.as_str();
    let params = caps.get(2).map_or("", |m| m.as_str());
    let stripped = PARAM_ANNOTATION.as_ref()?.replace_all(params, "");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    Some(format!("def {}({})", name, collapsed))
}

/// 2 * LCS / (len_a + len_b), the same ratio a sequence matcher reports for short strings
fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    for ca in &a {
        let mut row = vec![0usize; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            row[j + 1] = if ca == cb { prev[j] + 1 } else { row[j].max(prev[j + 1]) };
        }
        prev = row;
    }
    2.0 * prev[b.len()] as f64 / (a.len() + b.len()) as f64
}
