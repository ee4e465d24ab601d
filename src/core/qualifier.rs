//! Call-site discovery and qualification.
//!
//! Qualification runs in two passes over a function body. The tokenize pass
//! lexes the text (skipping strings and comments) and emits every identifier
//! immediately followed by `(` as a candidate span. The resolve pass maps each
//! surviving candidate to a `<file>::<function>` id using the defining file's
//! local functions and import table.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::differ::ChangedFunction;
use super::imports::{ImportTable, ResolvedImport};
use super::parser::{function_id, ID_SEPARATOR};
use super::ParsedFile;

const PYTHON_KEYWORDS: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "class", "continue", "def", "del", "elif",
    "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is", "lambda",
    "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with", "yield", "match",
    "case", "print",
];

/// A call expression found in a function body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Absolute line in the defining file
    pub line: usize,
    /// 1-based byte column of the called name
    pub column: usize,
    pub name: String,
    /// Dotted receiver for attribute calls (`self`, `utils`, `pkg.mod`)
    pub receiver: Option<String>,
    /// Fully qualified target, when resolvable
    pub callee_id: Option<String>,
    /// Text between the call's balanced parentheses
    pub args_text: String,
}

/// A changed function annotated with its resolved call sites
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualifiedFunction {
    pub function: ChangedFunction,
    pub call_sites: Vec<CallSite>,
    /// Body with every resolved call expression replaced by its qualified id
    pub qualified_body: String,
}

impl QualifiedFunction {
    pub fn id(&self) -> String {
        self.function.id()
    }

    /// Distinct resolved callee ids, sorted
    pub fn callee_ids(&self) -> BTreeSet<String> {
        self.call_sites
            .iter()
            .filter_map(|site| site.callee_id.clone())
            .collect()
    }

    /// First call site on `line` targeting `callee_id`
    pub fn call_site_at(&self, line: usize, callee_id: &str) -> Option<&CallSite> {
        self.call_sites
            .iter()
            .find(|site| site.line == line && site.callee_id.as_deref() == Some(callee_id))
    }
}

/// Name-resolution scope of one source file
pub struct FileContext<'a> {
    pub file_path: &'a Path,
    pub local_functions: HashSet<&'a str>,
    pub imports: Option<&'a ImportTable>,
    pub repo_root: &'a Path,
}

impl<'a> FileContext<'a> {
    pub fn from_parsed(parsed: &'a ParsedFile, repo_root: &'a Path) -> Self {
        Self {
            file_path: &parsed.path,
            local_functions: parsed.local_function_names().collect(),
            imports: Some(&parsed.imports),
            repo_root,
        }
    }

    /// Scope with no locals and no imports (deleted files)
    pub fn empty(file_path: &'a Path, repo_root: &'a Path) -> Self {
        Self {
            file_path,
            local_functions: HashSet::new(),
            imports: None,
            repo_root,
        }
    }
}

/// How the candidate's callee expression was written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalleeForm {
    /// `name(`
    Bare,
    /// `a.b.name(`
    Attribute(String),
    /// `<file>::name(`, left behind by an earlier qualification
    Qualified(String),
}

/// Output of the tokenize pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallCandidate {
    /// 0-based line within the body
    pub line_offset: usize,
    pub column: usize,
    pub name: String,
    pub form: CalleeForm,
    /// Byte span of the whole callee expression within the body
    pub span: (usize, usize),
    pub args_text: String,
}

/// Qualify every changed function against its file's scope
pub fn qualify_all(
    functions: &[ChangedFunction],
    parsed_files: &HashMap<PathBuf, ParsedFile>,
    repo_root: &Path,
) -> Vec<QualifiedFunction> {
    functions
        .iter()
        .map(|function| match parsed_files.get(&function.function.file_path) {
            Some(parsed) => qualify(function, &FileContext::from_parsed(parsed, repo_root)),
            None => qualify(function, &FileContext::empty(&function.function.file_path, repo_root)),
        })
        .collect()
}

pub fn qualify(function: &ChangedFunction, context: &FileContext) -> QualifiedFunction {
    let (call_sites, qualified_body) =
        qualify_body(&function.function.body_text, function.function.start_line, context);

    debug!(
        "Qualified {}: {} call sites, {} resolved",
        function.id(),
        call_sites.len(),
        call_sites.iter().filter(|s| s.callee_id.is_some()).count()
    );

    QualifiedFunction {
        function: function.clone(),
        call_sites,
        qualified_body,
    }
}

/// Resolve the calls in `body` (whose first line is `start_line`) and render the qualified text
pub fn qualify_body(body: &str, start_line: usize, context: &FileContext) -> (Vec<CallSite>, String) {
    let candidates = longest_matches(scan_call_candidates(body));

    let mut call_sites = Vec::with_capacity(candidates.len());
    let mut rendered = String::with_capacity(body.len());
    let mut cursor = 0;

    for candidate in candidates {
        let callee_id = resolve_candidate(&candidate, context);

        if let Some(id) = &callee_id {
            let (start, end) = candidate.span;
            if start >= cursor {
                rendered.push_str(&body[cursor..start]);
                rendered.push_str(id);
                cursor = end;
            }
        }

        call_sites.push(CallSite {
            line: start_line + candidate.line_offset,
            column: candidate.column,
            receiver: match &candidate.form {
                CalleeForm::Attribute(receiver) => Some(receiver.clone()),
                _ => None,
            },
            name: candidate.name,
            callee_id,
            args_text: candidate.args_text,
        });
    }
    rendered.push_str(&body[cursor..]);

    (call_sites, rendered)
}

fn resolve_candidate(candidate: &CallCandidate, context: &FileContext) -> Option<String> {
    let name = candidate.name.as_str();
    match &candidate.form {
        CalleeForm::Qualified(file) => Some(format!("{}{}{}", file, ID_SEPARATOR, name)),
        CalleeForm::Bare => resolve_name(name, context),
        CalleeForm::Attribute(receiver) if receiver == "self" || receiver == "cls" => {
            resolve_name(name, context)
        }
        CalleeForm::Attribute(receiver) => {
            let file = context
                .imports?
                .resolve_receiver(receiver, context.file_path, context.repo_root)?;
            Some(function_id(&file, name))
        }
    }
}

/// Same-file definitions win over imports
fn resolve_name(name: &str, context: &FileContext) -> Option<String> {
    if context.local_functions.contains(name) {
        return Some(function_id(context.file_path, name));
    }
    match context.imports?.resolve(name, context.file_path, context.repo_root)? {
        ResolvedImport::Member { file, name } => Some(function_id(&file, &name)),
        ResolvedImport::Module { .. } => None,
    }
}

/// Drop candidates whose span lies inside a longer candidate on the same line
pub fn longest_matches(candidates: Vec<CallCandidate>) -> Vec<CallCandidate> {
    let kept: Vec<bool> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            !candidates.iter().enumerate().any(|(j, other)| {
                i != j
                    && other.line_offset == c.line_offset
                    && other.span.0 <= c.span.0
                    && c.span.1 <= other.span.1
                    && (other.span.1 - other.span.0) > (c.span.1 - c.span.0)
            })
        })
        .collect();

    candidates
        .into_iter()
        .zip(kept)
        .filter_map(|(c, keep)| keep.then_some(c))
        .collect()
}

// ---------------------------------------------------------------------------
// Tokenize pass
// ---------------------------------------------------------------------------

fn is_ident_start(b: u8) -> bool {
    b == b'_' || b.is_ascii_alphabetic() || b >= 0x80
}

fn is_ident_char(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}

/// Characters that end a `<file>::` prefix when scanning backwards
fn is_prefix_boundary(b: u8) -> bool {
    b.is_ascii_whitespace() || b"()[]{},;=+*%<>!&|^~@\"'".contains(&b)
}

/// Every identifier directly followed by `(` outside strings, comments and `def` lines
pub fn scan_call_candidates(body: &str) -> Vec<CallCandidate> {
    let bytes = body.as_bytes();
    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(body.match_indices('\n').map(|(i, _)| i + 1))
        .collect();
    let def_lines: HashSet<usize> = body
        .split('\n')
        .enumerate()
        .filter(|(_, line)| {
            let t = line.trim_start();
            t.starts_with("def ") || t.starts_with("async def ")
        })
        .map(|(i, _)| i)
        .collect();

    let mut candidates = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b == b'#' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if b == b'"' || b == b'\'' {
            i = skip_string(bytes, i);
        } else if b.is_ascii_digit() {
            while i < bytes.len() && (is_ident_char(bytes[i]) || bytes[i] == b'.') {
                i += 1;
            }
        } else if is_ident_start(b) {
            let start = i;
            while i < bytes.len() && is_ident_char(bytes[i]) {
                i += 1;
            }
            let name = &body[start..i];

            let mut j = i;
            while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
                j += 1;
            }
            if j >= bytes.len() || bytes[j] != b'(' || PYTHON_KEYWORDS.contains(&name) {
                continue;
            }

            let line_offset = line_starts.partition_point(|&s| s <= start) - 1;
            if def_lines.contains(&line_offset) || follows_word(body, start, "class") {
                continue;
            }

            let Some((form, span_start)) = callee_form(body, start) else {
                continue;
            };

            candidates.push(CallCandidate {
                line_offset,
                column: start - line_starts[line_offset] + 1,
                name: name.to_string(),
                form,
                span: (span_start, i),
                args_text: balanced_args(body, j),
            });
        } else {
            i += 1;
        }
    }

    candidates
}

/// Index just past the string literal opening at `start`
fn skip_string(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let triple = bytes.len() >= start + 3 && bytes[start + 1] == quote && bytes[start + 2] == quote;
    let mut i = if triple { start + 3 } else { start + 1 };

    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\\' {
            i += 2;
            continue;
        }
        if triple {
            if b == quote && bytes.get(i + 1) == Some(&quote) && bytes.get(i + 2) == Some(&quote) {
                return i + 3;
            }
        } else if b == quote {
            return i + 1;
        } else if b == b'\n' {
            // Unterminated single-line string
            return i;
        }
        i += 1;
    }
    bytes.len()
}

fn follows_word(body: &str, start: usize, word: &str) -> bool {
    let before = body[..start].trim_end_matches([' ', '\t']);
    before.ends_with(word)
        && before[..before.len() - word.len()]
            .chars()
            .last()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_'))
}

/// Classify the expression in front of the name at `start`; `None` for calls on arbitrary expressions
fn callee_form(body: &str, start: usize) -> Option<(CalleeForm, usize)> {
    let bytes = body.as_bytes();

    if start >= 2 && &body[start - 2..start] == ID_SEPARATOR {
        let mut k = start - 2;
        while k > 0 && !is_prefix_boundary(bytes[k - 1]) {
            k -= 1;
        }
        if k < start - 2 {
            return Some((CalleeForm::Qualified(body[k..start - 2].to_string()), k));
        }
        return Some((CalleeForm::Bare, start));
    }

    if start == 0 || bytes[start - 1] != b'.' {
        return Some((CalleeForm::Bare, start));
    }

    // Walk back over a dotted identifier chain
    let mut k = start - 1;
    loop {
        let end = k;
        while k > 0 && is_ident_char(bytes[k - 1]) {
            k -= 1;
        }
        if k == end || bytes[k].is_ascii_digit() {
            return None;
        }
        if k > 0 && bytes[k - 1] == b'.' {
            k -= 1;
            continue;
        }
        if k > 0 && matches!(bytes[k - 1], b')' | b']' | b'"' | b'\'') {
            return None;
        }
        break;
    }

    Some((CalleeForm::Attribute(body[k..start - 1].to_string()), k))
}

/// Text inside the parentheses opening at `open`, which may span lines
fn balanced_args(body: &str, open: usize) -> String {
    let bytes = body.as_bytes();
    let mut depth = 0usize;
    let mut i = open;

    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return body[open + 1..i].to_string();
                }
            }
            _ => {}
        }
        i += 1;
    }

    body[open + 1..].to_string()
}
