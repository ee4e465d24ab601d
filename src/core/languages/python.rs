use std::path::Path;
use tree_sitter::{Node, Parser};

use crate::error::{FlowlensError, Result};
use super::super::{FunctionDef, ImportBinding};
use super::{LanguageParser, ParsedSource};

/// Python-specific parser using Tree-sitter
pub struct PythonParser {
    parser: Parser,
}

impl PythonParser {
    pub fn new() -> Result<Self> {
        let mut parser = Parser::new();
        let python_language = tree_sitter_python::language();
        parser.set_language(&python_language)
            .map_err(|e| FlowlensError::Config(format!("Failed to set Python language: {}", e)))?;

        Ok(Self { parser })
    }
}

impl LanguageParser for PythonParser {
    fn parse(&mut self, content: &str, file_path: &Path) -> Result<ParsedSource> {
        let tree = self.parser.parse(content, None)
            .ok_or_else(|| parse_error(file_path, "tree-sitter returned no tree".to_string()))?;

        let root_node = tree.root_node();
        if root_node.has_error() {
            let (row, column) = first_error_position(root_node).unwrap_or((0, 0));
            return Err(parse_error(
                file_path,
                format!("invalid syntax near line {}, column {}", row + 1, column + 1),
            ));
        }

        // Keep '\r' and indentation so bodies match the file byte-for-byte
        let lines: Vec<&str> = content.split('\n').collect();
        let mut parsed = ParsedSource::default();
        self.extract_python_items(root_node, content, &lines, file_path, &mut parsed);

        Ok(parsed)
    }

    fn file_extensions(&self) -> &[&str] {
        &["py"]
    }

    fn language_name(&self) -> &str {
        "python"
    }
}

impl PythonParser {
    /// Walk the AST collecting functions (top-level and nested) and imports
    fn extract_python_items(
        &self,
        node: Node,
        source: &str,
        lines: &[&str],
        file_path: &Path,
        parsed: &mut ParsedSource,
    ) {
        let mut cursor = node.walk();

        for child in node.children(&mut cursor) {
            match child.kind() {
                "function_definition" => {
                    if let Some(function) = self.parse_python_function(child, source, lines, file_path) {
                        parsed.functions.push(function);
                    }
                    // Nested definitions live inside the body
                    self.extract_python_items(child, source, lines, file_path, parsed);
                }
                "import_statement" | "import_from_statement" => {
                    let line = child.start_position().row + 1;
                    parsed.imports.extend(parse_import_statement(node_text(child, source), line));
                }
                _ => {
                    self.extract_python_items(child, source, lines, file_path, parsed);
                }
            }
        }
    }

    /// Parse a Python function definition
    fn parse_python_function(
        &self,
        node: Node,
        source: &str,
        lines: &[&str],
        file_path: &Path,
    ) -> Option<FunctionDef> {
        let name = node_text(node.child_by_field_name("name")?, source).to_string();

        let start_line = node.start_position().row + 1;
        let end = node.end_position();
        // A node ending at column 0 finishes on the previous line
        let end_line = if end.column == 0 && end.row + 1 > start_line {
            end.row
        } else {
            end.row + 1
        };

        let body_text = lines
            .get(start_line - 1..end_line.min(lines.len()))
            .map(|slice| slice.join("\n"))
            .unwrap_or_default();

        let param_names = node
            .child_by_field_name("parameters")
            .map(|params| extract_param_names(params, source))
            .unwrap_or_default();

        Some(FunctionDef {
            file_path: file_path.to_path_buf(),
            name,
            start_line,
            end_line,
            body_text,
            param_names,
        })
    }
}

fn parse_error(file_path: &Path, message: String) -> FlowlensError {
    FlowlensError::Parse {
        path: file_path.to_path_buf(),
        message,
    }
}

fn node_text<'a>(node: Node, source: &'a str) -> &'a str {
    &source[node.byte_range()]
}

fn first_error_position(node: Node) -> Option<(usize, usize)> {
    if node.is_error() || node.is_missing() {
        let pos = node.start_position();
        return Some((pos.row, pos.column));
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.has_error() {
            if let Some(pos) = first_error_position(child) {
                return Some(pos);
            }
        }
    }
    None
}

/// Declared parameter names in order; `*args` / `**kwargs` are skipped
fn extract_param_names(params: Node, source: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut cursor = params.walk();

    for param in params.named_children(&mut cursor) {
        match param.kind() {
            "identifier" => names.push(node_text(param, source).to_string()),
            "typed_parameter" => {
                if let Some(first) = param.named_child(0) {
                    if first.kind() == "identifier" {
                        names.push(node_text(first, source).to_string());
                    }
                }
            }
            "default_parameter" | "typed_default_parameter" => {
                if let Some(name) = param.child_by_field_name("name") {
                    if name.kind() == "identifier" {
                        names.push(node_text(name, source).to_string());
                    }
                }
            }
            _ => {}
        }
    }

    names
}

/// Turn one `import` / `from ... import` statement into local name bindings
pub(crate) fn parse_import_statement(text: &str, line: usize) -> Vec<ImportBinding> {
    let cleaned: String = text
        .lines()
        .map(|l| l.split('#').next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join(" ")
        .replace(|c: char| matches!(c, '\\' | '(' | ')'), " ");
    let cleaned = cleaned.trim().trim_end_matches(';').trim();

    if let Some(rest) = cleaned.strip_prefix("import ") {
        return rest
            .split(',')
            .filter_map(|part| {
                let mut words = part.split_whitespace();
                let module = words.next()?;
                match (words.next(), words.next()) {
                    (Some("as"), Some(alias)) => Some(ImportBinding {
                        local_name: alias.to_string(),
                        module: module.to_string(),
                        symbol: None,
                        line,
                    }),
                    // `import a.b` binds the top-level package `a`
                    _ => {
                        let top = module.split('.').next().unwrap_or(module);
                        Some(ImportBinding {
                            local_name: top.to_string(),
                            module: top.to_string(),
                            symbol: None,
                            line,
                        })
                    }
                }
            })
            .collect();
    }

    if let Some(rest) = cleaned.strip_prefix("from ") {
        if let Some((module, names)) = rest.split_once(" import ") {
            let module = module.trim();
            return names
                .split(',')
                .filter_map(|part| {
                    let mut words = part.split_whitespace();
                    let symbol = words.next()?;
                    if symbol == "*" {
                        return None;
                    }
                    let local_name = match (words.next(), words.next()) {
                        (Some("as"), Some(alias)) => alias,
                        _ => symbol,
                    };
                    Some(ImportBinding {
                        local_name: local_name.to_string(),
                        module: module.to_string(),
                        symbol: Some(symbol.to_string()),
                        line,
                    })
                })
                .collect();
        }
    }

    Vec::new()
}
