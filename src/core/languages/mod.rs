//! Language-specific parsers for the source indexer
//!
//! Each language gets its own module with a consistent interface for turning
//! source text into line-addressable function definitions and an import table.

mod python;

pub use python::PythonParser;

use std::path::Path;

use crate::error::Result;
use super::{FunctionDef, ImportBinding};

/// Everything the indexer extracts from one source file
#[derive(Debug, Clone, Default)]
pub struct ParsedSource {
    pub functions: Vec<FunctionDef>,
    pub imports: Vec<ImportBinding>,
}

/// Trait that all language parsers must implement
pub trait LanguageParser {
    /// Parse source code into function definitions and import bindings.
    /// Fails with a parse error when the source is not syntactically valid.
    fn parse(&mut self, content: &str, file_path: &Path) -> Result<ParsedSource>;

    /// Get the file extensions this parser handles
    fn file_extensions(&self) -> &[&str];

    /// Get the language name
    fn language_name(&self) -> &str;
}
