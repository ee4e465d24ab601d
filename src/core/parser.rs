use std::collections::HashMap;
use std::path::{Path, PathBuf};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AnalysisConfig;
use crate::error::{FlowlensError, Result};
use super::imports::ImportTable;
use super::languages::{LanguageParser, PythonParser};

/// Separator between the file part and the function part of a qualified id
pub const ID_SEPARATOR: &str = "::";

/// Build the globally unique `<file>::<function>` identity
pub fn function_id(file_path: &Path, name: &str) -> String {
    format!("{}{}{}", file_path.display(), ID_SEPARATOR, name)
}

/// Split a qualified id back into its file and function parts
pub fn split_function_id(id: &str) -> Result<(PathBuf, String)> {
    match id.rsplit_once(ID_SEPARATOR) {
        Some((file, name)) if !file.is_empty() && !name.is_empty() => {
            Ok((PathBuf::from(file), name.to_string()))
        }
        _ => Err(FlowlensError::InvalidFunctionId(id.to_string())),
    }
}

/// A function definition extracted from one source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDef {
    /// Absolute path of the defining file
    pub file_path: PathBuf,

    pub name: String,

    /// First line of the `def` (1-based, inclusive)
    pub start_line: usize,

    /// Last line of the body (1-based, inclusive)
    pub end_line: usize,

    /// Raw source lines `start_line..=end_line`
    pub body_text: String,

    pub param_names: Vec<String>,
}

impl FunctionDef {
    pub fn id(&self) -> String {
        function_id(&self.file_path, &self.name)
    }

    pub fn contains_line(&self, line: usize) -> bool {
        line >= self.start_line && line <= self.end_line
    }
}

/// One name bound by an import statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportBinding {
    /// Name visible in the importing file
    pub local_name: String,

    /// Module as written, possibly relative (`.util`, `..pkg`)
    pub module: String,

    /// Imported member for `from m import x`; `None` for `import m`
    pub symbol: Option<String>,

    pub line: usize,
}

/// Represents an indexed source file
#[derive(Debug, Clone)]
pub struct ParsedFile {
    /// Absolute file path
    pub path: PathBuf,

    /// Programming language detected
    pub language: String,

    /// Every function definition, in source order
    pub functions: Vec<FunctionDef>,

    /// Import bindings keyed by local name
    pub imports: ImportTable,
}

impl ParsedFile {
    /// Names of every function defined in this file
    pub fn local_function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(|f| f.name.as_str())
    }
}

/// Source indexer that delegates to language-specific parsers
pub struct CodeParser {
    config: AnalysisConfig,
}

impl CodeParser {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Index a single source file from disk
    pub fn index<P: AsRef<Path>>(&self, file_path: P) -> Result<ParsedFile> {
        let path = file_path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if metadata.len() as usize > self.config.max_file_size {
            return Err(FlowlensError::Parse {
                path: path.to_path_buf(),
                message: "file exceeds maximum size limit".to_string(),
            });
        }

        let source_content = std::fs::read_to_string(path)?;
        self.index_source(path, &source_content)
    }

    /// Index source text that is not (or no longer) on disk
    pub fn index_source(&self, path: &Path, content: &str) -> Result<ParsedFile> {
        let mut parser = self.parser_for(path)?;
        let parsed = parser.parse(content, path)?;

        debug!(
            "Indexed {}: {} functions, {} imports",
            path.display(),
            parsed.functions.len(),
            parsed.imports.len()
        );

        Ok(ParsedFile {
            path: path.to_path_buf(),
            language: parser.language_name().to_string(),
            functions: parsed.functions,
            imports: ImportTable::from_bindings(parsed.imports),
        })
    }

    /// Index many files in parallel; each file succeeds or fails independently
    pub fn index_files(&self, paths: &[PathBuf]) -> HashMap<PathBuf, Result<ParsedFile>> {
        paths
            .par_iter()
            .map(|path| {
                let result = self.index(path);
                if let Err(e) = &result {
                    warn!("Skipping {}: {}", path.display(), e);
                }
                (path.clone(), result)
            })
            .collect()
    }

    /// Fresh parser per call: tree-sitter parsers are not shareable across threads
    fn parser_for(&self, path: &Path) -> Result<Box<dyn LanguageParser>> {
        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        match extension {
            "py" => Ok(Box::new(PythonParser::new()?)),
            _ => Err(FlowlensError::Parse {
                path: path.to_path_buf(),
                message: "Could not detect language".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn function_id_round_trip() {
        let id = function_id(Path::new("/repo/pkg/file.py"), "main");
        assert_eq!(id, "/repo/pkg/file.py::main");

        let (file, name) = split_function_id(&id).unwrap();
        assert_eq!(file, PathBuf::from("/repo/pkg/file.py"));
        assert_eq!(name, "main");
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!(split_function_id("no_separator").is_err());
        assert!(split_function_id("file.py::").is_err());
        assert!(split_function_id("::name").is_err());
    }

    #[test]
    fn index_files_keeps_going_past_a_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.py");
        let bad = dir.path().join("bad.py");
        std::fs::write(&good, "def ok():\n    return 1\n").unwrap();
        std::fs::write(&bad, "def nope(:\n").unwrap();

        let parser = CodeParser::new(&Config::default().analysis);
        let results = parser.index_files(&[good.clone(), bad.clone()]);

        let parsed = results[&good].as_ref().unwrap();
        assert_eq!(parsed.functions[0].name, "ok");
        assert_eq!(parsed.functions[0].id(), function_id(&good, "ok"));
        assert!(matches!(results[&bad], Err(FlowlensError::Parse { .. })));
    }

    #[test]
    fn oversized_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.py");
        std::fs::write(&path, "x = 1\n".repeat(10)).unwrap();

        let mut config = Config::default().analysis;
        config.max_file_size = 8;
        assert!(CodeParser::new(&config).index(&path).is_err());
    }
}
