// src/core/mod.rs
mod engine;
mod parser;
mod imports;
mod differ;
mod qualifier;
mod artifacts;

// Call graph over changed functions
mod call_graph;

// Language-specific parsers
mod languages;

// Execution tracing
pub mod tracer;

pub use parser::{function_id, split_function_id, CodeParser, FunctionDef, ImportBinding, ParsedFile, ID_SEPARATOR};
pub use imports::{resolve_module, ImportTable, ResolvedImport};
pub use differ::{
    changed_functions_for_file, is_important_hunk, parse_unified_diff, ChangedFunction, DiffAnalysis, DiffAnalyzer,
    DiffTarget, FileDiff, FileStatus,
};
pub use qualifier::{qualify, qualify_all, qualify_body, scan_call_candidates, CallSite, FileContext, QualifiedFunction};
pub use artifacts::{write_artifacts, ArtifactPaths, CALL_GRAPH_FILE, FUNCTIONS_FILE, PARENTS_FILE};
pub use call_graph::{CallEdge, CallGraph, CallGraphStats, CallNode};
pub use languages::{LanguageParser, ParsedSource, PythonParser};

// Export the main engine
pub use engine::{AnalysisReport, Engine, SignatureResponse};
