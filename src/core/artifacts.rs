//! JSON snapshots of an analysis pass for external inspection.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use super::call_graph::CallGraph;
use super::differ::FileStatus;

pub const FUNCTIONS_FILE: &str = "functions.json";
pub const CALL_GRAPH_FILE: &str = "call_graph.json";
pub const PARENTS_FILE: &str = "parent_functions.json";

#[derive(Debug, Serialize)]
struct FunctionRecord<'a> {
    body_text: &'a str,
    start_line: usize,
    end_line: usize,
    file_path: &'a Path,
    file_status: FileStatus,
    changed_lines: &'a BTreeSet<usize>,
    param_names: &'a [String],
}

/// Paths of the files written by [`write_artifacts`]
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactPaths {
    pub functions: PathBuf,
    pub call_graph: PathBuf,
    pub parents: PathBuf,
}

/// Replace the three snapshot files in `dir`
pub fn write_artifacts(dir: &Path, graph: &CallGraph, parent_ids: &[String]) -> Result<ArtifactPaths> {
    std::fs::create_dir_all(dir)?;

    let functions: BTreeMap<&str, FunctionRecord> = graph
        .nodes
        .iter()
        .map(|(id, node)| {
            let def = &node.function.function;
            (
                id.as_str(),
                FunctionRecord {
                    body_text: &def.body_text,
                    start_line: def.start_line,
                    end_line: def.end_line,
                    file_path: &def.file_path,
                    file_status: node.function.file_status,
                    changed_lines: &node.function.changed_lines,
                    param_names: &def.param_names,
                },
            )
        })
        .collect();

    let paths = ArtifactPaths {
        functions: dir.join(FUNCTIONS_FILE),
        call_graph: dir.join(CALL_GRAPH_FILE),
        parents: dir.join(PARENTS_FILE),
    };

    write_json_atomic(&paths.functions, &functions)?;
    write_json_atomic(&paths.call_graph, &graph.adjacency_map())?;
    write_json_atomic(&paths.parents, &parent_ids)?;

    info!("Wrote analysis artifacts to {}", dir.display());
    Ok(paths)
}

/// Write to a sibling temp file, then rename over the target
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::differ::ChangedFunction;
    use crate::core::qualifier::{CallSite, QualifiedFunction};
    use crate::core::FunctionDef;

    #[test]
    fn snapshots_replace_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");

        let main = QualifiedFunction {
            function: ChangedFunction {
                function: FunctionDef {
                    file_path: PathBuf::from("/repo/file.py"),
                    name: "main".to_string(),
                    start_line: 4,
                    end_line: 5,
                    body_text: "def main():\n    return helper(2)".to_string(),
                    param_names: vec![],
                },
                changed_lines: BTreeSet::from([5]),
                file_status: FileStatus::Modified,
            },
            call_sites: vec![CallSite {
                line: 5,
                column: 12,
                name: "helper".to_string(),
                receiver: None,
                callee_id: Some("/repo/file.py::helper".to_string()),
                args_text: "2".to_string(),
            }],
            qualified_body: String::new(),
        };
        let graph = CallGraph::build(vec![main]);

        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join(PARENTS_FILE), "[\"stale\"]").unwrap();

        let paths = write_artifacts(&out, &graph, &graph.parent_ids()).unwrap();

        let parents: Vec<String> = serde_json::from_str(&std::fs::read_to_string(&paths.parents).unwrap()).unwrap();
        assert_eq!(parents, vec!["/repo/file.py::main"]);

        let edges: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&paths.call_graph).unwrap()).unwrap();
        assert_eq!(edges["/repo/file.py::main"][0], "/repo/file.py::helper");

        let functions: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&paths.functions).unwrap()).unwrap();
        assert_eq!(functions["/repo/file.py::main"]["start_line"], 4);
        assert_eq!(functions["/repo/file.py::main"]["file_status"], "modified");

        assert!(!out.join("parent_functions.json.tmp").exists());
    }
}
