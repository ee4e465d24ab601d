use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{FlowlensError, Result};

/// Environment variable that overrides the tracer runtime program
pub const PYTHON_ENV_VAR: &str = "FLOWLENS_PYTHON";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Project configuration
    pub project: ProjectConfig,

    /// Diff and static analysis settings
    pub analysis: AnalysisConfig,

    /// Execution tracer settings
    pub tracer: TracerConfig,

    /// Artifact output settings
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Repository analyzed when no path is given on the command line
    pub repo_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// File extensions handed to the source indexer
    pub file_extensions: Vec<String>,

    /// Maximum file size to parse (in bytes)
    pub max_file_size: usize,

    /// Ignore whitespace-only and blank-line changes in the diff
    pub ignore_whitespace: bool,

    /// Treat untracked files as fully changed (working-tree diffs only)
    pub include_untracked: bool,

    /// Drop hunks that only touch a `def` line cosmetically
    pub skip_trivial_hunks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerConfig {
    /// Runtime program that executes traced code
    pub program: String,

    /// Arguments placed before `--repo-root <root>`
    pub args: Vec<String>,

    /// Bounded wait for a single request
    pub timeout_ms: u64,

    /// Upper bound on the in-memory session event log
    pub max_session_events: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving functions.json, call_graph.json and parent_functions.json
    pub artifacts_dir: PathBuf,

    /// Whether analysis writes artifact snapshots at all
    pub write_artifacts: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: ProjectConfig {
                repo_root: PathBuf::from("."),
            },
            analysis: AnalysisConfig {
                file_extensions: vec!["py".to_string()],
                max_file_size: 1024 * 1024, // 1MB
                ignore_whitespace: true,
                include_untracked: true,
                skip_trivial_hunks: false,
            },
            tracer: TracerConfig {
                program: "python3".to_string(),
                args: vec!["tools/trace_helper.py".to_string()],
                timeout_ms: 10_000,
                max_session_events: 10_000,
            },
            output: OutputConfig {
                artifacts_dir: PathBuf::from(".flowlens"),
                write_artifacts: true,
            },
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| FlowlensError::Config(e.to_string()))?;
        Ok(config.with_env_overrides())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| FlowlensError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration with fallback to default
    pub fn load_or_default<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        match path {
            Some(p) => {
                if p.as_ref().exists() {
                    Self::load(p)
                } else {
                    Ok(Self::default().with_env_overrides())
                }
            }
            None => {
                let candidates = [
                    "Flowlens.toml",
                    "flowlens.toml",
                    ".flowlens.toml",
                ];

                for candidate in &candidates {
                    if Path::new(candidate).exists() {
                        return Self::load(candidate);
                    }
                }

                Ok(Self::default().with_env_overrides())
            }
        }
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(program) = std::env::var(PYTHON_ENV_VAR) {
            if !program.trim().is_empty() {
                self.tracer.program = program;
            }
        }
        self
    }
}

impl AnalysisConfig {
    /// Whether a path has one of the configured source extensions
    pub fn is_source_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| self.file_extensions.iter().any(|e| e == ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_round_trip_keeps_tracer_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowlens.toml");

        let mut config = Config::default();
        config.tracer.timeout_ms = 2500;
        config.analysis.skip_trivial_hunks = true;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.tracer.timeout_ms, 2500);
        assert!(loaded.analysis.skip_trivial_hunks);
        assert_eq!(loaded.output.artifacts_dir, PathBuf::from(".flowlens"));
    }

    #[test]
    fn missing_explicit_path_falls_back_to_default() {
        let config = Config::load_or_default(Some("/definitely/not/here.toml")).unwrap();
        assert_eq!(config.analysis.file_extensions, vec!["py".to_string()]);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowlens.toml");
        std::fs::write(&path, "project = 3").unwrap();

        assert!(matches!(Config::load(&path), Err(FlowlensError::Config(_))));
    }

    #[test]
    fn source_extension_filter() {
        let config = Config::default();
        assert!(config.analysis.is_source_file(Path::new("pkg/mod.py")));
        assert!(!config.analysis.is_source_file(Path::new("README.md")));
    }
}
