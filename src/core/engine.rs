// src/core/engine.rs
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::FlowlensError;
use super::artifacts::{write_artifacts, ArtifactPaths};
use super::call_graph::{CallGraph, CallGraphStats};
use super::differ::{ChangedFunction, DiffAnalyzer, DiffTarget};
use super::qualifier::qualify_all;
use super::tracer::{CallSiteTrace, ProcessBackend, TraceArguments, TraceBackend, TraceEvent, TracerEngine};

/// Static view produced by one analysis pass
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub repo_root: PathBuf,
    pub changed_functions: Vec<ChangedFunction>,
    pub call_graph: CallGraph,
    pub parent_ids: Vec<String>,
    pub statistics: CallGraphStats,
    /// Per-file problems that did not abort the pass
    pub warnings: Vec<String>,
    pub artifacts: Option<ArtifactPaths>,
}

/// `{param_names}` on success, `{error}` otherwise
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SignatureResponse {
    Found { param_names: Vec<String> },
    Failed { error: String },
}

/// Main orchestration engine: static analysis plus the tracing loop
pub struct Engine {
    config: Config,
    analyzer: Arc<DiffAnalyzer>,
    tracer: TracerEngine,
    /// Root the process backend was started for; `None` for injected backends
    tracer_root: Option<PathBuf>,
    last_analysis: Option<AnalysisReport>,
}

impl Engine {
    /// Create an engine whose tracer spawns the configured runtime
    pub async fn new(config_path: Option<&Path>) -> Result<Self> {
        let config = Config::load_or_default(config_path)?;
        debug!("Loaded configuration: {:?}", config);

        let root = std::fs::canonicalize(&config.project.repo_root)
            .unwrap_or_else(|_| config.project.repo_root.clone());
        let backend = Arc::new(ProcessBackend::new(&config.tracer, &root));
        let mut engine = Self::with_backend(config, backend);
        engine.tracer_root = Some(root);
        Ok(engine)
    }

    /// Create an engine around an arbitrary trace backend
    pub fn with_backend(config: Config, backend: Arc<dyn TraceBackend>) -> Self {
        Self {
            analyzer: Arc::new(DiffAnalyzer::new(&config.analysis)),
            tracer: TracerEngine::new(backend, config.tracer.max_session_events),
            tracer_root: None,
            last_analysis: None,
            config,
        }
    }

    pub fn last_analysis(&self) -> Option<&AnalysisReport> {
        self.last_analysis.as_ref()
    }

    pub fn disable_artifacts(&mut self) {
        self.config.output.write_artifacts = false;
    }

    /// Diff → qualify → call graph → parents, then snapshot artifacts
    pub async fn get_changed_functions(
        &mut self,
        repo: Option<PathBuf>,
        target: DiffTarget,
        output_dir: Option<PathBuf>,
    ) -> Result<AnalysisReport> {
        let repo = repo.unwrap_or_else(|| self.config.project.repo_root.clone());
        let repo_root = std::fs::canonicalize(&repo)
            .map_err(|e| FlowlensError::Diff(format!("{}: {}", repo.display(), e)))?;

        info!("Analyzing changes in {} ({:?})", repo_root.display(), target);

        let analyzer = Arc::clone(&self.analyzer);
        let root = repo_root.clone();
        let analysis = tokio::task::spawn_blocking(move || analyzer.analyze(&root, &target))
            .await
            .context("analysis task panicked")??;

        for warning in &analysis.warnings {
            warn!("{}", warning);
        }

        let qualified = qualify_all(&analysis.changed_functions, &analysis.parsed_files, &repo_root);
        let call_graph = CallGraph::build(qualified);
        let parent_ids = call_graph.parent_ids();
        let statistics = call_graph.get_statistics();

        let artifacts = if self.config.output.write_artifacts {
            let dir = output_dir.unwrap_or_else(|| self.config.output.artifacts_dir.clone());
            Some(write_artifacts(&dir, &call_graph, &parent_ids)?)
        } else {
            None
        };

        self.retarget_tracer(&repo_root);

        let report = AnalysisReport {
            repo_root,
            changed_functions: analysis.changed_functions,
            call_graph,
            parent_ids,
            statistics,
            warnings: analysis.warnings,
            artifacts,
        };

        info!(
            "Analysis complete: {} changed functions, {} parents",
            report.changed_functions.len(),
            report.parent_ids.len()
        );
        self.last_analysis = Some(report.clone());
        Ok(report)
    }

    /// Point the process backend at a newly analyzed repository
    fn retarget_tracer(&mut self, repo_root: &Path) {
        let Some(current) = &self.tracer_root else {
            return;
        };
        if current == repo_root {
            return;
        }
        info!("Tracer now targets {}", repo_root.display());
        let backend = Arc::new(ProcessBackend::new(&self.config.tracer, repo_root));
        self.tracer = TracerEngine::new(backend, self.config.tracer.max_session_events);
        self.tracer_root = Some(repo_root.to_path_buf());
    }

    /// Trace one entry function up to `stop_line`; malformed arguments become an exception event
    pub async fn get_next_tracer_event(
        &self,
        entry_function_id: &str,
        stop_line: usize,
        arguments_json: Option<&str>,
    ) -> Vec<TraceEvent> {
        let arguments = match arguments_json.map(str::trim).filter(|s| !s.is_empty()) {
            None => None,
            Some(text) => match serde_json::from_str::<TraceArguments>(text) {
                Ok(arguments) => Some(arguments),
                Err(e) => {
                    let error = FlowlensError::TracerProtocol(format!("invalid arguments JSON: {}", e));
                    warn!("{}", error);
                    return vec![TraceEvent::Exception {
                        error_message: error.to_string(),
                        traceback_text: String::new(),
                        line: Some(stop_line),
                        filename: None,
                    }];
                }
            },
        };

        self.tracer
            .get_next_tracer_event(entry_function_id, stop_line, arguments)
            .await
    }

    pub async fn get_function_signature(&self, function_id: &str) -> SignatureResponse {
        match self.tracer.get_function_signature(function_id).await {
            Ok(signature) => SignatureResponse::Found {
                param_names: signature.param_names,
            },
            Err(e) => SignatureResponse::Failed { error: e.to_string() },
        }
    }

    /// Trace into `callee_id` from the call on `call_line` of `caller_id`, using the last analysis
    pub async fn trace_call_site(
        &self,
        caller_id: &str,
        call_line: usize,
        callee_id: &str,
        stop_line: usize,
    ) -> Result<CallSiteTrace> {
        let report = self
            .last_analysis
            .as_ref()
            .ok_or_else(|| anyhow!("no analysis has been run yet"))?;
        let node = report
            .call_graph
            .nodes
            .get(caller_id)
            .ok_or_else(|| anyhow!("{} is not a changed function", caller_id))?;
        let call_site = node
            .call_sites
            .iter()
            .find(|site| site.line == call_line && site.callee_id.as_deref() == Some(callee_id))
            .ok_or_else(|| anyhow!("no call to {} on line {} of {}", callee_id, call_line, caller_id))?;

        Ok(self.tracer.trace_call_site(caller_id, call_site, stop_line).await?)
    }

    pub async fn reset(&self) {
        self.tracer.reset().await;
    }

    /// Write a default configuration file
    pub async fn init(&self, path: Option<PathBuf>) -> Result<PathBuf> {
        let target_dir = match path {
            Some(path) => path,
            None => std::env::current_dir()?,
        };
        std::fs::create_dir_all(&target_dir)?;

        let config_path = target_dir.join("flowlens.toml");
        if config_path.exists() {
            info!("{} already exists, leaving it untouched", config_path.display());
            return Ok(config_path);
        }

        Config::default().save(&config_path)?;
        info!("Initialized Flowlens in: {}", target_dir.display());
        Ok(config_path)
    }
}
