use clap::{Parser, Subcommand};
use std::path::PathBuf;
use anyhow::{bail, Result};

use flowlens::core::{DiffTarget, Engine};
use flowlens::server;

#[derive(Parser)]
#[command(name = "flowlens")]
#[command(about = "See what a change calls, then step through it")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default flowlens.toml
    Init {
        /// Target directory (defaults to current directory)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },

    /// Find changed functions, their call graph and parent functions
    Analyze {
        /// Repository to analyze (defaults to project.repo_root)
        #[arg(short, long)]
        repo: Option<PathBuf>,

        /// Revision range such as main..HEAD
        #[arg(long, conflicts_with = "staged")]
        range: Option<String>,

        /// Only staged changes
        #[arg(long)]
        staged: bool,

        /// Artifact directory (defaults to output.artifacts_dir)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Do not write functions.json / call_graph.json / parent_functions.json
        #[arg(long)]
        no_artifacts: bool,
    },

    /// Trace a function up to a line and print the events
    Trace {
        /// Qualified id, <file>::<function>
        #[arg(long)]
        entry: String,

        #[arg(long)]
        stop_line: usize,

        /// Call arguments as {"args": [...], "kwargs": {...}}
        #[arg(long)]
        args: Option<String>,
    },

    /// Print a function's declared parameter names
    Signature {
        /// Qualified id, <file>::<function>
        #[arg(long)]
        entry: String,
    },

    /// Answer JSON-lines commands on stdin/stdout
    Serve,
}

impl Cli {
    pub async fn execute(self, mut engine: Engine) -> Result<()> {
        match self.command {
            Commands::Init { path } => {
                let config_path = engine.init(path).await?;
                println!("{}", config_path.display());
                Ok(())
            }
            Commands::Analyze { repo, range, staged, output, no_artifacts } => {
                if no_artifacts && output.is_some() {
                    bail!("--output has no effect with --no-artifacts");
                }
                let target = match range {
                    Some(range) => DiffTarget::Range(range),
                    None if staged => DiffTarget::Staged,
                    None => DiffTarget::WorkingTree,
                };
                if no_artifacts {
                    engine.disable_artifacts();
                }
                let report = engine.get_changed_functions(repo, target, output).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
            Commands::Trace { entry, stop_line, args } => {
                let events = engine.get_next_tracer_event(&entry, stop_line, args.as_deref()).await;
                println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "events": events }))?);
                Ok(())
            }
            Commands::Signature { entry } => {
                let signature = engine.get_function_signature(&entry).await;
                println!("{}", serde_json::to_string_pretty(&signature)?);
                Ok(())
            }
            Commands::Serve => server::serve_stdio(&mut engine).await,
        }
    }
}
