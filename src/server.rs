//! JSON-lines command server over stdin/stdout.
//!
//! Each request line is `{"command": "...", "params": {...}}`; each response
//! line is `{"status":"success","data":...}` or `{"status":"error","message":...}`.

use std::path::PathBuf;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::core::{DiffTarget, Engine};

#[derive(Debug, Deserialize)]
struct CommandReq {
    command: String,
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChangedFunctionsParams {
    repo_path: Option<PathBuf>,
    range: Option<String>,
    #[serde(default)]
    staged: bool,
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct TracerEventParams {
    entry_function_id: String,
    stop_line: usize,
    /// JSON text or an inline `{"args":[],"kwargs":{}}` object
    arguments_json: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CallSiteParams {
    caller_id: String,
    call_line: usize,
    callee_id: String,
    stop_line: usize,
}

#[derive(Debug, Deserialize)]
struct SignatureParams {
    entry_function_id: String,
}

/// Serve requests from the process's stdin until EOF or `SHUTDOWN`
pub async fn serve_stdio(engine: &mut Engine) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    serve(engine, stdin, stdout).await
}

pub async fn serve<R, W>(engine: &mut Engine, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!("Flowlens server ready on stdio");
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        debug!("<- {}", trimmed);

        let request = serde_json::from_str::<CommandReq>(trimmed).context("Invalid JSON format");
        let shutdown = matches!(&request, Ok(req) if req.command == "SHUTDOWN");

        let response = match request {
            Ok(req) => process_command(engine, req).await,
            Err(e) => Err(e),
        };
        let response = match response {
            Ok(data) => json!({
                "status": "success",
                "data": data
            }),
            Err(e) => json!({
                "status": "error",
                "message": format!("{:#}", e)
            }),
        };

        let response_str = serde_json::to_string(&response)?;
        writer.write_all(response_str.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        if shutdown {
            info!("Shutdown requested");
            break;
        }
    }

    Ok(())
}

fn params_of<T: for<'de> Deserialize<'de>>(params: Option<Value>, command: &str) -> Result<T> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .with_context(|| format!("Invalid params for {}", command))
}

async fn process_command(engine: &mut Engine, req: CommandReq) -> Result<Value> {
    match req.command.as_str() {
        "PING" => Ok(json!("PONG")),
        "GET_CHANGED_FUNCTIONS" => {
            let params: ChangedFunctionsParams = params_of(req.params, &req.command)?;
            let target = match (params.range, params.staged) {
                (Some(_), true) => bail!("'range' and 'staged' are mutually exclusive"),
                (Some(range), false) => DiffTarget::Range(range),
                (None, true) => DiffTarget::Staged,
                (None, false) => DiffTarget::WorkingTree,
            };
            let report = engine
                .get_changed_functions(params.repo_path, target, params.output_dir)
                .await?;
            Ok(serde_json::to_value(report)?)
        }
        "GET_NEXT_TRACER_EVENT" => {
            let params: TracerEventParams = params_of(req.params, &req.command)?;
            let arguments_json = match params.arguments_json {
                None | Some(Value::Null) => None,
                Some(Value::String(text)) => Some(text),
                Some(other) => Some(other.to_string()),
            };
            let events = engine
                .get_next_tracer_event(&params.entry_function_id, params.stop_line, arguments_json.as_deref())
                .await;
            Ok(json!({ "events": events }))
        }
        "TRACE_CALL_SITE" => {
            let params: CallSiteParams = params_of(req.params, &req.command)?;
            let traced = engine
                .trace_call_site(&params.caller_id, params.call_line, &params.callee_id, params.stop_line)
                .await?;
            Ok(serde_json::to_value(traced)?)
        }
        "GET_FUNCTION_SIGNATURE" => {
            let params: SignatureParams = params_of(req.params, &req.command)?;
            Ok(serde_json::to_value(engine.get_function_signature(&params.entry_function_id).await)?)
        }
        "RESET" => {
            engine.reset().await;
            Ok(json!("OK"))
        }
        "SHUTDOWN" => Ok(json!("Shutting down...")),
        _ => bail!("Unknown command: {}", req.command),
    }
}
