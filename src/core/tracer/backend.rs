//! Execution backends behind the tracer protocol.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::config::TracerConfig;
use crate::error::{FlowlensError, Result};
use super::protocol::{
    normalize_events, ControlMessage, FunctionSignature, RuntimeMessage, TraceEvent, TraceRequest, WireRequest,
};

/// Lines of runtime stderr kept for synthetic exceptions
const STDERR_TAIL_LINES: usize = 20;

/// Something that can execute a traced call and look up signatures
#[async_trait]
pub trait TraceBackend: Send + Sync {
    /// Events for one request, normalised to end in `done` or an exception
    async fn run_trace(&self, request: &TraceRequest) -> Result<Vec<TraceEvent>>;

    async fn lookup_signature(&self, function_id: &str) -> Result<FunctionSignature>;
}

/// Raw result of one request/response exchange with the runtime
struct Exchange {
    messages: Vec<RuntimeMessage>,
    status: ExitStatus,
    stderr_tail: String,
}

/// Spawns `program args --repo-root <root>` once per request
pub struct ProcessBackend {
    program: String,
    args: Vec<String>,
    repo_root: PathBuf,
    timeout_ms: u64,
}

impl ProcessBackend {
    pub fn new(config: &TracerConfig, repo_root: &Path) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            repo_root: repo_root.to_path_buf(),
            timeout_ms: config.timeout_ms,
        }
    }

    async fn exchange(&self, request: &WireRequest<'_>) -> Result<Exchange> {
        let request_line = serde_json::to_string(request)?;

        info!("Spawning tracer: {} {:?}", self.program, self.args);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--repo-root")
            .arg(&self.repo_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FlowlensError::TracerSpawn(format!("{}: {}", self.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FlowlensError::TracerSpawn("Failed to get stdin handle".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FlowlensError::TracerSpawn("Failed to get stdout handle".to_string()))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = BufReader::new(stderr).read_to_string(&mut buf).await;
                buf
            })
        });

        let io = async {
            if let Err(e) = write_request(stdin, &request_line).await {
                // The runtime may exit before reading; its exit status tells the rest
                debug!("Failed to write tracer request: {}", e);
            }

            let mut lines = BufReader::new(stdout).lines();
            let mut messages = Vec::new();
            while let Some(line) = lines.next_line().await? {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<RuntimeMessage>(trimmed) {
                    Ok(message) => {
                        let done = matches!(message, RuntimeMessage::Trace(TraceEvent::Done));
                        messages.push(message);
                        if done {
                            break;
                        }
                    }
                    // Anything shaped like a protocol object must parse
                    Err(e) if trimmed.starts_with('{') => {
                        let error = FlowlensError::TracerProtocol(format!("unparseable event ({}): {}", e, trimmed));
                        warn!("{}", error);
                        messages.push(RuntimeMessage::Control(ControlMessage::Error {
                            message: error.to_string(),
                        }));
                    }
                    Err(_) => debug!("tracer -> {}", trimmed),
                }
            }

            let status = child.wait().await?;
            Ok::<_, FlowlensError>((messages, status))
        };

        let outcome = timeout(Duration::from_millis(self.timeout_ms), io).await;
        let (messages, status) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!("Tracer timed out after {} ms, killing it", self.timeout_ms);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill tracer: {}", e);
                }
                return Err(FlowlensError::TracerTimeout {
                    millis: self.timeout_ms,
                });
            }
        };

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        Ok(Exchange {
            messages,
            status,
            stderr_tail: tail_lines(&stderr, STDERR_TAIL_LINES),
        })
    }
}

async fn write_request(mut stdin: ChildStdin, request_line: &str) -> std::io::Result<()> {
    stdin.write_all(request_line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    // Dropping stdin closes the pipe so the runtime sees EOF
    Ok(())
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[async_trait]
impl TraceBackend for ProcessBackend {
    async fn run_trace(&self, request: &TraceRequest) -> Result<Vec<TraceEvent>> {
        let exchange = self.exchange(&WireRequest::from(request)).await?;

        let raw: Vec<TraceEvent> = exchange
            .messages
            .into_iter()
            .filter_map(|message| match message {
                RuntimeMessage::Trace(event) => Some(event),
                RuntimeMessage::Control(ControlMessage::Error { message }) => {
                    Some(TraceEvent::exception(message, exchange.stderr_tail.clone()))
                }
                RuntimeMessage::Control(ControlMessage::Signature { .. }) => None,
            })
            .collect();

        let abnormal = format!("tracer exited before completing ({})", exchange.status);
        let events = normalize_events(raw, &abnormal, &exchange.stderr_tail);
        debug!("Trace of {} produced {} events", request.entry_function_id, events.len());
        Ok(events)
    }

    async fn lookup_signature(&self, function_id: &str) -> Result<FunctionSignature> {
        let exchange = self
            .exchange(&WireRequest::Signature {
                entry_function_id: function_id,
            })
            .await
            .map_err(|e| FlowlensError::SignatureLookup {
                function_id: function_id.to_string(),
                message: e.to_string(),
            })?;

        for message in exchange.messages {
            match message {
                RuntimeMessage::Control(ControlMessage::Signature { param_names }) => {
                    return Ok(FunctionSignature {
                        function_id: function_id.to_string(),
                        param_names,
                    });
                }
                RuntimeMessage::Control(ControlMessage::Error { message }) => {
                    return Err(FlowlensError::SignatureLookup {
                        function_id: function_id.to_string(),
                        message,
                    });
                }
                RuntimeMessage::Trace(_) => {}
            }
        }

        Err(FlowlensError::SignatureLookup {
            function_id: function_id.to_string(),
            message: format!("no signature in tracer output ({}): {}", exchange.status, exchange.stderr_tail),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::tracer::TraceArguments;

    fn backend(script: &str, timeout_ms: u64) -> (tempfile::TempDir, ProcessBackend) {
        let dir = tempfile::tempdir().unwrap();
        let config = TracerConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "tracer".to_string()],
            timeout_ms,
            ..Config::default().tracer
        };
        let backend = ProcessBackend::new(&config, dir.path());
        (dir, backend)
    }

    fn request() -> TraceRequest {
        TraceRequest {
            entry_function_id: "/repo/m.py::f".to_string(),
            stop_line: 10,
            arguments: TraceArguments::default(),
            target_filename: PathBuf::from("/repo/m.py"),
        }
    }

    #[tokio::test]
    async fn completed_trace_has_increasing_lines_then_return_and_done() {
        let script = r#"read req
echo 'starting up'
echo '{"event":"line","filename":"/repo/m.py","function":"f","line":2,"locals":{}}'
echo '{"event":"line","filename":"/repo/m.py","function":"f","line":3,"locals":{"a":1}}'
echo '{"event":"line","filename":"/repo/m.py","function":"f","line":4,"locals":{"a":1,"b":2}}'
echo '{"event":"return","value":3}'
echo '{"event":"done"}'"#;
        let (_dir, backend) = backend(script, 5_000);
        let events = backend.run_trace(&request()).await.unwrap();

        let lines: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                TraceEvent::Line { line, .. } => Some(*line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec![2, 3, 4]);
        assert_eq!(events[3].kind(), "return");
        assert_eq!(events[4], TraceEvent::Done);
        assert_eq!(events.len(), 5);
    }

    #[tokio::test]
    async fn hanging_runtime_times_out() {
        let (_dir, backend) = backend("read req\nsleep 5", 200);
        let err = backend.run_trace(&request()).await.unwrap_err();
        assert!(matches!(err, FlowlensError::TracerTimeout { millis: 200 }));
    }

    #[tokio::test]
    async fn crash_becomes_synthetic_exception() {
        let script = r#"read req
echo '{"event":"line","filename":"/repo/m.py","function":"f","line":2,"locals":{}}'
echo 'boom' >&2
exit 3"#;
        let (_dir, backend) = backend(script, 5_000);
        let events = backend.run_trace(&request()).await.unwrap();

        assert_eq!(events.len(), 2);
        match &events[1] {
            TraceEvent::Exception { error_message, traceback_text, .. } => {
                assert!(error_message.contains("exited before completing"));
                assert_eq!(traceback_text, "boom");
            }
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = TracerConfig {
            program: "/nonexistent/flowlens-runtime".to_string(),
            ..Config::default().tracer
        };
        let backend = ProcessBackend::new(&config, dir.path());
        let err = backend.run_trace(&request()).await.unwrap_err();
        assert!(matches!(err, FlowlensError::TracerSpawn(_)));
    }

    #[tokio::test]
    async fn signature_lookup_reads_param_names() {
        let script = r#"read req
echo '{"event":"signature","param_names":["a","b"]}'"#;
        let (_dir, backend) = backend(script, 5_000);
        let signature = backend.lookup_signature("/repo/m.py::f").await.unwrap();
        assert_eq!(signature.param_names, vec!["a", "b"]);

        let (_dir, failing) = self::backend(r#"read req; echo '{"event":"error","message":"function not found"}'"#, 5_000);
        let err = failing.lookup_signature("/repo/m.py::g").await.unwrap_err();
        assert!(matches!(err, FlowlensError::SignatureLookup { .. }));
    }

    #[tokio::test]
    async fn malformed_protocol_line_becomes_an_exception() {
        let script = r#"read req
echo '{"event":"line","filename":"/repo/m.py","function":"f","line":2,"locals":{"x":NaN}}'
echo '{"event":"return","value":NaN}'
echo '{"event":"done"}'"#;
        let (_dir, backend) = backend(script, 5_000);
        let events = backend.run_trace(&request()).await.unwrap();

        let kinds: Vec<_> = events.iter().map(TraceEvent::kind).collect();
        assert_eq!(kinds, vec!["exception", "done"]);
        match &events[0] {
            TraceEvent::Exception { error_message, .. } => assert!(error_message.contains("unparseable event")),
            other => panic!("expected exception, got {:?}", other),
        }
    }
}
