//! Wire types exchanged with the instrumented runtime.
//!
//! Requests are a single JSON line on the runtime's stdin; the runtime answers
//! with one JSON object per line on stdout.

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One observable unit of execution progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Line {
        filename: String,
        function: String,
        line: usize,
        #[serde(default)]
        locals: Map<String, Value>,
    },
    Return {
        #[serde(default)]
        value: Value,
    },
    Exception {
        error_message: String,
        #[serde(default)]
        traceback_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Done,
}

impl TraceEvent {
    /// `return` and `exception` end the traced call
    pub fn is_terminal(&self) -> bool {
        matches!(self, TraceEvent::Return { .. } | TraceEvent::Exception { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TraceEvent::Line { .. } => "line",
            TraceEvent::Return { .. } => "return",
            TraceEvent::Exception { .. } => "exception",
            TraceEvent::Done => "done",
        }
    }

    pub fn exception(message: impl Into<String>, traceback_text: impl Into<String>) -> Self {
        TraceEvent::Exception {
            error_message: message.into(),
            traceback_text: traceback_text.into(),
            line: None,
            filename: None,
        }
    }
}

/// Call arguments in the runtime's `{"args": [...], "kwargs": {...}}` shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceArguments {
    #[serde(default, rename = "args", alias = "positional")]
    pub positional: Vec<Value>,
    #[serde(default, rename = "kwargs", alias = "keyword")]
    pub keyword: Map<String, Value>,
}

impl TraceArguments {
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRequest {
    pub entry_function_id: String,
    pub stop_line: usize,
    pub arguments: TraceArguments,
    pub target_filename: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub function_id: String,
    pub param_names: Vec<String>,
}

/// Request line written to the runtime
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WireRequest<'a> {
    Trace {
        entry_function_id: &'a str,
        stop_line: usize,
        arguments: &'a TraceArguments,
        target_filename: &'a Path,
    },
    Signature {
        entry_function_id: &'a str,
    },
}

impl<'a> From<&'a TraceRequest> for WireRequest<'a> {
    fn from(request: &'a TraceRequest) -> Self {
        WireRequest::Trace {
            entry_function_id: &request.entry_function_id,
            stop_line: request.stop_line,
            arguments: &request.arguments,
            target_filename: &request.target_filename,
        }
    }
}

/// Messages that are not trace events
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlMessage {
    Signature {
        #[serde(default)]
        param_names: Vec<String>,
    },
    Error {
        message: String,
    },
}

/// Anything the runtime may print on a protocol line
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RuntimeMessage {
    Trace(TraceEvent),
    Control(ControlMessage),
}

/// Shape a raw event stream into `line* (return|exception) done` or `line* done`.
///
/// Anything after the first terminal event other than `done` is dropped. A stream
/// that ends after a terminal without `done` gets one appended. A stream with
/// neither a terminal nor `done` gets a synthetic exception and no `done`.
pub fn normalize_events(raw: Vec<TraceEvent>, abnormal_exit: &str, stderr_tail: &str) -> Vec<TraceEvent> {
    let mut events = Vec::with_capacity(raw.len() + 1);
    let mut terminal_seen = false;

    for event in raw {
        match event {
            TraceEvent::Done => {
                events.push(TraceEvent::Done);
                return events;
            }
            _ if terminal_seen => {}
            event => {
                terminal_seen = event.is_terminal();
                events.push(event);
            }
        }
    }

    if terminal_seen {
        events.push(TraceEvent::Done);
    } else {
        events.push(TraceEvent::exception(abnormal_exit, stderr_tail));
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(n: usize) -> TraceEvent {
        TraceEvent::Line {
            filename: "/repo/m.py".to_string(),
            function: "f".to_string(),
            line: n,
            locals: Map::new(),
        }
    }

    #[test]
    fn wire_events_deserialize() {
        let message: RuntimeMessage = serde_json::from_str(
            r#"{"event":"line","filename":"/repo/m.py","function":"f","line":3,"locals":{"x":1}}"#,
        )
        .unwrap();
        let RuntimeMessage::Trace(TraceEvent::Line { line, locals, .. }) = message else {
            panic!("expected a line event");
        };
        assert_eq!(line, 3);
        assert_eq!(locals["x"], json!(1));

        let signature: RuntimeMessage =
            serde_json::from_str(r#"{"event":"signature","param_names":["a","b"]}"#).unwrap();
        assert_eq!(
            signature,
            RuntimeMessage::Control(ControlMessage::Signature {
                param_names: vec!["a".to_string(), "b".to_string()]
            })
        );

        let done: RuntimeMessage = serde_json::from_str(r#"{"event":"done"}"#).unwrap();
        assert_eq!(done, RuntimeMessage::Trace(TraceEvent::Done));
    }

    #[test]
    fn request_uses_args_kwargs_shape() {
        let request = TraceRequest {
            entry_function_id: "/repo/m.py::f".to_string(),
            stop_line: 7,
            arguments: serde_json::from_value(json!({"positional": [1], "keyword": {"b": "x"}})).unwrap(),
            target_filename: PathBuf::from("/repo/m.py"),
        };
        let wire = serde_json::to_value(WireRequest::from(&request)).unwrap();
        assert_eq!(wire["op"], "trace");
        assert_eq!(wire["arguments"], json!({"args": [1], "kwargs": {"b": "x"}}));
    }

    #[test]
    fn events_after_terminal_are_dropped_and_done_appended() {
        let raw = vec![
            line(2),
            TraceEvent::Return { value: json!(3) },
            line(9),
            TraceEvent::exception("late", ""),
        ];
        let events = normalize_events(raw, "exited", "");
        assert_eq!(events.len(), 3);
        assert_eq!(events[1], TraceEvent::Return { value: json!(3) });
        assert_eq!(events[2], TraceEvent::Done);
    }

    #[test]
    fn stopped_stream_keeps_its_done() {
        let events = normalize_events(vec![line(2), line(3), TraceEvent::Done], "exited", "");
        assert_eq!(events, vec![line(2), line(3), TraceEvent::Done]);
    }

    #[test]
    fn truncated_stream_becomes_an_exception() {
        let events = normalize_events(vec![line(2)], "tracer exited abnormally", "Segmentation fault");
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            TraceEvent::exception("tracer exited abnormally", "Segmentation fault")
        );
    }
}
