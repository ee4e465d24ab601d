use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{FlowlensError, Result};
use super::arguments::resolve_arguments;
use super::backend::TraceBackend;
use super::protocol::{FunctionSignature, TraceArguments, TraceEvent, TraceRequest};
use super::session::TraceSession;
use crate::core::parser::split_function_id;
use crate::core::qualifier::CallSite;

/// Outcome of tracing into a callee from a caller's call site
#[derive(Debug, Clone, Serialize)]
pub struct CallSiteTrace {
    pub callee_id: String,
    pub arguments: TraceArguments,
    pub events: Vec<TraceEvent>,
}

/// Drives trace requests against a backend and owns the session log
pub struct TracerEngine {
    backend: Arc<dyn TraceBackend>,
    session: Mutex<TraceSession>,
    /// One in-flight request per entry function
    target_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TracerEngine {
    pub fn new(backend: Arc<dyn TraceBackend>, max_session_events: usize) -> Self {
        Self {
            backend,
            session: Mutex::new(TraceSession::new(max_session_events)),
            target_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, entry_function_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.target_locks.lock().await;
        locks
            .entry(entry_function_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the entry's guard from the map once no other request holds or awaits it
    async fn release(&self, entry_function_id: &str, target_lock: Arc<Mutex<()>>) {
        let mut locks = self.target_locks.lock().await;
        // One reference in the map, one here
        if Arc::strong_count(&target_lock) <= 2 {
            locks.remove(entry_function_id);
        }
    }

    /// Trace `entry_function_id` up to `stop_line`.
    ///
    /// Every failure comes back as a single `exception` event stamped with the
    /// stop line and target file. `None` arguments reuse the ones remembered for
    /// this entry.
    pub async fn get_next_tracer_event(
        &self,
        entry_function_id: &str,
        stop_line: usize,
        arguments: Option<TraceArguments>,
    ) -> Vec<TraceEvent> {
        let (target_filename, function_name) = match split_function_id(entry_function_id) {
            Ok(parts) => parts,
            Err(e) => return vec![failure_event(&e, stop_line, None)],
        };

        let target_lock = self.lock_for(entry_function_id).await;
        let events = {
            let _in_flight = target_lock.lock().await;
            self.trace_serialized(entry_function_id, &target_filename, &function_name, stop_line, arguments)
                .await
        };
        self.release(entry_function_id, target_lock).await;
        events
    }

    async fn trace_serialized(
        &self,
        entry_function_id: &str,
        target_filename: &Path,
        function_name: &str,
        stop_line: usize,
        arguments: Option<TraceArguments>,
    ) -> Vec<TraceEvent> {
        let arguments = {
            let mut session = self.session.lock().await;
            let arguments = match arguments {
                Some(arguments) => arguments,
                None => session.arguments_for(entry_function_id).cloned().unwrap_or_default(),
            };
            session.remember_arguments(entry_function_id, arguments.clone());

            if let Some(cached) =
                session.cached_events(entry_function_id, function_name, target_filename, stop_line, &arguments)
            {
                info!("Line {} of {} already traced, serving from session log", stop_line, entry_function_id);
                return cached;
            }
            arguments
        };

        let request = TraceRequest {
            entry_function_id: entry_function_id.to_string(),
            stop_line,
            arguments,
            target_filename: target_filename.to_path_buf(),
        };

        let events = match self.backend.run_trace(&request).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Trace of {} failed: {}", entry_function_id, e);
                vec![failure_event(&e, stop_line, Some(target_filename))]
            }
        };

        self.session
            .lock()
            .await
            .record(entry_function_id, &request.arguments, &events);
        events
    }

    /// Declared parameter names, cached for the session
    pub async fn get_function_signature(&self, function_id: &str) -> Result<FunctionSignature> {
        if let Some(signature) = self.session.lock().await.cached_signature(function_id) {
            return Ok(signature.clone());
        }

        split_function_id(function_id)?;
        let signature = self.backend.lookup_signature(function_id).await?;
        self.session.lock().await.cache_signature(signature.clone());
        Ok(signature)
    }

    /// Trace a callee with arguments resolved from the caller's latest captured locals
    pub async fn trace_call_site(
        &self,
        caller_id: &str,
        call_site: &CallSite,
        stop_line: usize,
    ) -> Result<CallSiteTrace> {
        let callee_id = call_site
            .callee_id
            .clone()
            .ok_or_else(|| FlowlensError::InvalidFunctionId(call_site.name.clone()))?;
        let (_, caller_name) = split_function_id(caller_id)?;

        let caller_locals = self
            .session
            .lock()
            .await
            .latest_locals(caller_id, &caller_name)
            .unwrap_or_else(|| {
                warn!("No captured locals for {}, identifiers pass through as text", caller_id);
                Default::default()
            });

        let signature = match self.get_function_signature(&callee_id).await {
            Ok(signature) => Some(signature),
            Err(e) => {
                warn!("{}", e);
                None
            }
        };

        let arguments = resolve_arguments(&call_site.args_text, &caller_locals, signature.as_ref());
        let events = self
            .get_next_tracer_event(&callee_id, stop_line, Some(arguments.clone()))
            .await;

        Ok(CallSiteTrace {
            callee_id,
            arguments,
            events,
        })
    }

    /// Number of events currently in the session log
    pub async fn logged_event_count(&self) -> usize {
        self.session.lock().await.len()
    }

    pub async fn reset(&self) {
        self.session.lock().await.reset();
        self.target_locks.lock().await.retain(|_, lock| Arc::strong_count(lock) > 1);
        info!("Tracer session reset");
    }
}

fn failure_event(error: &FlowlensError, stop_line: usize, target: Option<&Path>) -> TraceEvent {
    TraceEvent::Exception {
        error_message: error.to_string(),
        traceback_text: String::new(),
        line: Some(stop_line),
        filename: target.map(|p| p.display().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a fixed line sequence, stopping at the requested line
    struct ScriptedBackend {
        runs: AtomicUsize,
        signature_lookups: AtomicUsize,
        last_request: std::sync::Mutex<Option<TraceRequest>>,
    }

    impl ScriptedBackend {
        fn new() -> Self {
            Self {
                runs: AtomicUsize::new(0),
                signature_lookups: AtomicUsize::new(0),
                last_request: std::sync::Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl TraceBackend for ScriptedBackend {
        async fn run_trace(&self, request: &TraceRequest) -> Result<Vec<TraceEvent>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request.clone());

            if request.entry_function_id.ends_with("::slow") {
                return Err(FlowlensError::TracerTimeout { millis: 10 });
            }

            let (file, name) = split_function_id(&request.entry_function_id)?;
            let mut events = Vec::new();
            for (line, locals) in [(2, json!({"x": 1})), (3, json!({"x": 1, "y": 2})), (4, json!({"x": 1, "y": 2, "z": 3}))] {
                events.push(TraceEvent::Line {
                    filename: file.display().to_string(),
                    function: name.clone(),
                    line,
                    locals: locals.as_object().cloned().unwrap_or_default(),
                });
                if line >= request.stop_line {
                    events.push(TraceEvent::Done);
                    return Ok(events);
                }
            }
            events.push(TraceEvent::Return { value: json!(6) });
            events.push(TraceEvent::Done);
            Ok(events)
        }

        async fn lookup_signature(&self, function_id: &str) -> Result<FunctionSignature> {
            self.signature_lookups.fetch_add(1, Ordering::SeqCst);
            if function_id.ends_with("::missing") {
                return Err(FlowlensError::SignatureLookup {
                    function_id: function_id.to_string(),
                    message: "function not found".to_string(),
                });
            }
            Ok(FunctionSignature {
                function_id: function_id.to_string(),
                param_names: vec!["a".to_string(), "b".to_string()],
            })
        }
    }

    fn engine() -> (Arc<ScriptedBackend>, TracerEngine) {
        let backend = Arc::new(ScriptedBackend::new());
        let engine = TracerEngine::new(backend.clone(), 1000);
        (backend, engine)
    }

    #[tokio::test]
    async fn full_run_ends_in_return_then_done() {
        let (_, engine) = engine();
        let events = engine.get_next_tracer_event("/repo/m.py::f", 99, None).await;

        let kinds: Vec<_> = events.iter().map(TraceEvent::kind).collect();
        assert_eq!(kinds, vec!["line", "line", "line", "return", "done"]);
    }

    #[tokio::test]
    async fn revisiting_a_line_does_not_execute_again() {
        let (backend, engine) = engine();
        let first = engine.get_next_tracer_event("/repo/m.py::f", 3, None).await;
        let second = engine.get_next_tracer_event("/repo/m.py::f", 3, None).await;
        let earlier = engine.get_next_tracer_event("/repo/m.py::f", 2, None).await;

        assert_eq!(backend.runs.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(earlier.len(), 2);
        assert_eq!(engine.logged_event_count().await, 2);
    }

    #[tokio::test]
    async fn remembered_arguments_are_reused_for_continuation() {
        let (backend, engine) = engine();
        let args = TraceArguments {
            positional: vec![json!(5)],
            keyword: Map::new(),
        };
        engine.get_next_tracer_event("/repo/m.py::f", 2, Some(args.clone())).await;
        engine.get_next_tracer_event("/repo/m.py::f", 4, None).await;

        assert_eq!(backend.runs.load(Ordering::SeqCst), 2);
        let last = backend.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(last.arguments, args);
        assert_eq!(last.stop_line, 4);
    }

    #[tokio::test]
    async fn backend_failures_become_one_exception_without_done() {
        let (_, engine) = engine();
        let events = engine.get_next_tracer_event("/repo/m.py::slow", 7, None).await;

        assert_eq!(events.len(), 1);
        match &events[0] {
            TraceEvent::Exception { line, filename, error_message, .. } => {
                assert_eq!(*line, Some(7));
                assert_eq!(filename.as_deref(), Some("/repo/m.py"));
                assert!(error_message.contains("10 ms"));
            }
            other => panic!("expected exception, got {:?}", other),
        }

        let invalid = engine.get_next_tracer_event("not-an-id", 1, None).await;
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].kind(), "exception");
    }

    #[tokio::test]
    async fn signatures_are_cached() {
        let (backend, engine) = engine();
        engine.get_function_signature("/repo/m.py::g").await.unwrap();
        engine.get_function_signature("/repo/m.py::g").await.unwrap();
        assert_eq!(backend.signature_lookups.load(Ordering::SeqCst), 1);

        assert!(engine.get_function_signature("/repo/m.py::missing").await.is_err());
    }

    #[tokio::test]
    async fn call_site_arguments_come_from_caller_locals() {
        let (backend, engine) = engine();
        engine.get_next_tracer_event("/repo/m.py::caller", 3, None).await;

        let site = CallSite {
            line: 3,
            column: 5,
            name: "callee".to_string(),
            receiver: None,
            callee_id: Some("/repo/m.py::callee".to_string()),
            args_text: "y, c=x, a=1".to_string(),
        };
        let traced = engine.trace_call_site("/repo/m.py::caller", &site, 99).await.unwrap();

        assert_eq!(traced.arguments.positional, vec![json!(2)]);
        assert!(traced.arguments.keyword.is_empty());
        assert_eq!(traced.events.last(), Some(&TraceEvent::Done));

        let last = backend.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(last.entry_function_id, "/repo/m.py::callee");

        let missing = CallSite {
            callee_id: Some("/repo/m.py::missing".to_string()),
            ..site
        };
        let traced = engine.trace_call_site("/repo/m.py::caller", &missing, 99).await.unwrap();
        assert!(traced.arguments.is_empty());
    }

    #[tokio::test]
    async fn each_argument_set_is_cached_on_its_own() {
        let (backend, engine) = engine();
        let first = TraceArguments {
            positional: vec![json!(1)],
            keyword: Map::new(),
        };
        let second = TraceArguments {
            positional: vec![json!(2)],
            keyword: Map::new(),
        };

        engine.get_next_tracer_event("/repo/m.py::f", 2, Some(first)).await;
        for _ in 0..3 {
            engine.get_next_tracer_event("/repo/m.py::f", 2, Some(second.clone())).await;
        }

        assert_eq!(backend.runs.load(Ordering::SeqCst), 2);
        assert_eq!(engine.logged_event_count().await, 2);
    }

    #[tokio::test]
    async fn idle_targets_release_their_guards() {
        let (_, engine) = engine();
        engine.get_next_tracer_event("/repo/m.py::f", 3, None).await;
        engine.get_next_tracer_event("/repo/m.py::g", 3, None).await;
        engine.get_next_tracer_event("/repo/m.py::f", 3, None).await;

        assert!(engine.target_locks.lock().await.is_empty());
    }
}
