use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::protocol::{FunctionSignature, TraceArguments, TraceEvent};

/// An event kept in the session log
#[derive(Debug, Clone, Serialize)]
pub struct LoggedEvent {
    pub entry_function_id: String,
    /// Serialized arguments of the run that produced the event
    pub arguments_key: String,
    pub event: TraceEvent,
    pub recorded_at: DateTime<Utc>,
}

/// Line and return events are deduplicated per run (entry plus arguments);
/// exceptions are deduplicated across runs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EventKey {
    Line { run: (String, String), line: usize, filename: String, function: String },
    Exception { line: Option<usize>, filename: Option<String>, error_message: String },
    Return { run: (String, String) },
}

impl EventKey {
    fn of(entry_function_id: &str, arguments_key: &str, event: &TraceEvent) -> Option<Self> {
        let run = || (entry_function_id.to_string(), arguments_key.to_string());
        match event {
            TraceEvent::Line { filename, function, line, .. } => Some(EventKey::Line {
                run: run(),
                line: *line,
                filename: filename.clone(),
                function: function.clone(),
            }),
            TraceEvent::Exception { error_message, line, filename, .. } => Some(EventKey::Exception {
                line: *line,
                filename: filename.clone(),
                error_message: error_message.clone(),
            }),
            TraceEvent::Return { .. } => Some(EventKey::Return { run: run() }),
            TraceEvent::Done => None,
        }
    }
}

/// Append-only event log and caches for one visualization session
#[derive(Debug)]
pub struct TraceSession {
    events: VecDeque<LoggedEvent>,
    seen: HashSet<EventKey>,
    max_events: usize,
    arguments: HashMap<String, TraceArguments>,
    signatures: HashMap<String, FunctionSignature>,
}

pub fn arguments_key(arguments: &TraceArguments) -> String {
    serde_json::to_string(arguments).unwrap_or_default()
}

impl TraceSession {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::new(),
            seen: HashSet::new(),
            max_events: max_events.max(1),
            arguments: HashMap::new(),
            signatures: HashMap::new(),
        }
    }

    /// Append the not-yet-seen events of one run; returns how many were added
    pub fn record(&mut self, entry_function_id: &str, arguments: &TraceArguments, events: &[TraceEvent]) -> usize {
        let key = arguments_key(arguments);
        let mut added = 0;

        for event in events {
            let Some(event_key) = EventKey::of(entry_function_id, &key, event) else {
                continue;
            };
            if !self.seen.insert(event_key) {
                continue;
            }

            self.events.push_back(LoggedEvent {
                entry_function_id: entry_function_id.to_string(),
                arguments_key: key.clone(),
                event: event.clone(),
                recorded_at: Utc::now(),
            });
            added += 1;

            while self.events.len() > self.max_events {
                if let Some(oldest) = self.events.pop_front() {
                    if let Some(old_key) = EventKey::of(&oldest.entry_function_id, &oldest.arguments_key, &oldest.event) {
                        self.seen.remove(&old_key);
                    }
                }
            }
        }

        debug!("Session log: {} new events ({} total)", added, self.events.len());
        added
    }

    /// Logged events of an identical earlier run that already got as far as `stop_line`.
    ///
    /// The runtime stops at the first executed line at or after `stop_line`, so
    /// the replay ends at the first logged line of the run that satisfies that.
    pub fn cached_events(
        &self,
        entry_function_id: &str,
        function: &str,
        filename: &Path,
        stop_line: usize,
        arguments: &TraceArguments,
    ) -> Option<Vec<TraceEvent>> {
        let key = arguments_key(arguments);
        let mut events = Vec::new();

        for logged in self
            .events
            .iter()
            .filter(|logged| logged.entry_function_id == entry_function_id && logged.arguments_key == key)
        {
            if let TraceEvent::Line { filename: f, function: func, line, .. } = &logged.event {
                if func == function && Path::new(f) == filename {
                    events.push(logged.event.clone());
                    if *line >= stop_line {
                        events.push(TraceEvent::Done);
                        return Some(events);
                    }
                }
            }
        }
        None
    }

    /// Locals of the most recent line event captured inside `function` for `entry_function_id`,
    /// preferring the run made with the entry's current arguments
    pub fn latest_locals(&self, entry_function_id: &str, function: &str) -> Option<Map<String, Value>> {
        let current = self.arguments.get(entry_function_id).map(arguments_key);
        let locals_in = |run_key: Option<&str>| {
            self.events.iter().rev().find_map(|logged| match &logged.event {
                TraceEvent::Line { function: f, locals, .. }
                    if logged.entry_function_id == entry_function_id
                        && f == function
                        && run_key.map_or(true, |k| logged.arguments_key == k) =>
                {
                    Some(locals.clone())
                }
                _ => None,
            })
        };

        match current.as_deref() {
            Some(key) => locals_in(Some(key)).or_else(|| locals_in(None)),
            None => locals_in(None),
        }
    }

    pub fn remember_arguments(&mut self, entry_function_id: &str, arguments: TraceArguments) {
        self.arguments.insert(entry_function_id.to_string(), arguments);
    }

    pub fn arguments_for(&self, entry_function_id: &str) -> Option<&TraceArguments> {
        self.arguments.get(entry_function_id)
    }

    pub fn cached_signature(&self, function_id: &str) -> Option<&FunctionSignature> {
        self.signatures.get(function_id)
    }

    pub fn cache_signature(&mut self, signature: FunctionSignature) {
        self.signatures.insert(signature.function_id.clone(), signature);
    }

    pub fn events(&self) -> impl Iterator<Item = &LoggedEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Clear the log, remembered arguments and signature cache
    pub fn reset(&mut self) {
        self.events.clear();
        self.seen.clear();
        self.arguments.clear();
        self.signatures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(n: usize, locals: Value) -> TraceEvent {
        TraceEvent::Line {
            filename: "/repo/m.py".to_string(),
            function: "f".to_string(),
            line: n,
            locals: locals.as_object().cloned().unwrap_or_default(),
        }
    }

    const ENTRY: &str = "/repo/m.py::f";

    #[test]
    fn duplicate_events_are_logged_once() {
        let mut session = TraceSession::new(100);
        let args = TraceArguments::default();
        let run = vec![line(2, json!({})), line(3, json!({"a": 1})), TraceEvent::Done];

        assert_eq!(session.record(ENTRY, &args, &run), 2);
        assert_eq!(session.record(ENTRY, &args, &run), 0);

        let failure = TraceEvent::Exception {
            error_message: "boom".to_string(),
            traceback_text: String::new(),
            line: Some(4),
            filename: Some("/repo/m.py".to_string()),
        };
        assert_eq!(session.record(ENTRY, &args, &[failure.clone(), failure]), 1);
        assert_eq!(session.len(), 3);
    }

    #[test]
    fn log_is_capped_oldest_first() {
        let mut session = TraceSession::new(2);
        let args = TraceArguments::default();
        session.record(ENTRY, &args, &[line(1, json!({})), line(2, json!({})), line(3, json!({}))]);

        let lines: Vec<_> = session
            .events()
            .filter_map(|e| match &e.event {
                TraceEvent::Line { line, .. } => Some(*line),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec![2, 3]);
    }

    #[test]
    fn cache_hit_returns_logged_lines_up_to_stop() {
        let mut session = TraceSession::new(100);
        let args = TraceArguments::default();
        session.record(ENTRY, &args, &[line(2, json!({})), line(3, json!({})), line(5, json!({})), TraceEvent::Done]);

        let cached = session
            .cached_events(ENTRY, "f", Path::new("/repo/m.py"), 3, &args)
            .unwrap();
        assert_eq!(cached, vec![line(2, json!({})), line(3, json!({})), TraceEvent::Done]);

        // Line 4 never executed; the runtime would have stopped at 5
        let skipped = session
            .cached_events(ENTRY, "f", Path::new("/repo/m.py"), 4, &args)
            .unwrap();
        assert_eq!(skipped, vec![line(2, json!({})), line(3, json!({})), line(5, json!({})), TraceEvent::Done]);
        assert!(session.cached_events(ENTRY, "f", Path::new("/repo/m.py"), 6, &args).is_none());

        let other_args = TraceArguments {
            positional: vec![json!(1)],
            ..TraceArguments::default()
        };
        assert!(session.cached_events(ENTRY, "f", Path::new("/repo/m.py"), 3, &other_args).is_none());
    }

    #[test]
    fn latest_locals_and_reset() {
        let mut session = TraceSession::new(100);
        let args = TraceArguments::default();
        session.record(ENTRY, &args, &[line(2, json!({"a": 1})), line(3, json!({"a": 1, "b": 2}))]);
        session.remember_arguments(ENTRY, args);

        assert_eq!(session.latest_locals(ENTRY, "f").unwrap()["b"], json!(2));
        assert!(session.latest_locals(ENTRY, "g").is_none());

        session.reset();
        assert!(session.is_empty());
        assert!(session.arguments_for(ENTRY).is_none());
    }

    #[test]
    fn runs_with_different_arguments_are_logged_separately() {
        let mut session = TraceSession::new(100);
        let first = TraceArguments {
            positional: vec![json!(1)],
            ..TraceArguments::default()
        };
        let second = TraceArguments {
            positional: vec![json!(2)],
            ..TraceArguments::default()
        };

        session.remember_arguments(ENTRY, first.clone());
        assert_eq!(session.record(ENTRY, &first, &[line(2, json!({"x": 1})), TraceEvent::Done]), 1);
        session.remember_arguments(ENTRY, second.clone());
        assert_eq!(session.record(ENTRY, &second, &[line(2, json!({"x": 2})), TraceEvent::Done]), 1);

        let replay = session
            .cached_events(ENTRY, "f", Path::new("/repo/m.py"), 2, &second)
            .unwrap();
        assert_eq!(replay, vec![line(2, json!({"x": 2})), TraceEvent::Done]);
        assert_eq!(session.latest_locals(ENTRY, "f").unwrap()["x"], json!(2));

        // Switching back to the first arguments serves that run's locals again
        session.remember_arguments(ENTRY, first);
        assert_eq!(session.latest_locals(ENTRY, "f").unwrap()["x"], json!(1));
    }
}
