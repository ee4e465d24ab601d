//! Execution tracing against an external line-debugging runtime
//!
//! A [`TracerEngine`] turns trace requests into event sequences through a
//! pluggable [`TraceBackend`], deduplicating what it has already observed in
//! a per-session log.

mod arguments;
mod backend;
mod engine;
mod protocol;
mod session;

pub use arguments::{filter_to_signature, parse_call_arguments, resolve_arguments, CallArgument};
pub use backend::{ProcessBackend, TraceBackend};
pub use engine::{CallSiteTrace, TracerEngine};
pub use protocol::{
    normalize_events, ControlMessage, FunctionSignature, RuntimeMessage, TraceArguments, TraceEvent, TraceRequest,
    WireRequest,
};
pub use session::{LoggedEvent, TraceSession};
