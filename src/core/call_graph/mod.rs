// src/core/call_graph/mod.rs
//! Call graph construction for Flowlens
//!
//! Edges come from the qualified call sites of changed functions. The parent
//! set (changed functions no other changed function calls) seeds the
//! expansion view.

mod call_graph;

pub use call_graph::{CallEdge, CallGraph, CallGraphStats, CallNode};
