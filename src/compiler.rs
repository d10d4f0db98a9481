//! Compiler and execution-session collaborator boundary.
//!
//! The rule language itself lives outside this crate. The relay only needs
//! two capabilities: turn rule source text into an opaque executable unit,
//! and run a fact through a unit via short-lived sessions. Both are traits
//! so the engine (Drools-style, WASM, whatever) is injected at wiring time.

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Compile failure — the source text itself is bad. Never retried.
#[derive(Error, Debug, Clone)]
#[error("compile error: {details}")]
pub struct CompileError {
    pub details: String,
}

impl CompileError {
    pub fn new(details: impl Into<String>) -> Self {
        Self {
            details: details.into(),
        }
    }
}

/// Runtime failure inside an execution session.
#[derive(Error, Debug)]
#[error("rule execution error: {0}")]
pub struct ExecutionError(pub String);

/// A compiled, immutable, runnable form of rule source text.
///
/// Units are shared as `Arc` between the cache entry that owns them and any
/// in-flight execution sessions; a superseded unit is freed when the last
/// session drops its handle.
pub trait CompiledRule: Send + Sync {
    /// Open a fresh execution session against this unit.
    fn new_session(&self) -> Box<dyn RuleSession>;
}

/// Shared handle to a compiled rule unit.
pub type ExecutableUnit = Arc<dyn CompiledRule>;

/// One execution session: insert facts, fire, dispose (on drop).
pub trait RuleSession: Send {
    /// Insert a fact into working memory.
    fn insert(&mut self, fact: Value) -> Result<(), ExecutionError>;

    /// Fire all matching rules, returning the fired-rule count.
    fn fire_all(&mut self) -> Result<usize, ExecutionError>;
}

/// The compiler collaborator.
pub trait RuleCompiler: Send + Sync {
    /// Compile rule source text into an executable unit, or fail with a
    /// compile error when the source is malformed.
    fn compile(&self, source: &str) -> Result<ExecutableUnit, CompileError>;
}
