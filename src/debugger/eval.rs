//! Condition text, lazy compilation, and the evaluation seams.
//!
//! Breakpoints and traces carry break/log/command conditions as raw text.
//! The text is never validated when it is stored; it is compiled on first
//! use at hit time, and a compile or evaluation failure forces the decision
//! to its fail-safe default (break) with the error reported exactly once per
//! condition text.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::info;

use crate::error::ExpressionError;

/// Well-known variable a breakpoint command may set to override the final
/// break decision for the hit that ran it.
pub const BREAK_DECISION_VAR: &str = "$breakpointcondition";

/// Shared debugger variables visible to expressions and commands.
#[derive(Debug, Default)]
pub struct VarStore {
    vars: Mutex<HashMap<String, u64>>,
}

impl VarStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.vars.lock().unwrap().get(name).copied()
    }

    pub fn set(&self, name: &str, value: u64) {
        self.vars.lock().unwrap().insert(name.to_string(), value);
    }

    pub fn unset(&self, name: &str) -> Option<u64> {
        self.vars.lock().unwrap().remove(name)
    }

    /// Take the break-decision override left behind by a command, if any.
    pub fn take_break_override(&self) -> Option<bool> {
        self.unset(BREAK_DECISION_VAR).map(|v| v != 0)
    }
}

/// An opaque compiled expression handle produced by an evaluator.
#[derive(Clone)]
pub struct CompiledExpr(Arc<dyn Any + Send + Sync>);

impl CompiledExpr {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for CompiledExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompiledExpr")
    }
}

/// Expression compiler/evaluator seam.
///
/// Implementations must be cheap to call at every breakpoint hit and trace
/// step; compilation happens once per condition text, evaluation on every
/// hit.
pub trait ExpressionEval: Send + Sync {
    fn compile(&self, text: &str) -> Result<CompiledExpr, ExpressionError>;
    fn evaluate(&self, expr: &CompiledExpr, vars: &VarStore) -> Result<u64, ExpressionError>;
}

enum BasicExpr {
    Literal(u64),
    Var(String),
}

/// A minimal built-in evaluator: integer literals (decimal or `0x` hex) and
/// `$variable` lookups. Anything else is a compile error.
#[derive(Debug, Default)]
pub struct BasicEvaluator;

impl BasicEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEval for BasicEvaluator {
    fn compile(&self, text: &str) -> Result<CompiledExpr, ExpressionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ExpressionError::new(text, "empty expression"));
        }
        if let Some(name) = text.strip_prefix('$') {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ExpressionError::new(text, "malformed variable name"));
            }
            return Ok(CompiledExpr::new(BasicExpr::Var(text.to_string())));
        }
        let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))
        {
            u64::from_str_radix(hex, 16)
        } else {
            text.parse()
        };
        match parsed {
            Ok(value) => Ok(CompiledExpr::new(BasicExpr::Literal(value))),
            Err(_) => Err(ExpressionError::new(text, "expected integer or $variable")),
        }
    }

    fn evaluate(&self, expr: &CompiledExpr, vars: &VarStore) -> Result<u64, ExpressionError> {
        let expr = expr
            .downcast::<BasicExpr>()
            .ok_or_else(|| ExpressionError::new("", "foreign expression handle"))?;
        match expr {
            BasicExpr::Literal(value) => Ok(*value),
            // Unset variables read as 0, like uninitialized debugger vars.
            BasicExpr::Var(name) => Ok(vars.get(name).unwrap_or(0)),
        }
    }
}

#[derive(Default)]
struct CondCache {
    compiled: Option<CompiledExpr>,
    failed: bool,
    reported: bool,
}

/// A condition: raw text plus a lazily built compiled handle.
///
/// Cloning shares the cache, so copies of a breakpoint record taken during
/// hit evaluation report a malformed text only once and reuse the compiled
/// handle. Changing the text means building a fresh `LazyCondition`.
#[derive(Clone, Default)]
pub struct LazyCondition {
    text: String,
    cache: Arc<Mutex<CondCache>>,
}

impl LazyCondition {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cache: Arc::default(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Decide the condition: empty text yields `default`, a malformed or
    /// unevaluable expression yields true (fail-safe: when in doubt, break)
    /// and reports the error once through `report`.
    pub fn decide(
        &self,
        eval: &dyn ExpressionEval,
        vars: &VarStore,
        default: bool,
        report: &mut dyn FnMut(&ExpressionError),
    ) -> bool {
        if self.is_empty() {
            return default;
        }
        let mut cache = self.cache.lock().unwrap();
        if cache.failed {
            return true;
        }
        if cache.compiled.is_none() {
            match eval.compile(&self.text) {
                Ok(compiled) => cache.compiled = Some(compiled),
                Err(err) => {
                    cache.failed = true;
                    if !cache.reported {
                        cache.reported = true;
                        report(&err);
                    }
                    return true;
                }
            }
        }
        let compiled = cache.compiled.as_ref().unwrap();
        match eval.evaluate(compiled, vars) {
            Ok(value) => value != 0,
            Err(err) => {
                if !cache.reported {
                    cache.reported = true;
                    report(&err);
                }
                true
            }
        }
    }
}

impl fmt::Debug for LazyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.text)
    }
}

/// Synchronous command execution at breakpoint hits.
///
/// The dispatcher may call back into the control API and may set
/// [`BREAK_DECISION_VAR`] in the variable store to override the decision.
pub trait CommandDispatcher: Send + Sync {
    fn execute(&self, command: &str, vars: &VarStore) -> anyhow::Result<()>;
}

/// A dispatcher that ignores every command.
#[derive(Debug, Default)]
pub struct NullDispatcher;

impl CommandDispatcher for NullDispatcher {
    fn execute(&self, _command: &str, _vars: &VarStore) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Destination for breakpoint/trace log lines.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Routes log lines through the `log` facade.
#[derive(Debug, Default)]
pub struct DefaultSink;

impl LogSink for DefaultSink {
    fn write_line(&self, line: &str) {
        info!("{line}");
    }
}

/// Appends log lines to a file, one per line.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl LogSink for FileSink {
    fn write_line(&self, line: &str) {
        let mut file = self.file.lock().unwrap();
        // A failed log write must never disturb the hit pipeline.
        let _ = writeln!(file, "{line}");
    }
}

/// Captures log lines in memory; used by tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

/// Expand the `{addr}`, `{hits}` and `{name}` placeholders of a log
/// template.
pub fn format_log(template: &str, address: u64, hits: u64, name: &str) -> String {
    template
        .replace("{addr}", &format!("{address:#x}"))
        .replace("{hits}", &hits.to_string())
        .replace("{name}", name)
}
