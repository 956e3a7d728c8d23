//! Error kinds and the symbolic evaluation trace.
//!
//! Every failure that unwinds out of the interpreter carries two things:
//! a [`ErrorKind`] describing what went wrong, and an ordered trace of
//! the call boundaries it crossed on the way out (innermost first). The
//! trace is symbolic — code names, method names, native-function names —
//! because the bytecode no longer knows about source text.

use std::fmt;

use thiserror::Error;

/// A line/column position recorded in a code object's debug-point table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SourcePos {
    pub line: u32,
    pub col: u32,
}

impl SourcePos {
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, col {}", self.line, self.col)
    }
}

/// One frame of the trace attached to an unwinding error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEntry {
    /// An interpreted code or closure boundary, with the position of the
    /// faulting instruction when the debug-point table covers it.
    Code {
        name: String,
        pos: Option<SourcePos>,
    },
    /// A polymorphic call boundary: method name plus the type it
    /// dispatched on.
    Polymorphic { method: String, type_name: String },
    /// A native-function boundary.
    Native { name: String },
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEntry::Code { name, pos: Some(p) } => write!(f, "{} ({})", name, p),
            TraceEntry::Code { name, pos: None } => write!(f, "{}", name),
            TraceEntry::Polymorphic { method, type_name } => {
                write!(f, "{} [{}]", method, type_name)
            }
            TraceEntry::Native { name } => write!(f, "{} (native)", name),
        }
    }
}

/// What went wrong, independent of where.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    /// A callable was handed an argument count it cannot accept.
    #[error("wrong number of args to {callable}: got {got}, expected {expected}")]
    ArityMismatch {
        callable: String,
        got: usize,
        expected: String,
    },

    /// A var was dereferenced before anything was installed in it.
    #[error("var {ns}/{name} is undefined")]
    UndefinedVar { ns: String, name: String },

    /// A symbol's namespace part named neither a refer alias nor a
    /// registered namespace.
    #[error("unable to resolve namespace {ns} inside namespace {in_ns}")]
    UnresolvedNamespace { ns: String, in_ns: String },

    /// A polymorphic call found no implementation for the dispatched type.
    #[error("no override for {type_name} on {method} in protocol {protocol}")]
    NoOverride {
        method: String,
        protocol: String,
        type_name: String,
    },

    /// A value had the wrong shape for the operation.
    #[error("expected {expected}, got {got}")]
    TypeAssertion { expected: String, got: String },

    /// Internal inconsistency: malformed bytecode, out-of-range indices,
    /// operand-stack underflow. Compiler bugs surface here.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// An error raised by a native callable, passed through unchanged.
    #[error("{0}")]
    Host(String),

    /// The configured decode budget was exhausted (see `Limits`).
    #[error("instruction limit exceeded ({0})")]
    InstructionLimitExceeded(u64),

    /// The configured interpreter call depth was exhausted (see `Limits`).
    #[error("call depth limit exceeded ({0})")]
    DepthLimitExceeded(usize),
}

/// An evaluation error: the kind plus the ordered symbolic trace,
/// innermost boundary first.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    kind: ErrorKind,
    trace: Vec<TraceEntry>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            trace: Vec::new(),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// The trace collected so far, innermost boundary first.
    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// Record an interpreted-code boundary on the way out.
    pub(crate) fn in_code(mut self, name: &str, pos: Option<SourcePos>) -> Self {
        self.trace.push(TraceEntry::Code {
            name: name.to_string(),
            pos,
        });
        self
    }

    /// Record a polymorphic-dispatch boundary on the way out.
    pub(crate) fn in_method(mut self, method: &str, type_name: &str) -> Self {
        self.trace.push(TraceEntry::Polymorphic {
            method: method.to_string(),
            type_name: type_name.to_string(),
        });
        self
    }

    /// Record a native-function boundary on the way out.
    pub(crate) fn in_native(mut self, name: &str) -> Self {
        self.trace.push(TraceEntry::Native {
            name: name.to_string(),
        });
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for entry in &self.trace {
            write!(f, "\n  in {}", entry)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
