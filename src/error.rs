//! Error types for every stage of the pipeline.
//!
//! Compile-time errors carry a source location, runtime errors carry the cycle
//! at which the VM trapped. Verification never errors: an invalid proof is a
//! `false` result.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 1-based source position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("syntax error at line {line}, column {column}: {message}")]
pub struct SyntaxError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeErrorKind {
    UnresolvedReference,
    TypeMismatch,
    ArityMismatch,
    CyclicType,
}

impl fmt::Display for TypeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeErrorKind::UnresolvedReference => "unresolved reference",
            TypeErrorKind::TypeMismatch => "type mismatch",
            TypeErrorKind::ArityMismatch => "arity mismatch",
            TypeErrorKind::CyclicType => "cyclic type",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} at {location}: {message}")]
pub struct TypeError {
    pub kind: TypeErrorKind,
    pub location: Span,
    pub message: String,
}

impl TypeError {
    pub fn new(kind: TypeErrorKind, location: Span, message: impl Into<String>) -> Self {
        Self {
            kind,
            location,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error("unknown entry point `{0}`")]
    UnknownEntry(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    TypeMismatch(String),
    IndexOutOfBounds { index: u64, len: usize },
    DivisionByZero,
    Overflow,
    AuthorizationDenied,
    StackUnderflow,
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeErrorKind::TypeMismatch(msg) => write!(f, "type mismatch: {msg}"),
            RuntimeErrorKind::IndexOutOfBounds { index, len } => {
                write!(f, "index {index} out of bounds for length {len}")
            }
            RuntimeErrorKind::DivisionByZero => f.write_str("division by zero"),
            RuntimeErrorKind::Overflow => f.write_str("arithmetic overflow"),
            RuntimeErrorKind::AuthorizationDenied => f.write_str("authorization denied"),
            RuntimeErrorKind::StackUnderflow => f.write_str("stack underflow"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("runtime error at cycle {cycle}: {kind}")]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub cycle: u64,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind, cycle: u64) -> Self {
        Self { kind, cycle }
    }

    pub fn type_mismatch(message: impl Into<String>, cycle: u64) -> Self {
        Self::new(RuntimeErrorKind::TypeMismatch(message.into()), cycle)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    #[error("proof generation failed: {0}")]
    GenerationFailure(String),
}

/// Umbrella error returned by the top-level API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Proof(#[from] ProofError),
}
