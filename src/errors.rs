use std::io;
use thiserror::Error;

/// Compiler-specific errors that we want to handle specifically
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("duplicate symbol in scope: {0}")]
    DuplicateSymbol(String),
    #[error("duplicate function name: {0}")]
    DuplicateFunction(String),
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("function {name} expects {expected} arguments but got {got}")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("integer literal {0} outside 0..=255")]
    LiteralRange(i32),
    #[error("array size {0} outside 1..=255")]
    ArraySize(i32),
    #[error("array index must be a compile time constant")]
    NonConstantIndex,
    #[error("index {index} out of bounds for {name} of size {size}")]
    IndexOutOfBounds {
        name: String,
        index: usize,
        size: usize,
    },
    #[error("division or modulo by constant zero")]
    DivisionByZero,
    #[error("recursive call to {0}")]
    RecursiveCall(String),
    #[error("return outside of a value returning function")]
    ReturnOutsideFunction,
    #[error("call to void function {0} in expression position")]
    VoidCall(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("allocator invariant violated: {0}")]
    Allocator(String),
    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Interpreter-specific errors that we want to handle specifically
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unmatched '[' at instruction {0}")]
    UnmatchedOpen(usize),
    #[error("unmatched ']' at instruction {0}")]
    UnmatchedClose(usize),
    #[error("tape pointer out of bounds")]
    PointerOutOfBounds,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// For compiler operations where we want specific error handling
pub type CompileResult<T> = std::result::Result<T, CompileError>;

// For interpreter operations where we want specific error handling
pub type RunResult<T> = std::result::Result<T, RuntimeError>;

// For general operations where we want to propagate errors with anyhow
pub type Result<T> = anyhow::Result<T>;
