//! Compilation errors

use shade_bytecode::GeneratorError;
use thiserror::Error;

/// Result alias for compilation
pub type CompileResult<T> = Result<T, CompileError>;

/// Errors produced by the front-end pipeline
#[derive(Debug, Error)]
pub enum CompileError {
    /// Syntax error with source location
    #[error("Parse error at {line}:{col}: {message}")]
    Parse {
        /// 1-based source line
        line: u32,
        /// 1-based column
        col: u32,
        /// Human-readable description
        message: String,
    },

    /// Preprocessor directive error
    #[error("Preprocessor error at line {line}: {message}")]
    Preprocessor {
        /// 1-based source line
        line: u32,
        /// Human-readable description
        message: String,
    },

    /// Reference to a variable that is neither a local nor a known global
    #[error("Undefined variable: {name} (line {line})")]
    UndefinedVariable {
        /// The unknown name
        name: String,
        /// 1-based source line of the reference
        line: u32,
    },

    /// Declaration with an unknown type name
    #[error("Unknown type: {name} (line {line})")]
    UnknownType {
        /// The unknown type name
        name: String,
        /// 1-based source line of the declaration
        line: u32,
    },

    /// Assignment to something that is not an lvalue
    #[error("Invalid assignment target (line {line})")]
    InvalidAssignmentTarget {
        /// 1-based source line
        line: u32,
    },

    /// `break` outside a loop
    #[error("break outside of a loop (line {line})")]
    InvalidBreak {
        /// 1-based source line
        line: u32,
    },

    /// `continue` outside a loop
    #[error("continue outside of a loop (line {line})")]
    InvalidContinue {
        /// 1-based source line
        line: u32,
    },

    /// The requested entry point does not exist
    #[error("Entry function not found: {0}")]
    EntryNotFound(String),

    /// Immediate expressions are read-only
    #[error("Assignments are not allowed in immediate expressions")]
    ImmediateAssignment,

    /// Feature outside the supported language surface
    #[error("Unsupported feature: {0}")]
    Unsupported(String),

    /// Bytecode generation error
    #[error(transparent)]
    Generator(#[from] GeneratorError),
}
