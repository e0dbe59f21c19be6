//! shade: a CPU-side stepping debugger for C-family shading languages
//!
//! The debugger compiles a shader through a pluggable front-end, instantiates
//! the resulting bytecode image, and drives it one observable step at a time:
//!
//! ```no_run
//! use shade_debugger::{Debugger, DebugStop, Stage};
//! use shade_compiler::GlslFrontend;
//!
//! let mut dbg = Debugger::new();
//! dbg.set_source::<GlslFrontend>(
//!     Stage::Fragment,
//!     "void main() { gl_FragColor = vec4(1.0, 0.5, 0.0, 1.0); }",
//!     "main",
//!     &[],
//!     None,
//! )?;
//! dbg.execute()?;
//! let _color = dbg.get_global_value("gl_FragColor");
//! # Ok::<(), shade_debugger::DebugError>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod breakpoint;
pub mod common;
pub mod debugger;
pub mod texture;

pub use breakpoint::Breakpoint;
pub use common::common_library;
pub use debugger::{DebugStop, Debugger};
pub use texture::{Filter, Texture, Wrap};

// The pieces callers need alongside the debugger
pub use shade_compiler::{CompileError, Frontend, Stage};
pub use shade_vm::{Library, LinkError, Value, VmError};

use shade_bytecode::ImageError;
use std::cell::Cell;
use thiserror::Error;

/// Shared flags host callbacks reach through the program's user-data handle
#[derive(Debug, Default)]
pub struct DebugHooks {
    /// Set by `$$discard` and `set_discarded`
    pub discarded: Cell<bool>,
}

/// Errors surfaced by the debugger
#[derive(Debug, Error)]
pub enum DebugError {
    /// Source failed to compile
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// The compiled image failed validation
    #[error("Invalid bytecode: {0}")]
    Image(#[from] ImageError),

    /// Linking host functions failed
    #[error(transparent)]
    Link(#[from] LinkError),

    /// The program failed at runtime; the debugger stays inspectable
    #[error("Runtime error: {0}")]
    Runtime(#[from] VmError),

    /// An immediate expression failed to compile or run; the main program
    /// state is untouched
    #[error("Immediate error: {0}")]
    Immediate(String),

    /// No source is installed
    #[error("No program installed; call set_source first")]
    NoProgram,
}
