//! Breakpoints
//!
//! A breakpoint traps a source line. The conditional form carries the
//! bytecode of its condition, compiled through the immediate front-end at
//! insertion time; the debugger evaluates it whenever the line is entered
//! and only pauses when the result is truthy.

use shade_bytecode::Image;

/// A source-line trap
#[derive(Debug, Clone)]
pub struct Breakpoint {
    /// 1-based source line
    pub line: u32,
    /// Condition source, kept for display
    pub condition_source: Option<String>,
    /// Compiled condition (an immediate-mode image)
    pub condition: Option<Image>,
}

impl Breakpoint {
    /// Unconditional breakpoint
    pub fn at(line: u32) -> Self {
        Self {
            line,
            condition_source: None,
            condition: None,
        }
    }

    /// Conditional breakpoint with its compiled condition
    pub fn conditional(line: u32, source: impl Into<String>, condition: Image) -> Self {
        Self {
            line,
            condition_source: Some(source.into()),
            condition: Some(condition),
        }
    }

    /// Whether this breakpoint carries a condition
    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}
