//! shade VM core runtime
//!
//! This crate provides the runtime half of the shade shader debugger:
//! - Tagged value model with deep copy semantics
//! - Instantiated programs with host extension points
//! - The abortable stepping interpreter
//! - Host function libraries

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod library;
pub mod object;
pub mod program;
pub mod stepper;
pub mod value;

pub use library::{HostFn, Library};
pub use object::Object;
pub use program::{DefaultConstructor, LinkError, Program, PropertyGetter};
pub use stepper::{Frame, StepOutcome, Stepper};
pub use value::{SlotRef, Value, ValueKind};

/// VM execution errors
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// Call depth limit reached
    #[error("Stack overflow")]
    StackOverflow,

    /// Operand stack underflow
    #[error("Stack underflow")]
    StackUnderflow,

    /// Invalid opcode byte in the instruction stream
    #[error("Invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),

    /// Instruction stream ended inside an instruction
    #[error("Truncated instruction stream at offset {0}")]
    TruncatedCode(usize),

    /// String table id out of range
    #[error("Invalid string id: {0}")]
    BadStringId(u32),

    /// Call target not found in the function table or linked libraries
    #[error("Undefined function: {0}")]
    UndefinedFunction(String),

    /// Global read before any definition
    #[error("Undefined global: {0}")]
    UndefinedGlobal(String),

    /// Property not found and not handled by the property-getter extension
    #[error("Unknown property .{name} on {class}")]
    UnknownProperty {
        /// Class name of the object
        class: String,
        /// Property that was requested
        name: String,
    },

    /// Object construction for a class the program does not know
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// Operand kinds incompatible with the operation
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Local slot index outside the frame's declared slot count
    #[error("Local slot {slot} out of range (frame has {count} slots)")]
    LocalOutOfRange {
        /// Requested slot
        slot: usize,
        /// Slots in the frame
        count: usize,
    },

    /// Array access outside bounds
    #[error("Index {index} out of bounds (length {len})")]
    IndexOutOfBounds {
        /// Requested index
        index: i64,
        /// Array length
        len: usize,
    },

    /// Integer division or modulo by zero
    #[error("Division by zero")]
    DivisionByZero,

    /// Call with the wrong number of arguments
    #[error("Function {name} expects {expected} arguments, got {got}")]
    ArgumentCount {
        /// Callee name
        name: String,
        /// Declared parameter count
        expected: usize,
        /// Arguments supplied
        got: usize,
    },

    /// Configured step budget exhausted
    #[error("Step budget exhausted")]
    StepBudgetExhausted,

    /// Name conflict at link time
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// VM execution result
pub type VmResult<T> = Result<T, VmError>;
