//! Bytecode definitions for the shade shader debugger
//!
//! This crate provides the instruction set, the self-describing image format
//! produced by the compiler, and the append-only code generator that builds it.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod encoder;
pub mod generator;
pub mod image;
pub mod opcode;

pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError};
pub use generator::{FunctionBuilder, Generator, GeneratorError, JumpPatch};
pub use image::{FunctionDef, Image, ImageError, LineEntry, Param, StructureDef};
pub use opcode::Opcode;
