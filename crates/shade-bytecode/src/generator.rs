//! Append-only code generator
//!
//! The [`Generator`] owns the string table and accumulates structures and
//! function bodies; [`finalize`](Generator::finalize) lays the bodies out
//! into one flat code section and produces the [`Image`]. Function bodies are
//! built through [`FunctionBuilder`], which handles operand encoding, jump
//! patching and the source line map.

use crate::image::{FunctionDef, Image, LineEntry, Param, StructureDef};
use crate::opcode::Opcode;
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Errors produced while building an image
#[derive(Debug, Error)]
pub enum GeneratorError {
    /// The generator was already finalized
    #[error("Generator already finalized; no further definitions accepted")]
    Finalized,

    /// A function with the same name was already defined
    #[error("Duplicate function definition: {0}")]
    DuplicateFunction(String),

    /// A structure with the same name was already defined
    #[error("Duplicate structure definition: {0}")]
    DuplicateStructure(String),

    /// Local slot space exhausted
    #[error("Too many local variables (max 65535)")]
    TooManyLocals,
}

/// Handle to an unresolved forward jump inside a [`FunctionBuilder`]
#[derive(Debug, Clone, Copy)]
pub struct JumpPatch(usize);

/// Builder for one function body
pub struct FunctionBuilder {
    name: String,
    ret: String,
    params: Vec<Param>,
    local_count: usize,
    code: Vec<u8>,
    lines: Vec<LineEntry>,
}

impl FunctionBuilder {
    /// Create a builder; parameters occupy the first local slots.
    pub fn new(name: impl Into<String>, ret: impl Into<String>, params: Vec<Param>) -> Self {
        let local_count = params.len();
        Self {
            name: name.into(),
            ret: ret.into(),
            params,
            local_count,
            code: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Allocate a fresh local slot, returning its index
    pub fn alloc_local(&mut self) -> Result<u16, GeneratorError> {
        if self.local_count >= u16::MAX as usize {
            return Err(GeneratorError::TooManyLocals);
        }
        let slot = self.local_count as u16;
        self.local_count += 1;
        Ok(slot)
    }

    /// Total local slot count allocated so far (including parameters)
    pub fn local_count(&self) -> usize {
        self.local_count
    }

    /// Current code position (for jump targets)
    pub fn position(&self) -> usize {
        self.code.len()
    }

    /// Emit an opcode without operands
    pub fn emit(&mut self, opcode: Opcode) {
        self.code.push(opcode.to_u8());
    }

    /// Emit a raw u8 operand
    pub fn emit_u8(&mut self, value: u8) {
        self.code.push(value);
    }

    /// Emit a u16 operand (little-endian)
    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a u32 operand (little-endian)
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit CONST_I32 with value
    pub fn emit_const_i32(&mut self, value: i32) {
        self.emit(Opcode::ConstI32);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit CONST_F32 with value
    pub fn emit_const_f32(&mut self, value: f32) {
        self.emit(Opcode::ConstF32);
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit CONST_STR with string table id
    pub fn emit_const_str(&mut self, id: u32) {
        self.emit(Opcode::ConstStr);
        self.emit_u32(id);
    }

    /// Emit LOAD_LOCAL
    pub fn emit_load_local(&mut self, slot: u16) {
        self.emit(Opcode::LoadLocal);
        self.emit_u16(slot);
    }

    /// Emit STORE_LOCAL
    pub fn emit_store_local(&mut self, slot: u16) {
        self.emit(Opcode::StoreLocal);
        self.emit_u16(slot);
    }

    /// Emit LOAD_GLOBAL with name id
    pub fn emit_load_global(&mut self, id: u32) {
        self.emit(Opcode::LoadGlobal);
        self.emit_u32(id);
    }

    /// Emit STORE_GLOBAL with name id
    pub fn emit_store_global(&mut self, id: u32) {
        self.emit(Opcode::StoreGlobal);
        self.emit_u32(id);
    }

    /// Emit GET_PROP with property name id
    pub fn emit_get_prop(&mut self, id: u32) {
        self.emit(Opcode::GetProp);
        self.emit_u32(id);
    }

    /// Emit SET_PROP with property name id
    pub fn emit_set_prop(&mut self, id: u32) {
        self.emit(Opcode::SetProp);
        self.emit_u32(id);
    }

    /// Emit NEW_OBJECT with class name id and argument count
    pub fn emit_new_object(&mut self, id: u32, argc: u8) {
        self.emit(Opcode::NewObject);
        self.emit_u32(id);
        self.emit_u8(argc);
    }

    /// Emit NEW_ARRAY with element count
    pub fn emit_new_array(&mut self, len: u16) {
        self.emit(Opcode::NewArray);
        self.emit_u16(len);
    }

    /// Emit CALL with callee name id and argument count
    pub fn emit_call(&mut self, id: u32, argc: u8) {
        self.emit(Opcode::Call);
        self.emit_u32(id);
        self.emit_u8(argc);
    }

    /// Emit COERCE with a scalar kind code
    pub fn emit_coerce(&mut self, kind: u8) {
        self.emit(Opcode::Coerce);
        self.emit_u8(kind);
    }

    /// Emit a LINE marker and record it in the line map
    pub fn mark_line(&mut self, line: u32) {
        self.lines.push(LineEntry {
            offset: self.code.len() as u32,
            line,
        });
        self.emit(Opcode::Line);
        self.emit_u32(line);
    }

    /// Emit a forward jump with a placeholder offset; patch later with
    /// [`patch_jump`](Self::patch_jump).
    pub fn emit_jump(&mut self, opcode: Opcode) -> JumpPatch {
        debug_assert!(opcode.is_jump());
        self.emit(opcode);
        let pos = self.code.len();
        self.code.extend_from_slice(&0i32.to_le_bytes());
        JumpPatch(pos)
    }

    /// Resolve a forward jump to the current position
    pub fn patch_jump(&mut self, patch: JumpPatch) {
        let offset = (self.code.len() as i64 - (patch.0 as i64 + 4)) as i32;
        self.code[patch.0..patch.0 + 4].copy_from_slice(&offset.to_le_bytes());
    }

    /// Emit a backward jump to an already-known target position
    pub fn emit_jump_back(&mut self, opcode: Opcode, target: usize) {
        debug_assert!(opcode.is_jump());
        self.emit(opcode);
        let next = self.code.len() as i64 + 4;
        let offset = (target as i64 - next) as i32;
        self.code.extend_from_slice(&offset.to_le_bytes());
    }

    fn build(self) -> (FunctionDef, Vec<u8>) {
        let def = FunctionDef {
            name: self.name,
            ret: self.ret,
            params: self.params,
            local_count: self.local_count,
            offset: 0,
            len: self.code.len(),
            lines: self.lines,
        };
        (def, self.code)
    }
}

/// Append-only image builder; owns the string table
pub struct Generator {
    strings: Vec<String>,
    string_map: FxHashMap<String, u32>,
    structures: Vec<StructureDef>,
    functions: Vec<(FunctionDef, Vec<u8>)>,
    finalized: Option<Image>,
}

impl Generator {
    /// Create a new generator
    pub fn new() -> Self {
        Self {
            strings: Vec::new(),
            string_map: FxHashMap::default(),
            structures: Vec::new(),
            functions: Vec::new(),
            finalized: None,
        }
    }

    /// Intern a string, returning its table id (deduplicating)
    pub fn define_string(&mut self, s: &str) -> Result<u32, GeneratorError> {
        if self.finalized.is_some() {
            return Err(GeneratorError::Finalized);
        }
        if let Some(&id) = self.string_map.get(s) {
            return Ok(id);
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_map.insert(s.to_string(), id);
        Ok(id)
    }

    /// The string table built so far
    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    /// Register a structure layout
    pub fn define_structure(&mut self, def: StructureDef) -> Result<(), GeneratorError> {
        if self.finalized.is_some() {
            return Err(GeneratorError::Finalized);
        }
        if self.structures.iter().any(|s| s.name == def.name) {
            return Err(GeneratorError::DuplicateStructure(def.name));
        }
        self.structures.push(def);
        Ok(())
    }

    /// Register a finished function body
    pub fn define_function(&mut self, builder: FunctionBuilder) -> Result<(), GeneratorError> {
        if self.finalized.is_some() {
            return Err(GeneratorError::Finalized);
        }
        if self.functions.iter().any(|(f, _)| f.name == builder.name) {
            return Err(GeneratorError::DuplicateFunction(builder.name));
        }
        self.functions.push(builder.build());
        Ok(())
    }

    /// Whether a function with this name was already defined
    pub fn has_function(&self, name: &str) -> bool {
        self.functions.iter().any(|(f, _)| f.name == name)
    }

    /// Lay out all function bodies and produce the image.
    ///
    /// Idempotent: repeated calls return the same image; definitions after
    /// the first call are rejected.
    pub fn finalize(&mut self) -> Image {
        if let Some(image) = &self.finalized {
            return image.clone();
        }

        let mut image = Image::new();
        image.strings = self.strings.clone();
        image.structures = self.structures.clone();

        for (def, code) in &self.functions {
            let mut def = def.clone();
            def.offset = image.code.len();
            image.code.extend_from_slice(code);
            image.functions.push(def);
        }

        self.finalized = Some(image.clone());
        image
    }
}

impl Default for Generator {
    fn default() -> Self {
        Self::new()
    }
}
