//! Self-describing bytecode image format
//!
//! An [`Image`] is the flat artifact the code generator hands to the runtime:
//! header, deduplicated string table, structure layouts, function directory
//! and one contiguous instruction stream. Scalar constants are encoded inline
//! in the instruction stream; the string table is the only pooled constant
//! section.

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use thiserror::Error;

/// Magic number for shade bytecode images: "SHDB"
pub const MAGIC: [u8; 4] = *b"SHDB";

/// Current bytecode version
pub const VERSION: u32 = 1;

/// Image encoding/decoding errors
#[derive(Debug, Error)]
pub enum ImageError {
    /// Decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected SHDB, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum stored in the header
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
    },
}

/// A named, typed parameter (also used for structure fields)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    /// Parameter or field name
    pub name: String,
    /// Declared type name, in source-language spelling
    pub ty: String,
}

impl Param {
    /// Create a new parameter
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
        }
    }

    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_string(&self.name);
        writer.emit_string(&self.ty);
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            name: reader.read_string()?,
            ty: reader.read_string()?,
        })
    }
}

/// One entry of a function's source line map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// Code offset relative to the function body start
    pub offset: u32,
    /// 1-based source line
    pub line: u32,
}

/// Function directory entry
#[derive(Debug, Clone)]
pub struct FunctionDef {
    /// Function name
    pub name: String,
    /// Return type name
    pub ret: String,
    /// Parameters, in declaration order
    pub params: Vec<Param>,
    /// Total local slot count (parameters occupy the first slots)
    pub local_count: usize,
    /// Body offset into the image code section
    pub offset: usize,
    /// Body length in bytes
    pub len: usize,
    /// Source line map, sorted by offset
    pub lines: Vec<LineEntry>,
}

impl FunctionDef {
    /// Offset (function-relative) of the first instruction whose source line
    /// is `>= line`, or None if the function has no such instruction.
    pub fn offset_at_line(&self, line: u32) -> Option<u32> {
        self.lines
            .iter()
            .filter(|e| e.line >= line)
            .min_by_key(|e| (e.line, e.offset))
            .map(|e| e.offset)
    }

    /// Source line of the last line marker at or before `rel_offset`.
    pub fn line_at_offset(&self, rel_offset: u32) -> Option<u32> {
        self.lines
            .iter()
            .take_while(|e| e.offset <= rel_offset)
            .last()
            .map(|e| e.line)
    }

    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_string(&self.name);
        writer.emit_string(&self.ret);
        writer.emit_u32(self.params.len() as u32);
        for param in &self.params {
            param.encode(writer);
        }
        writer.emit_u32(self.local_count as u32);
        writer.emit_u32(self.offset as u32);
        writer.emit_u32(self.len as u32);
        writer.emit_u32(self.lines.len() as u32);
        for entry in &self.lines {
            writer.emit_u32(entry.offset);
            writer.emit_u32(entry.line);
        }
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let name = reader.read_string()?;
        let ret = reader.read_string()?;
        let param_count = reader.read_u32()? as usize;
        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            params.push(Param::decode(reader)?);
        }
        let local_count = reader.read_u32()? as usize;
        let offset = reader.read_u32()? as usize;
        let len = reader.read_u32()? as usize;
        let line_count = reader.read_u32()? as usize;
        let mut lines = Vec::with_capacity(line_count);
        for _ in 0..line_count {
            lines.push(LineEntry {
                offset: reader.read_u32()?,
                line: reader.read_u32()?,
            });
        }
        Ok(Self {
            name,
            ret,
            params,
            local_count,
            offset,
            len,
            lines,
        })
    }
}

/// User-defined structure layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructureDef {
    /// Structure name
    pub name: String,
    /// Ordered fields
    pub fields: Vec<Param>,
}

impl StructureDef {
    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_string(&self.name);
        writer.emit_u32(self.fields.len() as u32);
        for field in &self.fields {
            field.encode(writer);
        }
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let name = reader.read_string()?;
        let field_count = reader.read_u32()? as usize;
        let mut fields = Vec::with_capacity(field_count);
        for _ in 0..field_count {
            fields.push(Param::decode(reader)?);
        }
        Ok(Self { name, fields })
    }
}

/// A compiled shade bytecode image
#[derive(Debug, Clone)]
pub struct Image {
    /// Magic number (must be "SHDB")
    pub magic: [u8; 4],
    /// Bytecode version
    pub version: u32,
    /// Image flags (reserved)
    pub flags: u32,
    /// Deduplicated string table
    pub strings: Vec<String>,
    /// Structure layouts
    pub structures: Vec<StructureDef>,
    /// Function directory
    pub functions: Vec<FunctionDef>,
    /// Flat instruction stream; functions address into it by offset/len
    pub code: Vec<u8>,
}

impl Image {
    /// Create a new empty image
    pub fn new() -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags: 0,
            strings: Vec::new(),
            structures: Vec::new(),
            functions: Vec::new(),
            code: Vec::new(),
        }
    }

    /// Resolve a string table id
    pub fn string(&self, id: u32) -> Option<&str> {
        self.strings.get(id as usize).map(String::as_str)
    }

    /// Find a function directory entry by name
    pub fn function(&self, name: &str) -> Option<(usize, &FunctionDef)> {
        self.functions
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }

    /// Find a structure layout by name
    pub fn structure(&self, name: &str) -> Option<&StructureDef> {
        self.structures.iter().find(|s| s.name == name)
    }

    /// Validate the header fields
    pub fn validate(&self) -> Result<(), ImageError> {
        if self.magic != MAGIC {
            return Err(ImageError::InvalidMagic(self.magic));
        }
        if self.version != VERSION {
            return Err(ImageError::UnsupportedVersion(self.version));
        }
        Ok(())
    }

    /// Encode the image to its binary format
    ///
    /// Layout: header (magic + version + flags + crc32 checksum), string
    /// table, structure table, function directory, code section. The checksum
    /// covers everything after the header.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BytecodeWriter::new();

        writer.emit_bytes(&self.magic);
        writer.emit_u32(self.version);
        writer.emit_u32(self.flags);
        let checksum_offset = writer.offset();
        writer.emit_u32(0);

        writer.emit_u32(self.strings.len() as u32);
        for s in &self.strings {
            writer.emit_string(s);
        }

        writer.emit_u32(self.structures.len() as u32);
        for s in &self.structures {
            s.encode(&mut writer);
        }

        writer.emit_u32(self.functions.len() as u32);
        for f in &self.functions {
            f.encode(&mut writer);
        }

        writer.emit_u32(self.code.len() as u32);
        writer.emit_bytes(&self.code);

        let payload = &writer.buffer()[16..];
        let checksum = crc32fast::hash(payload);
        writer.patch_u32(checksum_offset, checksum);

        writer.into_bytes()
    }

    /// Decode an image from its binary format
    pub fn decode(data: &[u8]) -> Result<Self, ImageError> {
        let mut reader = BytecodeReader::new(data);

        let magic_bytes = reader.read_bytes(4)?;
        let magic: [u8; 4] = magic_bytes.try_into().unwrap();
        if magic != MAGIC {
            return Err(ImageError::InvalidMagic(magic));
        }

        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }

        let flags = reader.read_u32()?;
        let stored_checksum = reader.read_u32()?;

        let payload = &data[16..];
        let actual = crc32fast::hash(payload);
        if stored_checksum != actual {
            return Err(ImageError::ChecksumMismatch {
                expected: stored_checksum,
                actual,
            });
        }

        let string_count = reader.read_u32()? as usize;
        let mut strings = Vec::with_capacity(string_count);
        for _ in 0..string_count {
            strings.push(reader.read_string()?);
        }

        let structure_count = reader.read_u32()? as usize;
        let mut structures = Vec::with_capacity(structure_count);
        for _ in 0..structure_count {
            structures.push(StructureDef::decode(&mut reader)?);
        }

        let function_count = reader.read_u32()? as usize;
        let mut functions = Vec::with_capacity(function_count);
        for _ in 0..function_count {
            functions.push(FunctionDef::decode(&mut reader)?);
        }

        let code_len = reader.read_u32()? as usize;
        let code = reader.read_bytes(code_len)?;

        Ok(Self {
            magic,
            version,
            flags,
            strings,
            structures,
            functions,
            code,
        })
    }
}

impl Default for Image {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_image_roundtrip() {
        let image = Image::new();
        let bytes = image.encode();
        let decoded = Image::decode(&bytes).unwrap();

        assert_eq!(decoded.magic, MAGIC);
        assert_eq!(decoded.version, VERSION);
        assert!(decoded.strings.is_empty());
        assert!(decoded.functions.is_empty());
        assert!(decoded.structures.is_empty());
    }

    #[test]
    fn test_image_roundtrip() {
        let mut image = Image::new();
        image.strings.push("main".to_string());
        image.strings.push("gl_FragColor".to_string());
        image.structures.push(StructureDef {
            name: "Light".to_string(),
            fields: vec![Param::new("dir", "vec3"), Param::new("color", "vec4")],
        });
        image.code = vec![0x04, 0x61];
        image.functions.push(FunctionDef {
            name: "main".to_string(),
            ret: "void".to_string(),
            params: vec![],
            local_count: 0,
            offset: 0,
            len: 2,
            lines: vec![LineEntry { offset: 0, line: 1 }],
        });

        let bytes = image.encode();
        let decoded = Image::decode(&bytes).unwrap();

        assert_eq!(decoded.strings, image.strings);
        assert_eq!(decoded.structures[0].name, "Light");
        assert_eq!(decoded.structures[0].fields.len(), 2);
        assert_eq!(decoded.functions[0].name, "main");
        assert_eq!(decoded.functions[0].len, 2);
        assert_eq!(decoded.functions[0].lines[0].line, 1);
        assert_eq!(decoded.code, image.code);
    }

    #[test]
    fn test_checksum_validation() {
        let mut image = Image::new();
        image.strings.push("x".to_string());
        let mut bytes = image.encode();

        bytes[20] ^= 0xFF;
        let result = Image::decode(&bytes);
        assert!(matches!(result, Err(ImageError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = vec![b'X', b'X', b'X', b'X'];
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let result = Image::decode(&bytes);
        assert!(matches!(result, Err(ImageError::InvalidMagic(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"SHDB");
        bytes.extend_from_slice(&999u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let result = Image::decode(&bytes);
        assert!(matches!(result, Err(ImageError::UnsupportedVersion(999))));
    }

    #[test]
    fn test_line_map_lookup() {
        let f = FunctionDef {
            name: "main".to_string(),
            ret: "void".to_string(),
            params: vec![],
            local_count: 0,
            offset: 0,
            len: 30,
            lines: vec![
                LineEntry { offset: 0, line: 2 },
                LineEntry { offset: 10, line: 3 },
                LineEntry { offset: 20, line: 5 },
            ],
        };

        assert_eq!(f.offset_at_line(1), Some(0));
        assert_eq!(f.offset_at_line(3), Some(10));
        assert_eq!(f.offset_at_line(4), Some(20));
        assert_eq!(f.offset_at_line(6), None);

        assert_eq!(f.line_at_offset(0), Some(2));
        assert_eq!(f.line_at_offset(15), Some(3));
        assert_eq!(f.line_at_offset(25), Some(5));
    }
}
