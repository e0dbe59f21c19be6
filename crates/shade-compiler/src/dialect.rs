//! Shading-language dialects
//!
//! The front-end is dialect-parameterized: type spellings differ between
//! GLSL (`vec4`, `mat4`, `sampler2D`) and HLSL (`float4`, `float4x4`,
//! `Texture2D`), but the grammar and lowering are shared. `Custom` keeps the
//! type tables open for front-ends implemented outside this crate.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use shade_vm::ValueKind;

/// Component names in declaration order
pub const COMPONENTS: [&str; 4] = ["x", "y", "z", "w"];

/// The three swizzle alphabets; each maps position-wise onto `COMPONENTS`
pub const SWIZZLE_SETS: [[char; 4]; 3] = [
    ['x', 'y', 'z', 'w'],
    ['r', 'g', 'b', 'a'],
    ['s', 't', 'p', 'q'],
];

/// Source language of a front-end instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// OpenGL Shading Language spellings
    Glsl,
    /// HLSL spellings
    Hlsl,
    /// No built-in type table; everything resolves through user structures
    Custom,
}

struct VectorInfo {
    size: usize,
    component: ValueKind,
}

static GLSL_VECTORS: Lazy<FxHashMap<&'static str, VectorInfo>> = Lazy::new(|| {
    let mut m = FxHashMap::default();
    for (n, names) in [(2usize, ["vec2", "ivec2", "uvec2", "bvec2"]),
        (3, ["vec3", "ivec3", "uvec3", "bvec3"]),
        (4, ["vec4", "ivec4", "uvec4", "bvec4"])]
    {
        let kinds = [ValueKind::F32, ValueKind::I32, ValueKind::U32, ValueKind::Bool];
        for (name, kind) in names.into_iter().zip(kinds) {
            m.insert(name, VectorInfo { size: n, component: kind });
        }
    }
    m
});

static HLSL_VECTORS: Lazy<FxHashMap<&'static str, VectorInfo>> = Lazy::new(|| {
    let mut m = FxHashMap::default();
    for (n, names) in [(2usize, ["float2", "int2", "uint2", "bool2"]),
        (3, ["float3", "int3", "uint3", "bool3"]),
        (4, ["float4", "int4", "uint4", "bool4"])]
    {
        let kinds = [ValueKind::F32, ValueKind::I32, ValueKind::U32, ValueKind::Bool];
        for (name, kind) in names.into_iter().zip(kinds) {
            m.insert(name, VectorInfo { size: n, component: kind });
        }
    }
    m
});

impl Dialect {
    /// Scalar kind of a scalar type name
    pub fn scalar_kind(self, name: &str) -> Option<ValueKind> {
        match name {
            "float" | "half" | "double" => Some(ValueKind::F32),
            "int" => Some(ValueKind::I32),
            "uint" => Some(ValueKind::U32),
            "bool" => Some(ValueKind::Bool),
            _ => None,
        }
    }

    fn vectors(self) -> Option<&'static FxHashMap<&'static str, VectorInfo>> {
        match self {
            Dialect::Glsl => Some(&GLSL_VECTORS),
            Dialect::Hlsl => Some(&HLSL_VECTORS),
            Dialect::Custom => None,
        }
    }

    /// Component count of a vector type name
    pub fn vector_size(self, name: &str) -> Option<usize> {
        self.vectors()?.get(name).map(|v| v.size)
    }

    /// Component kind of a vector type name
    pub fn vector_component(self, name: &str) -> Option<ValueKind> {
        self.vectors()?.get(name).map(|v| v.component)
    }

    /// Float vector class name with `n` components, in this dialect's
    /// spelling; used when a swizzle builds a shorter vector.
    pub fn vector_class(self, n: usize) -> Option<&'static str> {
        match (self, n) {
            (Dialect::Glsl, 2) => Some("vec2"),
            (Dialect::Glsl, 3) => Some("vec3"),
            (Dialect::Glsl, 4) => Some("vec4"),
            (Dialect::Hlsl, 2) => Some("float2"),
            (Dialect::Hlsl, 3) => Some("float3"),
            (Dialect::Hlsl, 4) => Some("float4"),
            _ => None,
        }
    }

    /// Column count of a square matrix type name
    pub fn matrix_size(self, name: &str) -> Option<usize> {
        match (self, name) {
            (Dialect::Glsl, "mat2") => Some(2),
            (Dialect::Glsl, "mat3") => Some(3),
            (Dialect::Glsl, "mat4") => Some(4),
            (Dialect::Hlsl, "float2x2") => Some(2),
            (Dialect::Hlsl, "float3x3") => Some(3),
            (Dialect::Hlsl, "float4x4") => Some(4),
            _ => None,
        }
    }

    /// Column vector class of a matrix type name
    pub fn matrix_column_class(self, name: &str) -> Option<&'static str> {
        self.matrix_size(name).and_then(|n| self.vector_class(n))
    }

    /// Whether a type name is an opaque sampler/texture handle
    pub fn is_sampler(self, name: &str) -> bool {
        match self {
            Dialect::Glsl => matches!(
                name,
                "sampler2D" | "sampler3D" | "samplerCube" | "sampler2DShadow"
            ),
            Dialect::Hlsl => matches!(name, "Texture2D" | "Texture3D" | "TextureCube" | "SamplerState"),
            Dialect::Custom => false,
        }
    }

    /// Whether a type name is any built-in (scalar, vector, matrix, sampler)
    pub fn is_builtin_type(self, name: &str) -> bool {
        name == "void"
            || self.scalar_kind(name).is_some()
            || self.vector_size(name).is_some()
            || self.matrix_size(name).is_some()
            || self.is_sampler(name)
    }

    /// Map a swizzle character to its component position
    pub fn swizzle_index(c: char) -> Option<usize> {
        SWIZZLE_SETS
            .iter()
            .find_map(|set| set.iter().position(|&s| s == c))
    }
}
