//! The concrete C-family shading-language front-end
//!
//! [`ShaderFrontend`] drives the shared pipeline (preprocess, lex, parse,
//! collect symbols, generate) under a [`Dialect`]. [`GlslFrontend`] and
//! [`HlslFrontend`] pin the dialect through the type system so the debugger's
//! `set_source::<F>` selects the language at compile time, the same way for
//! both.

use crate::codegen;
use crate::dialect::{Dialect, COMPONENTS};
use crate::error::CompileResult;
use crate::lexer;
use crate::parser;
use crate::pp::{self, MacroTable};
use crate::symbols::{StorageQualifier, Symbols, Variable};
use crate::{Frontend, Stage, IMMEDIATE_RESULT};
use shade_bytecode::Image;
use shade_vm::{DefaultConstructor, Object, Program, PropertyGetter, Value, ValueKind};
use std::rc::Rc;

/// Dialect-parameterized front-end for C-family shading languages
pub struct ShaderFrontend {
    dialect: Dialect,
    immediate: bool,
    macros: MacroTable,
    symbols: Symbols,
    image: Option<Image>,
    immediate_globals: Vec<Variable>,
}

impl ShaderFrontend {
    /// Create a front-end for a specific dialect
    pub fn with_dialect(dialect: Dialect) -> Self {
        Self {
            dialect,
            immediate: false,
            macros: MacroTable::new(),
            symbols: Symbols::new(),
            image: None,
            immediate_globals: Vec::new(),
        }
    }

    fn seed_stage_globals(&mut self, stage: Stage) {
        if self.dialect != Dialect::Glsl {
            return;
        }
        let builtin = |name: &str, ty: &str, qualifier| Variable {
            name: name.to_string(),
            ty: ty.to_string(),
            qualifier,
            semantic: None,
            array_size: None,
        };
        match stage {
            Stage::Fragment => {
                self.symbols
                    .add_global(builtin("gl_FragColor", "vec4", StorageQualifier::Out));
                self.symbols
                    .add_global(builtin("gl_FragCoord", "vec4", StorageQualifier::In));
            }
            Stage::Vertex => {
                self.symbols
                    .add_global(builtin("gl_Position", "vec4", StorageQualifier::Out));
            }
            Stage::Compute => {}
        }
    }

    fn parse_normal(&mut self, stage: Stage, source: &str, entry: &str) -> CompileResult<()> {
        self.symbols.clear();
        self.image = None;
        self.seed_stage_globals(stage);

        let tokens = pp::preprocess(source, &mut self.macros)?;
        let shader = parser::parse_shader(&tokens, self.dialect)?;
        let image = codegen::generate(&shader, &mut self.symbols, self.dialect, entry)?;

        log::debug!(
            "compiled {:?} {:?} shader: {} functions, {} globals",
            self.dialect,
            stage,
            image.functions.len(),
            self.symbols.globals.len()
        );
        self.image = Some(image);
        Ok(())
    }

    fn parse_expression(&mut self, source: &str) -> CompileResult<()> {
        self.image = None;
        self.symbols.clear();
        for var in self.immediate_globals.clone() {
            self.symbols.add_global(var);
        }

        let tokens = lexer::tokenize(source)?;
        let expr = parser::parse_expression(&tokens, self.dialect)?;
        let image =
            codegen::generate_immediate(&expr, &mut self.symbols, self.dialect, IMMEDIATE_RESULT)?;
        self.image = Some(image);
        Ok(())
    }
}

impl Frontend for ShaderFrontend {
    fn new() -> Self {
        Self::with_dialect(Dialect::Glsl)
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn set_immediate(&mut self, on: bool) {
        self.immediate = on;
    }

    fn is_immediate(&self) -> bool {
        self.immediate
    }

    fn parse(&mut self, stage: Stage, source: &str, entry: &str) -> CompileResult<()> {
        if self.immediate {
            self.parse_expression(source)
        } else {
            self.parse_normal(stage, source, entry)
        }
    }

    fn image(&self) -> Option<&Image> {
        self.image.as_ref()
    }

    fn symbols(&self) -> &Symbols {
        &self.symbols
    }

    fn macros(&self) -> &MacroTable {
        &self.macros
    }

    fn macros_mut(&mut self) -> &mut MacroTable {
        &mut self.macros
    }

    fn add_macro(&mut self, name: &str, fragment: &str) -> CompileResult<()> {
        self.macros.define_source(name, fragment)
    }

    fn clear_definitions(&mut self) {
        self.symbols.clear();
        self.image = None;
        self.clear_immediate();
    }

    fn clear_immediate(&mut self) {
        self.immediate_globals.clear();
    }

    fn add_immediate_global(&mut self, var: Variable) {
        self.immediate_globals.push(var);
    }

    fn property_getter(&self) -> Option<PropertyGetter> {
        let dialect = self.dialect;
        Some(Rc::new(move |_: &Program, obj: &Object, name: &str| {
            swizzle(dialect, obj, name)
        }))
    }

    fn default_constructor(&self) -> Option<DefaultConstructor> {
        let dialect = self.dialect;
        Some(Rc::new(move |_: &Program, class: &str| {
            construct_builtin(dialect, class)
        }))
    }
}

/// GLSL-dialect front-end
pub struct GlslFrontend(ShaderFrontend);

/// HLSL-dialect front-end
pub struct HlslFrontend(ShaderFrontend);

macro_rules! delegate_frontend {
    ($outer:ident, $dialect:expr) => {
        impl Frontend for $outer {
            fn new() -> Self {
                Self(ShaderFrontend::with_dialect($dialect))
            }

            fn dialect(&self) -> Dialect {
                self.0.dialect()
            }

            fn set_immediate(&mut self, on: bool) {
                self.0.set_immediate(on)
            }

            fn is_immediate(&self) -> bool {
                self.0.is_immediate()
            }

            fn parse(&mut self, stage: Stage, source: &str, entry: &str) -> CompileResult<()> {
                self.0.parse(stage, source, entry)
            }

            fn image(&self) -> Option<&Image> {
                self.0.image()
            }

            fn symbols(&self) -> &Symbols {
                self.0.symbols()
            }

            fn macros(&self) -> &MacroTable {
                self.0.macros()
            }

            fn macros_mut(&mut self) -> &mut MacroTable {
                self.0.macros_mut()
            }

            fn add_macro(&mut self, name: &str, fragment: &str) -> CompileResult<()> {
                self.0.add_macro(name, fragment)
            }

            fn clear_definitions(&mut self) {
                self.0.clear_definitions()
            }

            fn clear_immediate(&mut self) {
                self.0.clear_immediate()
            }

            fn add_immediate_global(&mut self, var: Variable) {
                self.0.add_immediate_global(var)
            }

            fn property_getter(&self) -> Option<PropertyGetter> {
                self.0.property_getter()
            }

            fn default_constructor(&self) -> Option<DefaultConstructor> {
                self.0.default_constructor()
            }
        }
    };
}

delegate_frontend!(GlslFrontend, Dialect::Glsl);
delegate_frontend!(HlslFrontend, Dialect::Hlsl);

/// Swizzle fallback for vector-class objects: any 1-4 character combination
/// over the xyzw/rgba/stpq alphabets, position-mapped onto the object's
/// component order.
fn swizzle(dialect: Dialect, obj: &Object, name: &str) -> Option<Value> {
    if name.is_empty() || name.len() > 4 || !obj.is_numeric() || obj.len() > 4 {
        return None;
    }

    let mut picked = Vec::with_capacity(name.len());
    for c in name.chars() {
        let idx = Dialect::swizzle_index(c)?;
        let (_, v) = obj.props().get(idx)?;
        picked.push(v.clone());
    }

    if picked.len() == 1 {
        return picked.pop();
    }

    let class = dialect.vector_class(picked.len())?;
    let props = COMPONENTS
        .iter()
        .zip(picked)
        .map(|(n, v)| (n.to_string(), v))
        .collect();
    Some(Value::Object(Object::with_props(class, props)))
}

/// Construction fallback for built-in classes: zero-filled vectors, zero
/// matrices (columns `c0..cN`), empty sampler handles.
fn construct_builtin(dialect: Dialect, class: &str) -> Option<Value> {
    if let Some(n) = dialect.vector_size(class) {
        let kind = dialect.vector_component(class)?;
        let zero = match kind {
            ValueKind::F32 => Value::F32(0.0),
            ValueKind::I32 => Value::I32(0),
            ValueKind::U32 => Value::U32(0),
            ValueKind::Bool => Value::Bool(false),
            _ => Value::F32(0.0),
        };
        let props = COMPONENTS[..n]
            .iter()
            .map(|c| (c.to_string(), zero.clone()))
            .collect();
        return Some(Value::Object(Object::with_props(class, props)));
    }

    if let Some(n) = dialect.matrix_size(class) {
        let col_class = dialect.vector_class(n)?;
        let column = construct_builtin(dialect, col_class)?;
        let props = (0..n).map(|i| (format!("c{i}"), column.clone())).collect();
        return Some(Value::Object(Object::with_props(class, props)));
    }

    if dialect.is_sampler(class) {
        return Some(Value::Object(Object::new(class)));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fragment_shader() {
        let mut fe = GlslFrontend::new();
        fe.parse(
            Stage::Fragment,
            "void main() { gl_FragColor = vec4(1.0, 0.5, 0.0, 1.0); }",
            "main",
        )
        .unwrap();

        let image = fe.image().unwrap();
        assert!(image.function("main").is_some());
        assert_eq!(fe.symbols().global("gl_FragColor").unwrap().ty, "vec4");
    }

    #[test]
    fn test_parse_failure_leaves_no_image() {
        let mut fe = GlslFrontend::new();
        let err = fe.parse(Stage::Fragment, "void main( {", "main");
        assert!(err.is_err());
        assert!(fe.image().is_none());
    }

    #[test]
    fn test_macros_shared_across_parses() {
        let mut fe = GlslFrontend::new();
        fe.add_macro("BRIGHTNESS", "0.5").unwrap();

        fe.parse(
            Stage::Fragment,
            "void main() { gl_FragColor = vec4(BRIGHTNESS); }",
            "main",
        )
        .unwrap();

        // A second translation unit still sees the macro
        fe.parse(
            Stage::Fragment,
            "uniform float u;\nvoid main() { gl_FragColor = vec4(BRIGHTNESS + u); }",
            "main",
        )
        .unwrap();
        assert!(fe.macros().contains("BRIGHTNESS"));
    }

    #[test]
    fn test_immediate_mode_expression() {
        let mut fe = GlslFrontend::new();
        fe.set_immediate(true);
        fe.clear_immediate();
        fe.add_immediate_global(Variable::global("x", "int"));

        fe.parse(Stage::Fragment, "x * x + 1", "main").unwrap();
        let image = fe.image().unwrap();
        assert!(image.function(crate::IMMEDIATE_FUNCTION).is_some());
    }

    #[test]
    fn test_immediate_rejects_unknown_names() {
        let mut fe = GlslFrontend::new();
        fe.set_immediate(true);
        let err = fe.parse(Stage::Fragment, "nope + 1", "main");
        assert!(err.is_err());
    }

    #[test]
    fn test_hlsl_dialect_types() {
        let mut fe = HlslFrontend::new();
        fe.parse(
            Stage::Fragment,
            "float4 main() : SV_Target { float3 c = float3(1.0, 0.0, 0.0); return float4(c, 1.0); }",
            "main",
        )
        .unwrap();
        assert_eq!(fe.dialect(), Dialect::Hlsl);
    }

    #[test]
    fn test_swizzle_getter() {
        let obj = Object::with_props(
            "vec3",
            vec![
                ("x".into(), Value::F32(1.0)),
                ("y".into(), Value::F32(2.0)),
                ("z".into(), Value::F32(3.0)),
            ],
        );

        // Single component, color alphabet
        assert_eq!(swizzle(Dialect::Glsl, &obj, "g"), Some(Value::F32(2.0)));

        // Multi-component builds a shorter vector
        match swizzle(Dialect::Glsl, &obj, "zx") {
            Some(Value::Object(o)) => {
                assert_eq!(o.class, "vec2");
                assert_eq!(o.get("x"), Some(&Value::F32(3.0)));
                assert_eq!(o.get("y"), Some(&Value::F32(1.0)));
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Out-of-range component on a vec3
        assert_eq!(swizzle(Dialect::Glsl, &obj, "w"), None);
        // Not a swizzle
        assert_eq!(swizzle(Dialect::Glsl, &obj, "dir"), None);
    }

    #[test]
    fn test_construct_builtin_classes() {
        match construct_builtin(Dialect::Glsl, "vec4") {
            Some(Value::Object(o)) => {
                assert_eq!(o.len(), 4);
                assert_eq!(o.get("w"), Some(&Value::F32(0.0)));
            }
            other => panic!("unexpected: {other:?}"),
        }

        match construct_builtin(Dialect::Hlsl, "float4x4") {
            Some(Value::Object(o)) => {
                assert_eq!(o.len(), 4);
                match o.get("c0") {
                    Some(Value::Object(col)) => assert_eq!(col.class, "float4"),
                    other => panic!("unexpected: {other:?}"),
                }
            }
            other => panic!("unexpected: {other:?}"),
        }

        match construct_builtin(Dialect::Glsl, "ivec2") {
            Some(Value::Object(o)) => assert_eq!(o.get("x"), Some(&Value::I32(0))),
            other => panic!("unexpected: {other:?}"),
        }

        assert!(construct_builtin(Dialect::Glsl, "sampler2D").is_some());
        assert!(construct_builtin(Dialect::Glsl, "NotAType").is_none());
    }
}
