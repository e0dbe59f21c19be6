//! Symbol tables collected during parsing
//!
//! After a successful parse the front-end holds the global list, structure
//! layouts, function signatures and, per function, the ordered local list
//! with declared types. Local slot indices equal the position in the ordered
//! list (parameters first), which is what the debugger uses to read paused
//! frames.

use rustc_hash::FxHashMap;

/// Storage class of a compile-time variable binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageQualifier {
    /// Plain file-scope variable
    Global,
    /// `uniform`
    Uniform,
    /// `in` / `attribute` / `varying` input
    In,
    /// `out` output
    Out,
    /// `const`
    Const,
}

/// A compile-time variable binding
#[derive(Debug, Clone)]
pub struct Variable {
    /// Variable name
    pub name: String,
    /// Declared type name, in source-language spelling
    pub ty: String,
    /// Storage class
    pub qualifier: StorageQualifier,
    /// HLSL semantic annotation (`: SV_Target`), if any
    pub semantic: Option<String>,
    /// Declared array size, if the variable is an array
    pub array_size: Option<u16>,
}

impl Variable {
    /// Shorthand for a plain global binding
    pub fn global(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            qualifier: StorageQualifier::Global,
            semantic: None,
            array_size: None,
        }
    }
}

/// A user-defined structure
#[derive(Debug, Clone)]
pub struct Structure {
    /// Structure name
    pub name: String,
    /// Ordered `(name, type)` fields
    pub fields: Vec<(String, String)>,
}

/// A function signature
#[derive(Debug, Clone)]
pub struct FunctionSig {
    /// Function name
    pub name: String,
    /// Return type name
    pub ret: String,
    /// Parameters, in declaration order
    pub params: Vec<Variable>,
    /// 1-based line of the definition
    pub line: u32,
}

/// One named local slot of a function
#[derive(Debug, Clone)]
pub struct LocalVar {
    /// Local name
    pub name: String,
    /// Declared type name
    pub ty: String,
    /// Slot index in the frame
    pub slot: u16,
}

/// Symbol tables for one translation unit
#[derive(Debug, Clone, Default)]
pub struct Symbols {
    /// Global variables, in declaration order (built-ins first)
    pub globals: Vec<Variable>,
    /// User structures
    pub structures: Vec<Structure>,
    /// Function signatures
    pub functions: Vec<FunctionSig>,
    locals: FxHashMap<String, Vec<LocalVar>>,
}

impl Symbols {
    /// Create empty tables
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a global by name
    pub fn global(&self, name: &str) -> Option<&Variable> {
        self.globals.iter().find(|v| v.name == name)
    }

    /// Look up a structure by name
    pub fn structure(&self, name: &str) -> Option<&Structure> {
        self.structures.iter().find(|s| s.name == name)
    }

    /// Look up a function signature by name
    pub fn function(&self, name: &str) -> Option<&FunctionSig> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Register a global; redefinition is ignored (first one wins)
    pub fn add_global(&mut self, var: Variable) {
        if self.global(&var.name).is_none() {
            self.globals.push(var);
        }
    }

    /// Register a structure
    pub fn add_structure(&mut self, s: Structure) {
        self.structures.push(s);
    }

    /// Register a function signature
    pub fn add_function(&mut self, f: FunctionSig) {
        self.functions.push(f);
    }

    /// Record a named local slot of `func`
    pub fn add_local(&mut self, func: &str, local: LocalVar) {
        self.locals.entry(func.to_string()).or_default().push(local);
    }

    /// Ordered locals of a function (parameters first)
    pub fn locals(&self, func: &str) -> &[LocalVar] {
        self.locals.get(func).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Declared type of a local; the innermost (most recent) declaration of
    /// a shadowed name wins.
    pub fn local_type(&self, func: &str, name: &str) -> Option<&str> {
        self.locals(func)
            .iter()
            .rev()
            .find(|l| l.name == name)
            .map(|l| l.ty.as_str())
    }

    /// Slot of a named local; innermost declaration wins
    pub fn local_slot(&self, func: &str, name: &str) -> Option<u16> {
        self.locals(func)
            .iter()
            .rev()
            .find(|l| l.name == name)
            .map(|l| l.slot)
    }

    /// Drop all tables
    pub fn clear(&mut self) {
        self.globals.clear();
        self.structures.clear();
        self.functions.clear();
        self.locals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_lookup_first_wins() {
        let mut syms = Symbols::new();
        syms.add_global(Variable::global("uTime", "float"));
        syms.add_global(Variable::global("uTime", "int"));
        assert_eq!(syms.globals.len(), 1);
        assert_eq!(syms.global("uTime").unwrap().ty, "float");
    }

    #[test]
    fn test_local_shadowing_innermost_wins() {
        let mut syms = Symbols::new();
        syms.add_local(
            "main",
            LocalVar {
                name: "i".into(),
                ty: "int".into(),
                slot: 0,
            },
        );
        syms.add_local(
            "main",
            LocalVar {
                name: "i".into(),
                ty: "float".into(),
                slot: 1,
            },
        );

        assert_eq!(syms.local_type("main", "i"), Some("float"));
        assert_eq!(syms.local_slot("main", "i"), Some(1));
        assert_eq!(syms.locals("main").len(), 2);
        assert!(syms.locals("other").is_empty());
    }
}
