//! Host function libraries
//!
//! A [`Library`] is a named bundle of host callbacks under the uniform
//! calling convention `fn(&Program, &mut Vec<Value>) -> Value`. Arguments
//! arrive in declaration order; the return value is pushed onto the caller's
//! scratch stack by the stepper. Libraries are linked into a program once;
//! name conflicts are fatal at link time.

use crate::program::Program;
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// A host callback invocable from bytecode
pub type HostFn = Rc<dyn Fn(&Program, &mut Vec<Value>) -> Value>;

/// Named bundle of host callbacks
pub struct Library {
    name: String,
    functions: FxHashMap<String, HostFn>,
}

impl Library {
    /// Create an empty library
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: FxHashMap::default(),
        }
    }

    /// Library name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a callback; replaces any previous binding of the same name
    pub fn add(&mut self, name: impl Into<String>, f: impl Fn(&Program, &mut Vec<Value>) -> Value + 'static) {
        self.functions.insert(name.into(), Rc::new(f));
    }

    /// Look up a callback by name
    pub fn get(&self, name: &str) -> Option<HostFn> {
        self.functions.get(name).cloned()
    }

    /// Iterate over all callbacks
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HostFn)> {
        self.functions.iter().map(|(n, f)| (n.as_str(), f))
    }

    /// Number of callbacks
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the library is empty
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let mut lib = Library::new("math");
        lib.add("fortytwo", |_, _| Value::I32(42));
        assert_eq!(lib.name(), "math");
        assert_eq!(lib.len(), 1);
        assert!(lib.get("fortytwo").is_some());
        assert!(lib.get("missing").is_none());
    }

    #[test]
    fn test_redefinition_replaces() {
        let mut lib = Library::new("l");
        lib.add("f", |_, _| Value::I32(1));
        lib.add("f", |_, _| Value::I32(2));
        assert_eq!(lib.len(), 1);
    }
}
