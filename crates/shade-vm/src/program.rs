//! Instantiated bytecode programs
//!
//! A [`Program`] is an [`Image`] made runnable: name lookup maps for
//! functions and structures, global slot storage, linked host functions, the
//! two extension callbacks, and the mutable run state (`current_line`, the
//! abort flag, the opaque user-data handle host callbacks use to reach their
//! owner). Programs are single-threaded; run state lives behind
//! `Cell`/`RefCell` so the stepper and host callbacks can share one
//! `Rc<Program>`.

use crate::library::{HostFn, Library};
use crate::object::Object;
use crate::value::Value;
use rustc_hash::FxHashMap;
use shade_bytecode::{FunctionDef, Image, ImageError, StructureDef};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use thiserror::Error;

/// Property-read fallback: consulted when an object has no static slot with
/// the requested name. `None` means "not handled".
pub type PropertyGetter = Rc<dyn Fn(&Program, &Object, &str) -> Option<Value>>;

/// Object construction fallback for class names without a structure layout.
/// `None` means "not handled".
pub type DefaultConstructor = Rc<dyn Fn(&Program, &str) -> Option<Value>>;

/// Link-time errors
#[derive(Debug, Error)]
pub enum LinkError {
    /// A host function name collides with an existing callable
    #[error("Duplicate function name at link time: {0}")]
    DuplicateFunction(String),
}

/// An instantiated bytecode image
pub struct Program {
    base: Rc<Image>,
    function_ids: FxHashMap<String, usize>,
    structure_ids: FxHashMap<String, usize>,
    host_fns: RefCell<FxHashMap<String, HostFn>>,
    globals: RefCell<Vec<Value>>,
    global_ids: RefCell<FxHashMap<String, usize>>,
    overlay: RefCell<Option<Rc<Image>>>,
    property_getter: RefCell<Option<PropertyGetter>>,
    default_constructor: RefCell<Option<DefaultConstructor>>,
    current_line: Cell<i32>,
    abort: Cell<bool>,
    user_data: RefCell<Option<Rc<dyn Any>>>,
}

impl Program {
    /// Instantiate an image: validate the header and build the lookup maps.
    pub fn instantiate(image: Image) -> Result<Rc<Self>, ImageError> {
        image.validate()?;

        let mut function_ids = FxHashMap::default();
        for (i, f) in image.functions.iter().enumerate() {
            function_ids.insert(f.name.clone(), i);
        }
        let mut structure_ids = FxHashMap::default();
        for (i, s) in image.structures.iter().enumerate() {
            structure_ids.insert(s.name.clone(), i);
        }

        log::debug!(
            "instantiated program: {} functions, {} structures, {} strings",
            image.functions.len(),
            image.structures.len(),
            image.strings.len()
        );

        Ok(Rc::new(Self {
            base: Rc::new(image),
            function_ids,
            structure_ids,
            host_fns: RefCell::new(FxHashMap::default()),
            globals: RefCell::new(Vec::new()),
            global_ids: RefCell::new(FxHashMap::default()),
            overlay: RefCell::new(None),
            property_getter: RefCell::new(None),
            default_constructor: RefCell::new(None),
            current_line: Cell::new(0),
            abort: Cell::new(false),
            user_data: RefCell::new(None),
        }))
    }

    /// The instantiated base image
    pub fn image(&self) -> &Rc<Image> {
        &self.base
    }

    /// String table of the base image (identical to the generator's)
    pub fn strings(&self) -> &[String] {
        &self.base.strings
    }

    // ===== Function & structure lookup =====

    /// Resolve a bytecode function by name. The spliced overlay, when
    /// present, shadows the base image.
    pub fn resolve_function(&self, name: &str) -> Option<(Rc<Image>, usize)> {
        if let Some(overlay) = self.overlay.borrow().as_ref() {
            if let Some((idx, _)) = overlay.function(name) {
                return Some((overlay.clone(), idx));
            }
        }
        self.function_ids
            .get(name)
            .map(|&idx| (self.base.clone(), idx))
    }

    /// Function directory entry in the base image
    pub fn function_def(&self, name: &str) -> Option<&FunctionDef> {
        self.function_ids
            .get(name)
            .map(|&idx| &self.base.functions[idx])
    }

    /// Structure layout by name (base image)
    pub fn structure(&self, name: &str) -> Option<&StructureDef> {
        self.structure_ids
            .get(name)
            .map(|&idx| &self.base.structures[idx])
    }

    // ===== Host function linkage =====

    /// Register a single host callback.
    ///
    /// Rejects names that collide with a bytecode function or an
    /// already-linked host function.
    pub fn add_function(&self, name: &str, f: HostFn) -> Result<(), LinkError> {
        if self.function_ids.contains_key(name) || self.host_fns.borrow().contains_key(name) {
            return Err(LinkError::DuplicateFunction(name.to_string()));
        }
        self.host_fns.borrow_mut().insert(name.to_string(), f);
        Ok(())
    }

    /// Merge a library's callbacks into the callable namespace.
    pub fn add_library(&self, library: &Library) -> Result<(), LinkError> {
        // Validate the whole bundle before mutating, so a failed link leaves
        // the namespace untouched.
        for (name, _) in library.iter() {
            if self.function_ids.contains_key(name) || self.host_fns.borrow().contains_key(name) {
                return Err(LinkError::DuplicateFunction(name.to_string()));
            }
        }
        let mut host_fns = self.host_fns.borrow_mut();
        for (name, f) in library.iter() {
            host_fns.insert(name.to_string(), f.clone());
        }
        log::debug!("linked library '{}' ({} functions)", library.name(), library.len());
        Ok(())
    }

    /// Look up a linked host callback
    pub fn host_fn(&self, name: &str) -> Option<HostFn> {
        self.host_fns.borrow().get(name).cloned()
    }

    // ===== Globals =====

    /// Reserve a global slot, returning its index; idempotent per name.
    pub fn add_global(&self, name: &str) -> usize {
        if let Some(&slot) = self.global_ids.borrow().get(name) {
            return slot;
        }
        let mut globals = self.globals.borrow_mut();
        let slot = globals.len();
        globals.push(Value::Null);
        self.global_ids.borrow_mut().insert(name.to_string(), slot);
        slot
    }

    /// Slot index of a global, if reserved
    pub fn global_slot(&self, name: &str) -> Option<usize> {
        self.global_ids.borrow().get(name).copied()
    }

    /// Read a global by name (deep copy)
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let slot = self.global_slot(name)?;
        Some(self.globals.borrow()[slot].clone())
    }

    /// Read a global by slot (deep copy)
    pub fn get_global_at(&self, slot: usize) -> Option<Value> {
        self.globals.borrow().get(slot).cloned()
    }

    /// Write a global by name, reserving the slot on first write
    pub fn set_global(&self, name: &str, value: Value) {
        let slot = self.add_global(name);
        self.globals.borrow_mut()[slot] = value;
    }

    /// Remove a global slot binding and return its last value.
    ///
    /// Slot storage is retained (slots are append-only) so other names keep
    /// their indices; only the name binding disappears.
    pub fn remove_global(&self, name: &str) -> Option<Value> {
        let slot = self.global_ids.borrow_mut().remove(name)?;
        let mut globals = self.globals.borrow_mut();
        Some(std::mem::take(&mut globals[slot]))
    }

    /// Names of all reserved globals
    pub fn global_names(&self) -> Vec<String> {
        self.global_ids.borrow().keys().cloned().collect()
    }

    // ===== Extension callbacks =====

    /// Install the property-getter extension
    pub fn set_property_getter(&self, getter: Option<PropertyGetter>) {
        *self.property_getter.borrow_mut() = getter;
    }

    /// The installed property-getter extension
    pub fn property_getter(&self) -> Option<PropertyGetter> {
        self.property_getter.borrow().clone()
    }

    /// Install the default-constructor extension
    pub fn set_default_constructor(&self, ctor: Option<DefaultConstructor>) {
        *self.default_constructor.borrow_mut() = ctor;
    }

    /// The installed default-constructor extension
    pub fn default_constructor(&self) -> Option<DefaultConstructor> {
        self.default_constructor.borrow().clone()
    }

    // ===== Run state =====

    /// Source line of the most recently dispatched line marker
    pub fn current_line(&self) -> i32 {
        self.current_line.get()
    }

    /// Update the current source line
    pub fn set_current_line(&self, line: i32) {
        self.current_line.set(line);
    }

    /// Request abort: every subsequent dispatch is a no-op
    pub fn abort(&self) {
        log::debug!("program abort requested at line {}", self.current_line.get());
        self.abort.set(true);
    }

    /// Whether the program is aborted
    pub fn is_aborted(&self) -> bool {
        self.abort.get()
    }

    /// Clear the abort flag (used when a fresh run is started)
    pub fn clear_abort(&self) {
        self.abort.set(false);
    }

    /// Install the opaque user-data handle
    pub fn set_user_data(&self, data: Option<Rc<dyn Any>>) {
        *self.user_data.borrow_mut() = data;
    }

    /// The opaque user-data handle
    pub fn user_data(&self) -> Option<Rc<dyn Any>> {
        self.user_data.borrow().clone()
    }

    // ===== Immediate-mode splice =====

    /// Install an overlay image whose functions shadow the base image.
    /// At most one overlay is active at a time.
    pub fn splice(&self, image: Image) {
        *self.overlay.borrow_mut() = Some(Rc::new(image));
    }

    /// Roll back the spliced overlay
    pub fn unsplice(&self) {
        *self.overlay.borrow_mut() = None;
    }

    /// Whether an overlay is spliced in
    pub fn has_overlay(&self) -> bool {
        self.overlay.borrow().is_some()
    }
}
