//! Structured runtime objects
//!
//! An [`Object`] is a class-named value with an *ordered* property list.
//! Shader vector types (`vec4`, `float3`, ...), matrices and user structures
//! are all objects; property order is the component/field declaration order,
//! which constructor filling and elementwise arithmetic rely on.

use crate::value::Value;
use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// A class-named object value with ordered properties
pub struct Object {
    /// Class name, in source-language spelling (`vec4` vs `float4`)
    pub class: String,
    props: Vec<(String, Value)>,
    /// Opaque host payload (borrowed collaborators such as textures)
    pub user: Option<Rc<dyn Any>>,
}

impl Object {
    /// Create an object with no properties
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            props: Vec::new(),
            user: None,
        }
    }

    /// Create an object from an ordered property list
    pub fn with_props(class: impl Into<String>, props: Vec<(String, Value)>) -> Self {
        Self {
            class: class.into(),
            props,
            user: None,
        }
    }

    /// Read a property
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.props
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Mutable access to a property
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.props
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Write a property; appends if the slot does not exist yet
    pub fn set(&mut self, name: &str, value: Value) {
        match self.get_mut(name) {
            Some(slot) => *slot = value,
            None => self.props.push((name.to_string(), value)),
        }
    }

    /// Whether a property slot exists
    pub fn has(&self, name: &str) -> bool {
        self.props.iter().any(|(n, _)| n == name)
    }

    /// Ordered property list
    pub fn props(&self) -> &[(String, Value)] {
        &self.props
    }

    /// Mutable ordered property list
    pub fn props_mut(&mut self) -> &mut Vec<(String, Value)> {
        &mut self.props
    }

    /// Number of properties
    pub fn len(&self) -> usize {
        self.props.len()
    }

    /// Whether the object has no properties
    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Whether every property holds a numeric scalar
    pub fn is_numeric(&self) -> bool {
        !self.props.is_empty() && self.props.iter().all(|(_, v)| v.kind().is_numeric())
    }
}

impl Clone for Object {
    fn clone(&self) -> Self {
        // Properties are deep-copied; the host payload is a borrowed handle
        // and stays shared.
        Self {
            class: self.class.clone(),
            props: self.props.clone(),
            user: self.user.clone(),
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        if self.class != other.class || self.props != other.props {
            return false;
        }
        match (&self.user, &other.user) {
            (None, None) => true,
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(&self.class);
        for (name, value) in &self.props {
            s.field(name, value);
        }
        s.finish()
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.class)?;
        for (i, (_, value)) in self.props.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, ")")
    }
}
