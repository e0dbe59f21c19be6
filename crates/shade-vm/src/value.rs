//! Tagged runtime values
//!
//! [`Value`] is the sum type every slot, operand and global holds. Scalars
//! copy by value; objects and arrays own their payload and deep-copy on
//! `clone`; references carry a slot coordinate and never copy their target.
//! Numeric operations follow C promotion rules, with elementwise extension to
//! vector-class objects (`vec4 * 0.5`, `vec3 + vec3`).

use crate::object::Object;
use crate::{VmError, VmResult};
use std::fmt;

/// Discriminant of a [`Value`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Absent value
    Null,
    /// Boolean
    Bool,
    /// 8-bit unsigned integer
    U8,
    /// 16-bit signed integer
    I16,
    /// 16-bit unsigned integer
    U16,
    /// 32-bit signed integer
    I32,
    /// 32-bit unsigned integer
    U32,
    /// 32-bit float
    F32,
    /// UTF-8 string
    Str,
    /// Class-named object
    Object,
    /// Value array
    Array,
    /// Slot reference
    Ref,
}

impl ValueKind {
    /// Decode a kind from its bytecode operand code (scalar kinds only)
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Null),
            1 => Some(Self::Bool),
            2 => Some(Self::U8),
            3 => Some(Self::I16),
            4 => Some(Self::U16),
            5 => Some(Self::I32),
            6 => Some(Self::U32),
            7 => Some(Self::F32),
            _ => None,
        }
    }

    /// Encode this kind as a bytecode operand code
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool => 1,
            Self::U8 => 2,
            Self::I16 => 3,
            Self::U16 => 4,
            Self::I32 => 5,
            Self::U32 => 6,
            Self::F32 => 7,
            Self::Str => 8,
            Self::Object => 9,
            Self::Array => 10,
            Self::Ref => 11,
        }
    }

    /// Whether this kind is a numeric scalar
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::U8 | Self::I16 | Self::U16 | Self::I32 | Self::U32 | Self::F32
        )
    }

    /// C integer promotion rank; higher ranks absorb lower ones
    fn rank(self) -> u8 {
        match self {
            Self::Bool => 0,
            Self::U8 => 1,
            Self::I16 => 2,
            Self::U16 => 3,
            Self::I32 => 4,
            Self::U32 => 5,
            Self::F32 => 6,
            _ => 7,
        }
    }

    /// Human-readable kind name
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::U8 => "u8",
            Self::I16 => "i16",
            Self::U16 => "u16",
            Self::I32 => "i32",
            Self::U32 => "u32",
            Self::F32 => "f32",
            Self::Str => "string",
            Self::Object => "object",
            Self::Array => "array",
            Self::Ref => "ref",
        }
    }
}

/// Coordinate of a storage slot; never deep-copied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRef {
    /// Local slot in a stepper frame
    Local {
        /// Frame index from the bottom of the frame stack
        frame: usize,
        /// Slot within the frame
        slot: usize,
    },
    /// Global slot
    Global {
        /// Slot within the program's global storage
        slot: usize,
    },
}

/// Tagged runtime value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// 8-bit unsigned integer
    U8(u8),
    /// 16-bit signed integer
    I16(i16),
    /// 16-bit unsigned integer
    U16(u16),
    /// 32-bit signed integer
    I32(i32),
    /// 32-bit unsigned integer
    U32(u32),
    /// 32-bit float
    F32(f32),
    /// UTF-8 string
    Str(String),
    /// Class-named object
    Object(Object),
    /// Value array
    Array(Vec<Value>),
    /// Slot reference
    Ref(SlotRef),
}

impl Value {
    /// Discriminant of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::U8(_) => ValueKind::U8,
            Self::I16(_) => ValueKind::I16,
            Self::U16(_) => ValueKind::U16,
            Self::I32(_) => ValueKind::I32,
            Self::U32(_) => ValueKind::U32,
            Self::F32(_) => ValueKind::F32,
            Self::Str(_) => ValueKind::Str,
            Self::Object(_) => ValueKind::Object,
            Self::Array(_) => ValueKind::Array,
            Self::Ref(_) => ValueKind::Ref,
        }
    }

    /// Human-readable type name (object values report their class)
    pub fn type_name(&self) -> &str {
        match self {
            Self::Object(o) => &o.class,
            other => other.kind().name(),
        }
    }

    /// Whether this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Extract a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract an i32
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract an f32
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::F32(f) => Some(*f),
            _ => None,
        }
    }

    /// Borrow the object payload
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Widen any numeric scalar (or bool) to f64 for arithmetic
    fn widen(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::U8(v) => Some(*v as f64),
            Self::I16(v) => Some(*v as f64),
            Self::U16(v) => Some(*v as f64),
            Self::I32(v) => Some(*v as f64),
            Self::U32(v) => Some(*v as f64),
            Self::F32(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Widen to i64 if this value is an integer scalar
    fn widen_int(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(*b as i64),
            Self::U8(v) => Some(*v as i64),
            Self::I16(v) => Some(*v as i64),
            Self::U16(v) => Some(*v as i64),
            Self::I32(v) => Some(*v as i64),
            Self::U32(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Truthiness for conditionals
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::F32(f) => *f != 0.0 && !f.is_nan(),
            Self::Str(s) => !s.is_empty(),
            Self::Object(_) | Self::Array(_) | Self::Ref(_) => true,
            other => other.widen_int().map(|i| i != 0).unwrap_or(false),
        }
    }

    /// Convert to another scalar kind per C conversion rules
    pub fn coerce(&self, kind: ValueKind) -> VmResult<Value> {
        if self.kind() == kind {
            return Ok(self.clone());
        }
        let n = self.widen().ok_or_else(|| {
            VmError::TypeMismatch(format!(
                "cannot convert {} to {}",
                self.type_name(),
                kind.name()
            ))
        })?;
        Ok(match kind {
            ValueKind::Bool => Value::Bool(n != 0.0),
            ValueKind::U8 => Value::U8(n as u8),
            ValueKind::I16 => Value::I16(n as i16),
            ValueKind::U16 => Value::U16(n as u16),
            ValueKind::I32 => Value::I32(n as i32),
            ValueKind::U32 => Value::U32(n as u32),
            ValueKind::F32 => Value::F32(n as f32),
            other => {
                return Err(VmError::TypeMismatch(format!(
                    "cannot convert {} to {}",
                    self.type_name(),
                    other.name()
                )))
            }
        })
    }

    /// Structural equality; numeric scalars compare after promotion
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.equals(y))
            }
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => match (self.widen(), other.widen()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::U8(v) => write!(f, "{}", v),
            Self::I16(v) => write!(f, "{}", v),
            Self::U16(v) => write!(f, "{}", v),
            Self::I32(v) => write!(f, "{}", v),
            Self::U32(v) => write!(f, "{}", v),
            Self::F32(v) => write!(f, "{}", v),
            Self::Str(s) => write!(f, "{}", s),
            Self::Object(o) => write!(f, "{}", o),
            Self::Array(a) => {
                write!(f, "[")?;
                for (i, v) in a.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Self::Ref(SlotRef::Local { frame, slot }) => write!(f, "&local[{}:{}]", frame, slot),
            Self::Ref(SlotRef::Global { slot }) => write!(f, "&global[{}]", slot),
        }
    }
}

/// Arithmetic operator selector for [`arith`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arith {
    /// a + b
    Add,
    /// a - b
    Sub,
    /// a * b
    Mul,
    /// a / b
    Div,
    /// a % b
    Mod,
}

/// Comparison operator selector for [`compare`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    /// a == b
    Eq,
    /// a != b
    Ne,
    /// a < b
    Lt,
    /// a <= b
    Le,
    /// a > b
    Gt,
    /// a >= b
    Ge,
}

/// Result kind of a binary numeric operation per C promotion
fn promote(a: ValueKind, b: ValueKind) -> ValueKind {
    let k = if a.rank() >= b.rank() { a } else { b };
    // Everything below int promotes to int
    if k.is_numeric() && k.rank() < ValueKind::I32.rank() || k == ValueKind::Bool {
        ValueKind::I32
    } else {
        k
    }
}

fn scalar_arith(op: Arith, a: &Value, b: &Value) -> VmResult<Value> {
    let kind = promote(a.kind(), b.kind());
    if kind == ValueKind::F32 {
        let (x, y) = (a.widen().unwrap() as f32, b.widen().unwrap() as f32);
        let r = match op {
            Arith::Add => x + y,
            Arith::Sub => x - y,
            Arith::Mul => x * y,
            Arith::Div => x / y,
            Arith::Mod => x % y,
        };
        return Ok(Value::F32(r));
    }

    let (x, y) = (a.widen_int().unwrap(), b.widen_int().unwrap());
    if y == 0 && matches!(op, Arith::Div | Arith::Mod) {
        return Err(VmError::DivisionByZero);
    }
    let r = match op {
        Arith::Add => x.wrapping_add(y),
        Arith::Sub => x.wrapping_sub(y),
        Arith::Mul => x.wrapping_mul(y),
        Arith::Div => x.wrapping_div(y),
        Arith::Mod => x.wrapping_rem(y),
    };
    Value::I32(r as i32).coerce(kind)
}

/// Map a binary operation elementwise over an object's numeric properties
fn elementwise<F>(base: &Object, rhs_at: F, op: Arith) -> VmResult<Value>
where
    F: Fn(usize) -> Value,
{
    let mut out = base.clone();
    for (i, (_, slot)) in out.props_mut().iter_mut().enumerate() {
        let lhs = &base.props()[i].1;
        let r = scalar_arith(op, lhs, &rhs_at(i))?;
        // Components keep their stored kind (vec components stay f32)
        *slot = r.coerce(slot.kind())?;
    }
    Ok(Value::Object(out))
}

/// Binary arithmetic with promotion and vector-object extension
pub fn arith(op: Arith, a: &Value, b: &Value) -> VmResult<Value> {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            if !x.is_numeric() || !y.is_numeric() || x.len() != y.len() {
                return Err(VmError::TypeMismatch(format!(
                    "cannot {:?} {} and {}",
                    op,
                    a.type_name(),
                    b.type_name()
                )));
            }
            elementwise(x, |i| y.props()[i].1.clone(), op)
        }
        (Value::Object(x), scalar) if scalar.kind().is_numeric() => {
            if !x.is_numeric() {
                return Err(VmError::TypeMismatch(format!(
                    "cannot {:?} {} and {}",
                    op,
                    a.type_name(),
                    b.type_name()
                )));
            }
            elementwise(x, |_| scalar.clone(), op)
        }
        (scalar, Value::Object(y)) if scalar.kind().is_numeric() => {
            if !y.is_numeric() {
                return Err(VmError::TypeMismatch(format!(
                    "cannot {:?} {} and {}",
                    op,
                    a.type_name(),
                    b.type_name()
                )));
            }
            let mut out = y.clone();
            for (i, (_, slot)) in out.props_mut().iter_mut().enumerate() {
                let r = scalar_arith(op, scalar, &y.props()[i].1)?;
                *slot = r.coerce(slot.kind())?;
            }
            Ok(Value::Object(out))
        }
        _ => {
            if a.widen().is_none() || b.widen().is_none() {
                return Err(VmError::TypeMismatch(format!(
                    "cannot {:?} {} and {}",
                    op,
                    a.type_name(),
                    b.type_name()
                )));
            }
            scalar_arith(op, a, b)
        }
    }
}

/// Binary comparison; numeric values compare after promotion
pub fn compare(op: Cmp, a: &Value, b: &Value) -> VmResult<Value> {
    match op {
        Cmp::Eq => return Ok(Value::Bool(a.equals(b))),
        Cmp::Ne => return Ok(Value::Bool(!a.equals(b))),
        _ => {}
    }

    let ord = match (a, b) {
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => {
            let (x, y) = match (a.widen(), b.widen()) {
                (Some(x), Some(y)) => (x, y),
                _ => {
                    return Err(VmError::TypeMismatch(format!(
                        "cannot order {} and {}",
                        a.type_name(),
                        b.type_name()
                    )))
                }
            };
            x.partial_cmp(&y).ok_or_else(|| {
                VmError::TypeMismatch("NaN is unordered".to_string())
            })?
        }
    };

    let r = match op {
        Cmp::Lt => ord.is_lt(),
        Cmp::Le => ord.is_le(),
        Cmp::Gt => ord.is_gt(),
        Cmp::Ge => ord.is_ge(),
        Cmp::Eq | Cmp::Ne => unreachable!(),
    };
    Ok(Value::Bool(r))
}

/// Unary negation with vector-object extension
pub fn negate(a: &Value) -> VmResult<Value> {
    match a {
        Value::Object(o) if o.is_numeric() => {
            let mut out = o.clone();
            for (_, slot) in out.props_mut().iter_mut() {
                let kind = slot.kind();
                *slot = scalar_arith(Arith::Sub, &Value::I32(0), slot)?.coerce(kind)?;
            }
            Ok(Value::Object(out))
        }
        Value::F32(f) => Ok(Value::F32(-f)),
        other => {
            let kind = promote(other.kind(), ValueKind::I32);
            match other.widen_int() {
                Some(i) => Value::I32(i.wrapping_neg() as i32).coerce(kind),
                None => Err(VmError::TypeMismatch(format!(
                    "cannot negate {}",
                    other.type_name()
                ))),
            }
        }
    }
}
