/// The tagged value type shared by variables, the evaluation stack and
/// native function calls.
use serde::{Deserialize, Serialize};
use std::fmt;

use super::instruction::Address;
use super::list::{ListTable, ListValue};

/// Discriminant of a `Value`, used in type errors and argument descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    None,
    Bool,
    UInt,
    Int,
    Float,
    String,
    List,
    DivertTarget,
    Pointer,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Bool => "bool",
            Self::UInt => "uint",
            Self::Int => "int",
            Self::Float => "float",
            Self::String => "string",
            Self::List => "list",
            Self::DivertTarget => "divert target",
            Self::Pointer => "variable pointer",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    UInt(u32),
    Int(i32),
    Float(f32),
    String(String),
    List(ListValue),
    /// Address of a container start, produced by `-> knot` used as a value.
    DivertTarget(Address),
    /// A by-reference parameter. `frame` is the call-stack depth holding the
    /// temporary, `None` for a global.
    Pointer { name: String, frame: Option<u32> },
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::None => ValueKind::None,
            Self::Bool(_) => ValueKind::Bool,
            Self::UInt(_) => ValueKind::UInt,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::String(_) => ValueKind::String,
            Self::List(_) => ValueKind::List,
            Self::DivertTarget(_) => ValueKind::DivertTarget,
            Self::Pointer { .. } => ValueKind::Pointer,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::UInt(v) => *v != 0,
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
            Self::String(s) => !s.is_empty(),
            Self::List(l) => !l.is_empty(),
            Self::DivertTarget(_) | Self::Pointer { .. } => true,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::UInt(_) | Self::Int(_) | Self::Float(_))
    }

    /// Integer view. Floats truncate toward zero and saturate at the `i32`
    /// range; NaN becomes 0.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Bool(b) => Some(*b as i32),
            Self::Int(v) => Some(*v),
            Self::UInt(v) => Some(i32::try_from(*v).unwrap_or(i32::MAX)),
            Self::Float(v) => Some(*v as i32),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Int(v) => Some(*v as f32),
            Self::UInt(v) => Some(*v as f32),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListValue> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Text form used when a value is written into the output stream.
    pub fn render(&self, lists: &ListTable) -> String {
        match self {
            Self::None => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::UInt(v) => v.to_string(),
            Self::Int(v) => v.to_string(),
            Self::Float(v) => format_float(*v),
            Self::String(s) => s.clone(),
            Self::List(l) => lists.render(l),
            Self::DivertTarget(addr) => format!("-> {}", addr.0),
            Self::Pointer { name, .. } => format!("ref {name}"),
        }
    }
}

/// Integral floats print without a fractional part.
pub fn format_float(v: f32) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e9 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Numeric kinds compare after promotion; any other pair of differing kinds
/// is unequal.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::UInt(a), Self::UInt(b)) => a == b,
            (Self::Int(a), Self::UInt(b)) | (Self::UInt(b), Self::Int(a)) => {
                i64::from(*a) == i64::from(*b)
            }
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::DivertTarget(a), Self::DivertTarget(b)) => a == b,
            (
                Self::Pointer { name: a, frame: fa },
                Self::Pointer { name: b, frame: fb },
            ) => a == b && fa == fb,
            (a, b) if a.is_numeric() && b.is_numeric() => a.as_float() == b.as_float(),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::UInt(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<ListValue> for Value {
    fn from(v: ListValue) -> Self {
        Self::List(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_equality_promotes() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::UInt(3), Value::Int(3));
        assert_ne!(Value::Int(-1), Value::UInt(u32::MAX));
        assert_ne!(Value::Int(1), Value::String("1".into()));
        assert_ne!(Value::None, Value::Bool(false));
    }

    #[test]
    fn float_truncation_is_defined() {
        assert_eq!(Value::Float(2.9).as_int(), Some(2));
        assert_eq!(Value::Float(-2.9).as_int(), Some(-2));
        assert_eq!(Value::Float(1e20).as_int(), Some(i32::MAX));
        assert_eq!(Value::Float(f32::NAN).as_int(), Some(0));
    }

    #[test]
    fn rendering() {
        let lists = ListTable::default();
        assert_eq!(Value::Float(2.0).render(&lists), "2");
        assert_eq!(Value::Float(2.5).render(&lists), "2.5");
        assert_eq!(Value::None.render(&lists), "");
        assert_eq!(Value::Bool(true).render(&lists), "true");
    }

    #[test]
    fn truthiness() {
        assert!(!Value::List(ListValue::new()).is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(Value::Float(0.5).is_truthy());
        assert!(!Value::None.is_truthy());
    }
}
