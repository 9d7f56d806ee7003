use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::StrHash;

/// The single scalar value type of the scripting language.
///
/// Strings never live inside a `Variant`; they are reduced to a `StrHash`
/// at compile time and compared by hash. Arithmetic and comparison are
/// deliberately forgiving: a type mismatch produces `Null` (or `false`)
/// rather than an error, so a bad script line degrades instead of taking
/// the whole thread down.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Variant {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    Float(f32),
    Hash(StrHash),
}

impl Variant {
    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Variant::Null => false,
            Variant::Bool(b) => *b,
            Variant::Int(v) => *v != 0,
            Variant::Float(v) => *v != 0.0,
            Variant::Hash(h) => !h.is_null(),
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Variant::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Variant::Float(v) => Some(*v),
            Variant::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_hash(&self) -> Option<StrHash> {
        match self {
            Variant::Hash(h) => Some(*h),
            _ => None,
        }
    }

    /// Loose equality: int/float pairs compare numerically, everything else
    /// compares tag and bits. `Null == Null` holds.
    pub fn loose_eq(&self, other: &Variant) -> bool {
        match (self, other) {
            (Variant::Null, Variant::Null) => true,
            (Variant::Bool(a), Variant::Bool(b)) => a == b,
            (Variant::Int(a), Variant::Int(b)) => a == b,
            (Variant::Float(a), Variant::Float(b)) => a == b,
            (Variant::Int(a), Variant::Float(b)) => (*a as f32) == *b,
            (Variant::Float(a), Variant::Int(b)) => *a == (*b as f32),
            (Variant::Hash(a), Variant::Hash(b)) => a == b,
            _ => false,
        }
    }

    /// Numeric ordering; `None` for non-numeric pairings.
    pub fn compare(&self, other: &Variant) -> Option<Ordering> {
        match (self, other) {
            (Variant::Int(a), Variant::Int(b)) => Some(a.cmp(b)),
            (Variant::Float(a), Variant::Float(b)) => a.partial_cmp(b),
            (Variant::Int(a), Variant::Float(b)) => (*a as f32).partial_cmp(b),
            (Variant::Float(a), Variant::Int(b)) => a.partial_cmp(&(*b as f32)),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Null => "null",
            Variant::Bool(_) => "bool",
            Variant::Int(_) => "int",
            Variant::Float(_) => "float",
            Variant::Hash(_) => "hash",
        }
    }
}

/// int∘int stays int (wrapping), any float operand promotes to float,
/// everything else is `Null`.
pub fn add(a: Variant, b: Variant) -> Variant {
    match (a, b) {
        (Variant::Int(x), Variant::Int(y)) => Variant::Int(x.wrapping_add(y)),
        (Variant::Int(x), Variant::Float(y)) => Variant::Float(x as f32 + y),
        (Variant::Float(x), Variant::Int(y)) => Variant::Float(x + y as f32),
        (Variant::Float(x), Variant::Float(y)) => Variant::Float(x + y),
        _ => Variant::Null,
    }
}

pub fn sub(a: Variant, b: Variant) -> Variant {
    match (a, b) {
        (Variant::Int(x), Variant::Int(y)) => Variant::Int(x.wrapping_sub(y)),
        (Variant::Int(x), Variant::Float(y)) => Variant::Float(x as f32 - y),
        (Variant::Float(x), Variant::Int(y)) => Variant::Float(x - y as f32),
        (Variant::Float(x), Variant::Float(y)) => Variant::Float(x - y),
        _ => Variant::Null,
    }
}

pub fn mul(a: Variant, b: Variant) -> Variant {
    match (a, b) {
        (Variant::Int(x), Variant::Int(y)) => Variant::Int(x.wrapping_mul(y)),
        (Variant::Int(x), Variant::Float(y)) => Variant::Float(x as f32 * y),
        (Variant::Float(x), Variant::Int(y)) => Variant::Float(x * y as f32),
        (Variant::Float(x), Variant::Float(y)) => Variant::Float(x * y),
        _ => Variant::Null,
    }
}

/// Division by an integer zero yields 0, by a float zero yields 0.0.
pub fn div(a: Variant, b: Variant) -> Variant {
    match (a, b) {
        (Variant::Int(x), Variant::Int(y)) => Variant::Int(if y == 0 { 0 } else { x / y }),
        (Variant::Int(x), Variant::Float(y)) => {
            Variant::Float(if y == 0.0 { 0.0 } else { x as f32 / y })
        }
        (Variant::Float(x), Variant::Int(y)) => {
            Variant::Float(if y == 0 { 0.0 } else { x / y as f32 })
        }
        (Variant::Float(x), Variant::Float(y)) => {
            Variant::Float(if y == 0.0 { 0.0 } else { x / y })
        }
        _ => Variant::Null,
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Null => write!(f, "null"),
            Variant::Bool(b) => write!(f, "{b}"),
            Variant::Int(v) => write!(f, "{v}"),
            Variant::Float(v) => write!(f, "{v}"),
            Variant::Hash(h) => write!(f, "{h}"),
        }
    }
}
