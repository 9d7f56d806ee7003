use std::fmt;

use serde::{Deserialize, Serialize};

/// A 32-bit FNV-1a hash of an identifier string.
///
/// Node ids, line codes, variable names and method names are all carried
/// through the compiled format as `StrHash` values: cheap to copy, cheap to
/// compare, stable across compilations. Collisions are assumed not to occur
/// in practice and are not guarded against.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct StrHash(u32);

impl StrHash {
    /// The hash of the empty string; used as an "absent" sentinel.
    pub const NULL: StrHash = StrHash(0);

    pub fn new(s: &str) -> Self {
        if s.is_empty() {
            return StrHash::NULL;
        }
        let mut h: u32 = 0x811c_9dc5;
        for b in s.bytes() {
            h ^= u32::from(b);
            h = h.wrapping_mul(0x0100_0193);
        }
        StrHash(h)
    }

    pub const fn from_raw(v: u32) -> Self {
        StrHash(v)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StrHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:08x}", self.0)
    }
}

impl From<&str> for StrHash {
    fn from(s: &str) -> Self {
        StrHash::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_and_distinct() {
        assert_eq!(StrHash::new("intro.start"), StrHash::new("intro.start"));
        assert_ne!(StrHash::new("intro.start"), StrHash::new("intro.end"));
        assert!(StrHash::new("").is_null());
        assert!(!StrHash::new("x").is_null());
    }

    #[test]
    fn same_text_same_hash_regardless_of_identity() {
        let a = String::from("door");
        let b = format!("do{}", "or");
        assert_eq!(StrHash::new(&a), StrHash::new(&b));
    }
}
