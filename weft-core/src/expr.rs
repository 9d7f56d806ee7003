use serde::{Deserialize, Serialize};

use crate::hash::StrHash;
use crate::variant::Variant;

/// A two-part variable key: owning table plus variable name.
///
/// The null table denotes the executing thread's local table; anything else
/// is routed to the host's variable resolver.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarKey {
    pub table: StrHash,
    pub key: StrHash,
}

impl VarKey {
    pub fn local(key: StrHash) -> Self {
        VarKey {
            table: StrHash::NULL,
            key,
        }
    }

    pub fn is_local(&self) -> bool {
        self.table.is_null()
    }
}

/// One side of a comparison, or a standalone evaluable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Literal(Variant),
    Variable(VarKey),
    /// Host method call; `args` indexes the raw, unparsed argument text in
    /// the package string table.
    Method { id: StrHash, args: u32 },
}

/// Comparison operators usable in an expression record.
///
/// `True`/`False`/`Exists`/`NotExists` are unary (the right operand is
/// ignored and stored as a null literal).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExprOp {
    True,
    False,
    Exists,
    NotExists,
    Less,
    LessEq,
    Equal,
    NotEqual,
    GreaterEq,
    Greater,
}

impl ExprOp {
    pub fn is_unary(self) -> bool {
        matches!(
            self,
            ExprOp::True | ExprOp::False | ExprOp::Exists | ExprOp::NotExists
        )
    }
}

/// A compiled expression record, stored in the package expression table.
/// Comma-separated condition lists compile to contiguous runs referenced
/// by `(offset, count)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub op: ExprOp,
    pub lhs: Operand,
    pub rhs: Operand,
}

impl Expression {
    pub fn unary(op: ExprOp, lhs: Operand) -> Self {
        Expression {
            op,
            lhs,
            rhs: Operand::Literal(Variant::Null),
        }
    }

    pub fn binary(op: ExprOp, lhs: Operand, rhs: Operand) -> Self {
        Expression { op, lhs, rhs }
    }
}
