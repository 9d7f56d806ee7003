//! weft-core
//!
//! The static data model shared by the weft compiler and virtual machine:
//! the `Variant` value type, 32-bit identifier hashing, the opcode set and
//! its byte-level encoding, compiled packages (nodes, string/expression/line
//! tables), and the choice-accumulation buffer.
//!
//! Nothing in this crate executes scripts or touches the filesystem beyond
//! package save/load; the compiler lives in `weft-compiler` and the VM in
//! `weft-runtime`.

pub mod choice;
pub mod encode;
pub mod expr;
pub mod hash;
pub mod opcode;
pub mod package;
pub mod variant;

pub use choice::{ChoiceBuffer, ChoiceError, ChoiceOption, ChoiceState, OptionFlags};
pub use encode::{CodeReader, CodeWriter};
pub use expr::{ExprOp, Expression, Operand, VarKey};
pub use hash::StrHash;
pub use opcode::Opcode;
pub use package::{LineRecord, Node, Package, PackageBuilder};
pub use variant::Variant;
