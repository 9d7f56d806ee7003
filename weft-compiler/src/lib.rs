//! weft-compiler
//!
//! Single-pass, line-oriented compiler from the weft command language to
//! `weft_core::Package` bytecode. Source text is consumed one logical line
//! at a time; `$`-prefixed lines dispatch to command handlers, everything
//! else coalesces into display content. Forward jumps for `if`/`while`
//! blocks are backpatched through a stack of per-block linkers.

mod compiler;
mod error;
mod expand;
mod linker;
mod scan;

pub use compiler::{compile_source, Compiler};
pub use error::{CompileError, CompileErrorKind, CompileWarning};
