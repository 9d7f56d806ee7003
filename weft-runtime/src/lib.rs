//! weft-runtime
//!
//! The opcode interpreter and thread model for compiled weft packages.
//!
//! Execution is cooperative and resumable: a thread advances only when its
//! `tick` is called, runs synchronously until it hits a suspension point
//! (line display, choice presentation, pending host invocation, `yield`,
//! or a fork join), and reports what it is waiting on. The host drives all
//! live threads through a [`Director`], one tick per thread per frame.
//!
//! Everything the language cannot do alone (rendering lines, presenting
//! menus, calling named host methods, resolving foreign nodes and shared
//! variables) crosses the [`EnginePlugin`] boundary.

pub mod arena;
pub mod director;
pub mod executor;
pub mod plugin;
pub mod thread;

pub use arena::{ThreadArena, ThreadHandle};
pub use director::Director;
pub use executor::{Tick, Wait};
pub use plugin::{EnginePlugin, HostFlow, InvokeFlow};
pub use thread::{Frame, ThreadState, VmError};
