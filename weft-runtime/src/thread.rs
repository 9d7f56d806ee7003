use std::collections::HashMap;
use std::sync::Arc;

use smallvec::SmallVec;
use thiserror::Error;

use weft_core::{ChoiceBuffer, ChoiceError, Node, Package, StrHash, Variant};

use crate::arena::ThreadHandle;

/// Operand-stack depth limit per thread.
pub(crate) const MAX_STACK: usize = 256;

/// Hard VM invariant violations. These indicate corrupt bytecode or a host
/// bug and abort the offending thread; authoring mistakes never raise them.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("stack underflow")]
    StackUnderflow,
    #[error("stack overflow (limit={limit})")]
    StackOverflow { limit: usize },
    #[error("choice buffer misuse: {0}")]
    Choice(#[from] ChoiceError),
}

/// One call level: a node plus the program counter within it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub package: Arc<Package>,
    pub node: Node,
    /// Relative to the node's instruction slice.
    pub pc: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub(crate) enum ExecState {
    #[default]
    Default,
    /// Suspended on a presented choice menu; the resolved target is pushed
    /// on resume.
    AwaitingChoice,
    /// Suspended until all tracked children finish; re-checked per tick.
    AwaitingJoin,
    /// Frame stack exhausted or killed; terminal.
    Done,
}

/// Per-execution mutable state: the frame stack (innermost last), operand
/// stack, thread-local variables, choice buffer and tracked children.
///
/// States are pooled by the arena: `setup` re-initializes one for a fresh
/// logical run, `reset` tears it down for reuse.
#[derive(Debug, Default)]
pub struct ThreadState {
    pub(crate) handle: ThreadHandle,
    pub(crate) frames: SmallVec<[Frame; 4]>,
    pub(crate) stack: Vec<Variant>,
    pub(crate) locals: HashMap<StrHash, Variant>,
    pub(crate) choices: ChoiceBuffer,
    pub(crate) children: Vec<ThreadHandle>,
    pub(crate) state: ExecState,
    pub(crate) actor: Option<StrHash>,
}

impl ThreadState {
    /// Re-initialize for a fresh logical execution starting at `node`.
    pub(crate) fn setup(&mut self, handle: ThreadHandle, package: Arc<Package>, node: Node) {
        self.reset();
        self.handle = handle;
        self.state = ExecState::Default;
        self.frames.push(Frame {
            package,
            node,
            pc: 0,
        });
    }

    /// Tear down after a run (or a kill): everything cleared, terminal.
    pub(crate) fn reset(&mut self) {
        self.frames.clear();
        self.stack.clear();
        self.locals.clear();
        self.choices.reset();
        self.children.clear();
        self.state = ExecState::Done;
        self.actor = None;
    }

    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    pub fn is_done(&self) -> bool {
        self.state == ExecState::Done
    }

    pub fn actor(&self) -> Option<StrHash> {
        self.actor
    }

    pub fn set_actor(&mut self, actor: Option<StrHash>) {
        self.actor = actor;
    }

    pub fn choices(&self) -> &ChoiceBuffer {
        &self.choices
    }

    /// The host resolves a pending choice menu through this.
    pub fn choices_mut(&mut self) -> &mut ChoiceBuffer {
        &mut self.choices
    }

    pub fn frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn take_children(&mut self) -> Vec<ThreadHandle> {
        std::mem::take(&mut self.children)
    }

    pub(crate) fn push(&mut self, v: Variant) -> Result<(), VmError> {
        if self.stack.len() >= MAX_STACK {
            return Err(VmError::StackOverflow { limit: MAX_STACK });
        }
        self.stack.push(v);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<Variant, VmError> {
        self.stack.pop().ok_or(VmError::StackUnderflow)
    }
}
