use std::sync::Arc;

use weft_core::{variant, ChoiceBuffer, Node, Package, StrHash, VarKey, Variant};

use crate::arena::ThreadHandle;

/// Whether a host operation completed synchronously or left the thread
/// waiting on an external operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HostFlow {
    Ready,
    Pending,
}

/// Outcome of a statement-form host method invocation.
#[derive(Debug, Clone)]
pub enum InvokeFlow {
    Ready(Variant),
    /// The thread suspends; the host finishes the external operation
    /// before ticking the thread again.
    Pending,
}

/// The core's boundary to everything it deliberately does not implement:
/// presentation, host method dispatch, foreign-node/line/object resolution
/// and the shared variable backend.
///
/// Every method has a degrading default so test hosts only override what
/// they observe. The default `show_options` picks the first available
/// option synchronously.
pub trait EnginePlugin {
    /// Display one line of resolved text. `Pending` suspends the thread.
    fn run_line(&mut self, _thread: ThreadHandle, _code: StrHash, _text: &str) -> HostFlow {
        HostFlow::Ready
    }

    /// Present the offered options and resolve `choices` via
    /// [`ChoiceBuffer::choose`], synchronously (`Ready`) or later
    /// (`Pending`).
    fn show_options(&mut self, _thread: ThreadHandle, choices: &mut ChoiceBuffer) -> HostFlow {
        let first = choices.available().next().map(|o| o.target);
        if let Some(target) = first {
            if let Err(e) = choices.choose(target, None) {
                log::error!("default choice resolution failed: {e}");
            }
        }
        HostFlow::Ready
    }

    /// Call a named host method with raw, unparsed argument text. The
    /// statement form; any result is discarded.
    fn invoke(
        &mut self,
        _thread: ThreadHandle,
        method: StrHash,
        _args: &str,
        _target: Option<Variant>,
    ) -> InvokeFlow {
        log::error!("no host implementation for method {method}");
        InvokeFlow::Ready(Variant::Null)
    }

    /// Synchronous invocation used inside expressions; must produce a
    /// value immediately.
    fn invoke_with_return(
        &mut self,
        _thread: ThreadHandle,
        method: StrHash,
        _args: &str,
        _target: Option<Variant>,
    ) -> Variant {
        log::error!("no host implementation for method {method}");
        Variant::Null
    }

    /// Resolve a node id outside the asking package; `None` falls back to
    /// the package's own node directory.
    fn try_lookup_node(&mut self, _id: StrHash, _from: &Package) -> Option<(Arc<Package>, Node)> {
        None
    }

    /// Resolve a line code outside the asking package; `None` falls back
    /// to the package's own line table.
    fn try_lookup_line(&mut self, _code: StrHash, _from: &Package) -> Option<String> {
        None
    }

    /// Resolve a named object (used for `$call target->...` receivers).
    fn try_lookup_object(&mut self, _id: StrHash, _thread: ThreadHandle) -> Option<Variant> {
        None
    }

    // -------------------------
    // Shared variable backend (thread-locals never reach these)
    // -------------------------

    fn get_var(&mut self, key: VarKey, _thread: ThreadHandle) -> Variant {
        log::warn!("unresolved variable read {}:{}", key.table, key.key);
        Variant::Null
    }

    fn set_var(&mut self, key: VarKey, _value: Variant, _thread: ThreadHandle) {
        log::warn!("unresolved variable write {}:{}", key.table, key.key);
    }

    fn increment_var(&mut self, key: VarKey, delta: Variant, thread: ThreadHandle) {
        let current = self.get_var(key, thread);
        self.set_var(key, variant::add(current, delta), thread);
    }

    // -------------------------
    // Lifecycle notifications
    // -------------------------

    fn on_node_enter(&mut self, _node: StrHash, _thread: ThreadHandle) {}

    fn on_node_exit(&mut self, _node: StrHash, _thread: ThreadHandle) {}

    /// The thread's frame stack emptied (normal completion).
    fn on_end(&mut self, _thread: ThreadHandle) {}
}
