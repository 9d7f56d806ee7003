use std::sync::Arc;

use anyhow::{anyhow, Result};

use weft_core::{Package, StrHash};

use crate::arena::{ThreadArena, ThreadHandle};
use crate::executor::Tick;
use crate::plugin::EnginePlugin;
use crate::thread::ThreadState;

/// Reference cooperative scheduler: advances every live thread by one tick
/// per frame, in slot order.
///
/// The frame batch is snapshotted up front, so a thread forked during a
/// frame first runs on the next one; forks never execute inside their
/// parent's step. There is no preemption and no timeout; a script loop
/// that never yields starves the frame, which is an accepted authoring
/// hazard.
#[derive(Debug, Default)]
pub struct Director {
    arena: ThreadArena,
}

impl Director {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new thread at `node_id` of `package`.
    pub fn spawn(&mut self, package: Arc<Package>, node_id: StrHash) -> Result<ThreadHandle> {
        let node = *package.node(node_id).ok_or_else(|| {
            anyhow!("node {} not found in package '{}'", node_id, package.name())
        })?;
        Ok(self.arena.spawn(package, node))
    }

    /// Kill a thread and all its tracked children.
    pub fn kill(&mut self, handle: ThreadHandle) {
        self.arena.kill(handle);
    }

    pub fn is_running(&self, handle: ThreadHandle) -> bool {
        self.arena.is_running(handle)
    }

    pub fn has_running(&self) -> bool {
        self.arena.has_running()
    }

    /// Borrow a suspended thread, e.g. to resolve its choice buffer or
    /// complete a pending invocation.
    pub fn thread_mut(&mut self, handle: ThreadHandle) -> Option<&mut ThreadState> {
        self.arena.thread_mut(handle)
    }

    /// Advance every thread that was live at frame start by one tick.
    /// Returns how many threads were advanced.
    ///
    /// A thread that fails with a hard VM error is logged and retired;
    /// sibling threads keep running.
    pub fn tick_frame(&mut self, host: &mut dyn EnginePlugin) -> usize {
        let batch = self.arena.live_handles();
        let mut advanced = 0;
        for handle in batch {
            let Some(mut state) = self.arena.checkout(handle) else {
                continue;
            };
            let result = state.tick(&mut self.arena, host);
            let done = match &result {
                Ok(Tick::Done) => true,
                Ok(Tick::Suspended(_)) => false,
                Err(e) => {
                    log::error!("thread {} aborted: {e:#}", handle);
                    true
                }
            };
            self.arena.checkin(handle, state, done);
            advanced += 1;
        }
        advanced
    }

    /// Drive frames until every thread finishes; `false` when `max_frames`
    /// ran out first (e.g. threads parked on a pending host operation).
    pub fn run_until_idle(&mut self, host: &mut dyn EnginePlugin, max_frames: usize) -> bool {
        for _ in 0..max_frames {
            if !self.has_running() {
                return true;
            }
            self.tick_frame(host);
        }
        !self.has_running()
    }
}
