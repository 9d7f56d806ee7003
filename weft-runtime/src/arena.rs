use std::fmt;
use std::sync::Arc;

use weft_core::{Node, Package};

use crate::thread::ThreadState;

/// A stale-safe reference to a pooled thread: slot index plus the slot's
/// generation at spawn time. Reusing a slot bumps its generation, so
/// handles held across a thread's death simply stop validating.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct ThreadHandle {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl ThreadHandle {
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}.{}", self.slot, self.generation)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    live: bool,
    /// Kill arrived while the state was checked out for a tick.
    kill_requested: bool,
    /// `None` while checked out by the director.
    state: Option<Box<ThreadState>>,
}

/// Slot-and-generation pool of thread states.
///
/// States are reused across runs rather than reallocated; the generation
/// counter is what turns dangling handles into no-ops.
#[derive(Debug, Default)]
pub struct ThreadArena {
    slots: Vec<Slot>,
}

impl ThreadArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate (or reuse) a slot and set its thread up to run `node`.
    pub fn spawn(&mut self, package: Arc<Package>, node: Node) -> ThreadHandle {
        let idx = match self.slots.iter().position(|s| !s.live && s.state.is_some()) {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot {
                    state: Some(Box::default()),
                    ..Slot::default()
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[idx];
        slot.generation = slot.generation.wrapping_add(1);
        slot.live = true;
        slot.kill_requested = false;
        let handle = ThreadHandle {
            slot: idx as u32,
            generation: slot.generation,
        };
        if let Some(state) = slot.state.as_mut() {
            state.setup(handle, package, node);
        }
        handle
    }

    /// A handle is running while its slot is live and the generations
    /// still match.
    pub fn is_running(&self, handle: ThreadHandle) -> bool {
        self.slots
            .get(handle.slot as usize)
            .is_some_and(|s| s.live && s.generation == handle.generation)
    }

    pub fn has_running(&self) -> bool {
        self.slots.iter().any(|s| s.live)
    }

    pub fn live_handles(&self) -> Vec<ThreadHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.live)
            .map(|(i, s)| ThreadHandle {
                slot: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    /// Kill a thread and, recursively, all its tracked children. A thread
    /// currently checked out is killed when it checks back in.
    pub fn kill(&mut self, handle: ThreadHandle) {
        if !self.is_running(handle) {
            return;
        }
        let children = {
            let slot = &mut self.slots[handle.slot as usize];
            match slot.state.as_mut() {
                Some(state) => {
                    let children = state.take_children();
                    state.reset();
                    slot.live = false;
                    children
                }
                None => {
                    slot.kill_requested = true;
                    return;
                }
            }
        };
        for child in children {
            self.kill(child);
        }
    }

    /// Borrow a live thread state (not currently checked out).
    pub fn thread_mut(&mut self, handle: ThreadHandle) -> Option<&mut ThreadState> {
        if !self.is_running(handle) {
            return None;
        }
        self.slots[handle.slot as usize]
            .state
            .as_deref_mut()
    }

    /// Take a thread state out for a tick so the arena stays borrowable
    /// (forks spawn siblings mid-tick).
    pub(crate) fn checkout(&mut self, handle: ThreadHandle) -> Option<Box<ThreadState>> {
        if !self.is_running(handle) {
            return None;
        }
        self.slots[handle.slot as usize].state.take()
    }

    pub(crate) fn checkin(&mut self, handle: ThreadHandle, state: Box<ThreadState>, done: bool) {
        let Some(slot) = self.slots.get_mut(handle.slot as usize) else {
            return;
        };
        slot.state = Some(state);
        if slot.generation != handle.generation {
            return;
        }
        if done {
            slot.live = false;
        }
        let deferred_kill = std::mem::take(&mut slot.kill_requested);
        if deferred_kill && slot.live {
            self.kill(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::{PackageBuilder, StrHash};

    fn dummy_package() -> (Arc<Package>, Node) {
        let mut b = PackageBuilder::new("m");
        b.add_node(StrHash::new("m.a"), "m.a", 0, 1);
        let pkg = Arc::new(b.finish(vec![0x00]));
        let node = *pkg.node(StrHash::new("m.a")).unwrap();
        (pkg, node)
    }

    #[test]
    fn generations_invalidate_stale_handles() {
        let mut arena = ThreadArena::new();
        let (pkg, node) = dummy_package();
        let a = arena.spawn(pkg.clone(), node);
        assert!(arena.is_running(a));
        arena.kill(a);
        assert!(!arena.is_running(a));

        // the slot is reused with a fresh generation
        let b = arena.spawn(pkg, node);
        assert_eq!(a.slot(), b.slot());
        assert_ne!(a.generation(), b.generation());
        assert!(!arena.is_running(a));
        assert!(arena.is_running(b));
    }

    #[test]
    fn kill_cascades_to_tracked_children() {
        let mut arena = ThreadArena::new();
        let (pkg, node) = dummy_package();
        let parent = arena.spawn(pkg.clone(), node);
        let c1 = arena.spawn(pkg.clone(), node);
        let c2 = arena.spawn(pkg, node);
        if let Some(state) = arena.thread_mut(parent) {
            state.children.push(c1);
            state.children.push(c2);
        }
        arena.kill(parent);
        assert!(!arena.is_running(parent));
        assert!(!arena.is_running(c1));
        assert!(!arena.is_running(c2));
    }
}
