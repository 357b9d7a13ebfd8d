//! Global handle table - roots whose lifetime is not tied to a scope.
//!
//! Entries live in fixed-size blocks. A disposed entry goes on a free list and
//! is reused; a fully free trailing block is released. Indices of live entries
//! never change, so disposing high entries never disturbs lower ones.
//!
//! Strong entries are roots. Weak entries are visited only to follow moved
//! objects and are cleared to undefined when their target dies.
//!
//! Every operation takes the table lock.

use parking_lot::Mutex;

use crate::{
    error::GlobalHandleError,
    fatal,
    tagged_value::{Address, TaggedValue},
    visitor::RootVisitor,
};

pub const GLOBAL_BLOCK_SIZE: usize = 256;

/// Callback run when the target of a weak global dies
pub type WeakCallback = Box<dyn FnOnce() + Send>;

/// Token for an entry in the global handle table.
///
/// The generation detects use of a token after its entry was disposed, even if
/// the slot has since been reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GlobalHandle {
    index: u32,
    generation: u32,
}

impl GlobalHandle {
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeState {
    Free,
    Strong,
    Weak,
}

struct Node {
    value: TaggedValue,
    generation: u32,
    state: NodeState,
    /// Runs while the dead target is cleared. Must not allocate.
    first_pass: Option<WeakCallback>,
    /// Runs after the collection has finished.
    second_pass: Option<WeakCallback>,
}

struct NodeBlock {
    nodes: Vec<Node>,
    used: usize,
}

struct Table {
    blocks: Vec<NodeBlock>,
    free_list: Vec<u32>,
    live_count: usize,
    /// Generation given to nodes of newly created blocks
    generation_floor: u32,
    pending_second_pass: Vec<WeakCallback>,
}

impl Table {
    fn node(&self, handle: GlobalHandle) -> Result<&Node, GlobalHandleError> {
        let index = handle.index as usize;
        let node = self
            .blocks
            .get(index / GLOBAL_BLOCK_SIZE)
            .and_then(|block| block.nodes.get(index % GLOBAL_BLOCK_SIZE))
            .ok_or(GlobalHandleError::OutOfRange { index: handle.index })?;

        if node.state == NodeState::Free || node.generation != handle.generation {
            return Err(GlobalHandleError::Disposed { index: handle.index });
        }

        Ok(node)
    }

    fn node_mut(&mut self, handle: GlobalHandle) -> &mut Node {
        if let Err(error) = self.node(handle) {
            fatal!("invalid global handle: {error}");
        }

        let index = handle.index as usize;
        &mut self.blocks[index / GLOBAL_BLOCK_SIZE].nodes[index % GLOBAL_BLOCK_SIZE]
    }

    fn allocate(&mut self, value: TaggedValue) -> GlobalHandle {
        let index = match self.free_list.pop() {
            Some(index) => index as usize,
            None => {
                if self.blocks.last().map_or(true, |block| block.nodes.len() == GLOBAL_BLOCK_SIZE) {
                    self.blocks.push(NodeBlock {
                        nodes: Vec::with_capacity(GLOBAL_BLOCK_SIZE),
                        used: 0,
                    });
                }

                let block_index = self.blocks.len() - 1;
                let block = &mut self.blocks[block_index];
                block.nodes.push(Node {
                    value: TaggedValue::UNDEFINED,
                    generation: self.generation_floor,
                    state: NodeState::Free,
                    first_pass: None,
                    second_pass: None,
                });
                block_index * GLOBAL_BLOCK_SIZE + block.nodes.len() - 1
            }
        };

        let block = &mut self.blocks[index / GLOBAL_BLOCK_SIZE];
        block.used += 1;
        let node = &mut block.nodes[index % GLOBAL_BLOCK_SIZE];
        node.value = value;
        node.state = NodeState::Strong;
        self.live_count += 1;

        GlobalHandle {
            index: index as u32,
            generation: node.generation,
        }
    }

    fn release(&mut self, handle: GlobalHandle) {
        let node = self.node_mut(handle);
        node.state = NodeState::Free;
        node.value = TaggedValue::UNDEFINED;
        node.generation = node.generation.wrapping_add(1);
        node.first_pass = None;
        node.second_pass = None;

        let index = handle.index as usize;
        self.blocks[index / GLOBAL_BLOCK_SIZE].used -= 1;
        self.free_list.push(handle.index);
        self.live_count -= 1;

        self.release_trailing_blocks();
    }

    fn release_trailing_blocks(&mut self) {
        let mut released = false;
        while self.blocks.last().is_some_and(|block| block.used == 0) {
            if let Some(block) = self.blocks.pop() {
                let max_generation = block.nodes.iter().map(|node| node.generation).max().unwrap_or(0);
                self.generation_floor = self.generation_floor.max(max_generation.wrapping_add(1));
                released = true;
            }
        }

        if released {
            let limit = (self.blocks.len() * GLOBAL_BLOCK_SIZE) as u32;
            self.free_list.retain(|&index| index < limit);
        }
    }

    fn live_nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.blocks
            .iter_mut()
            .flat_map(|block| block.nodes.iter_mut())
            .filter(|node| node.state != NodeState::Free)
    }
}

pub struct GlobalHandleTable {
    table: Mutex<Table>,
}

impl GlobalHandleTable {
    pub fn new() -> GlobalHandleTable {
        GlobalHandleTable {
            table: Mutex::new(Table {
                blocks: Vec::new(),
                free_list: Vec::new(),
                live_count: 0,
                generation_floor: 0,
                pending_second_pass: Vec::new(),
            }),
        }
    }

    /// Create a strong global holding `value`.
    pub fn new_global(&self, value: TaggedValue) -> GlobalHandle {
        self.table.lock().allocate(value)
    }

    /// Dispose of a global. Disposing twice is fatal.
    pub fn dispose(&self, handle: GlobalHandle) {
        self.table.lock().release(handle)
    }

    pub fn get(&self, handle: GlobalHandle) -> TaggedValue {
        self.table.lock().node_mut(handle).value
    }

    /// Non-fatal lookup for callers that want to report misuse themselves.
    pub fn try_get(&self, handle: GlobalHandle) -> Result<TaggedValue, GlobalHandleError> {
        self.table.lock().node(handle).map(|node| node.value)
    }

    pub fn set(&self, handle: GlobalHandle, value: TaggedValue) {
        self.table.lock().node_mut(handle).value = value;
    }

    /// Make the global weak: it no longer keeps its target alive.
    pub fn set_weak(&self, handle: GlobalHandle) {
        self.table.lock().node_mut(handle).state = NodeState::Weak;
    }

    /// Make the global weak and register callbacks run when its target dies.
    pub fn set_weak_with_callback(
        &self,
        handle: GlobalHandle,
        first_pass: Option<WeakCallback>,
        second_pass: Option<WeakCallback>,
    ) {
        let mut table = self.table.lock();
        let node = table.node_mut(handle);
        node.state = NodeState::Weak;
        node.first_pass = first_pass;
        node.second_pass = second_pass;
    }

    /// Make a weak global strong again, dropping its callbacks.
    pub fn clear_weak(&self, handle: GlobalHandle) {
        let mut table = self.table.lock();
        let node = table.node_mut(handle);
        node.state = NodeState::Strong;
        node.first_pass = None;
        node.second_pass = None;
    }

    pub fn is_weak(&self, handle: GlobalHandle) -> bool {
        self.table.lock().node_mut(handle).state == NodeState::Weak
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.table.lock().live_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn block_count(&self) -> usize {
        self.table.lock().blocks.len()
    }

    // ========================================================================
    // Collector interface
    // ========================================================================

    /// Visit strong entries as roots.
    pub(crate) fn iterate_strong(&self, visitor: &mut dyn RootVisitor) {
        let mut table = self.table.lock();
        for node in table.live_nodes_mut() {
            if node.state == NodeState::Strong {
                visitor.visit_root(&mut node.value);
            }
        }
    }

    /// Visit weak entries so a moving collection can update them.
    pub(crate) fn iterate_weak(&self, visitor: &mut dyn RootVisitor) {
        let mut table = self.table.lock();
        for node in table.live_nodes_mut() {
            if node.state == NodeState::Weak {
                visitor.visit_root(&mut node.value);
            }
        }
    }

    /// Update or clear every weak entry pointing into the heap.
    ///
    /// `update` returns the target's current address if it survived, `None` if
    /// it died. Dead entries become undefined and their first-pass callbacks run
    /// once the table lock is released.
    pub(crate) fn sweep_weak(&self, mut update: impl FnMut(Address) -> Option<Address>) -> usize {
        let mut first_pass = Vec::new();
        let mut cleared = 0;

        {
            let mut table = self.table.lock();
            let mut second_pass = Vec::new();

            for node in table.live_nodes_mut() {
                if node.state != NodeState::Weak {
                    continue;
                }

                let Some(addr) = node.value.heap_address() else {
                    continue;
                };

                match update(addr) {
                    Some(new_addr) => node.value = TaggedValue::from_address(new_addr),
                    None => {
                        node.value = TaggedValue::UNDEFINED;
                        cleared += 1;
                        first_pass.extend(node.first_pass.take());
                        second_pass.extend(node.second_pass.take());
                    }
                }
            }

            table.pending_second_pass.append(&mut second_pass);
        }

        for callback in first_pass {
            callback();
        }

        cleared
    }

    /// Second-pass callbacks queued by the last collection.
    pub(crate) fn take_second_pass_callbacks(&self) -> Vec<WeakCallback> {
        std::mem::take(&mut self.table.lock().pending_second_pass)
    }
}

impl Default for GlobalHandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn slots_are_reused() {
        let table = GlobalHandleTable::new();
        let a = table.new_global(TaggedValue::from_i32(1));
        let b = table.new_global(TaggedValue::from_i32(2));
        table.dispose(a);

        let c = table.new_global(TaggedValue::from_i32(3));
        assert_eq!(c.index(), a.index());
        assert_ne!(c, a);
        assert_eq!(table.get(b), TaggedValue::from_i32(2));
        assert_eq!(table.get(c), TaggedValue::from_i32(3));
        assert_eq!(table.try_get(a), Err(GlobalHandleError::Disposed { index: a.index() }));
    }

    #[test]
    fn disposing_high_entries_keeps_low_entries() {
        let table = GlobalHandleTable::new();
        let handles: Vec<_> = (0..3 * GLOBAL_BLOCK_SIZE as i32)
            .map(|i| table.new_global(TaggedValue::from_i32(i)))
            .collect();
        assert_eq!(table.block_count(), 3);

        for handle in handles[GLOBAL_BLOCK_SIZE..].iter().rev() {
            table.dispose(*handle);
        }

        assert_eq!(table.block_count(), 1);
        for (i, handle) in handles[..GLOBAL_BLOCK_SIZE].iter().enumerate() {
            assert_eq!(table.get(*handle), TaggedValue::from_i32(i as i32));
        }

        // A stale token from a released block never aliases a new entry
        let stale = handles[2 * GLOBAL_BLOCK_SIZE];
        let fresh: Vec<_> = (0..2 * GLOBAL_BLOCK_SIZE)
            .map(|_| table.new_global(TaggedValue::NULL))
            .collect();
        assert!(fresh.iter().any(|h| h.index() == stale.index()));
        assert!(table.try_get(stale).is_err());
    }

    #[test]
    #[should_panic(expected = "invalid global handle")]
    fn double_dispose_is_fatal() {
        let table = GlobalHandleTable::new();
        let handle = table.new_global(TaggedValue::TRUE);
        table.dispose(handle);
        table.dispose(handle);
    }

    #[test]
    fn weak_state_transitions() {
        let table = GlobalHandleTable::new();
        let handle = table.new_global(TaggedValue::TRUE);
        assert!(!table.is_weak(handle));
        table.set_weak(handle);
        assert!(table.is_weak(handle));
        table.clear_weak(handle);
        assert!(!table.is_weak(handle));
    }

    #[test]
    fn sweep_weak_clears_dead_targets_and_runs_callbacks() {
        let table = GlobalHandleTable::new();
        let dead = table.new_global(TaggedValue::from_address(0x1000));
        let moved = table.new_global(TaggedValue::from_address(0x2000));
        let strong = table.new_global(TaggedValue::from_address(0x3000));

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let (f, s) = (first.clone(), second.clone());
        table.set_weak_with_callback(
            dead,
            Some(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })),
            Some(Box::new(move || {
                s.fetch_add(1, Ordering::SeqCst);
            })),
        );
        table.set_weak(moved);

        let cleared = table.sweep_weak(|addr| match addr {
            0x1000 => None,
            0x2000 => Some(0x8000),
            other => Some(other),
        });

        assert_eq!(cleared, 1);
        assert_eq!(table.get(dead), TaggedValue::UNDEFINED);
        assert_eq!(table.get(moved), TaggedValue::from_address(0x8000));
        assert_eq!(table.get(strong), TaggedValue::from_address(0x3000));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        for callback in table.take_second_pass_callbacks() {
            callback();
        }
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
