//! Mark work queue
//!
//! Gray objects waiting to be scanned. Roots and the write barrier push into a
//! shared injector; each marking thread keeps a local LIFO deque for cache
//! locality and steals batches from the injector when it runs dry.

use crossbeam_deque::{Injector, Steal, Worker};

use crate::tagged_value::Address;

/// Local deques spill into the injector past this size so idle workers can
/// pick up the excess.
const LOCAL_SPILL_LIMIT: usize = 256;

pub struct WorkQueue {
    injector: Injector<Address>,
}

impl WorkQueue {
    pub fn new() -> WorkQueue {
        WorkQueue {
            injector: Injector::new(),
        }
    }

    #[inline]
    pub fn push(&self, addr: Address) {
        self.injector.push(addr);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.injector.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.injector.len()
    }

    /// Create a local deque attached to this queue for one marking thread.
    pub fn local(&self) -> LocalQueue<'_> {
        LocalQueue {
            global: self,
            local: Worker::new_lifo(),
        }
    }

    /// Drop all pending work.
    pub fn clear(&self) {
        loop {
            match self.injector.steal() {
                Steal::Success(_) | Steal::Retry => continue,
                Steal::Empty => break,
            }
        }
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-thread view of the work queue
pub struct LocalQueue<'a> {
    global: &'a WorkQueue,
    local: Worker<Address>,
}

impl LocalQueue<'_> {
    #[inline]
    pub fn push(&mut self, addr: Address) {
        if self.local.len() >= LOCAL_SPILL_LIMIT {
            self.global.push(addr);
        } else {
            self.local.push(addr);
        }
    }

    /// Pop local work first, then steal a batch from the injector.
    pub fn pop(&mut self) -> Option<Address> {
        if let Some(addr) = self.local.pop() {
            return Some(addr);
        }

        loop {
            match self.global.injector.steal_batch_and_pop(&self.local) {
                Steal::Success(addr) => return Some(addr),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }
}

impl Drop for LocalQueue<'_> {
    /// Return unfinished work to the injector.
    fn drop(&mut self) {
        while let Some(addr) = self.local.pop() {
            self.global.push(addr);
        }
    }
}
