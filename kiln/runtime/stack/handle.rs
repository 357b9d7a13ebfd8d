use std::{
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

use kiln_gc::{fatal, GcContext, RootVisitor, TaggedValue};

use crate::runtime::Context;

/// Number of handles contained in a single handle block. Default to 4KB handle blocks.
pub const HANDLE_BLOCK_SIZE: usize = 512;

/// Types that can live in a handle slot. The slot always stores a tagged value;
/// typed handles convert on the way out.
pub trait HandleContents: Copy {
    fn from_tagged(value: TaggedValue) -> Self;

    fn to_tagged(self) -> TaggedValue;
}

impl HandleContents for TaggedValue {
    #[inline]
    fn from_tagged(value: TaggedValue) -> Self {
        value
    }

    #[inline]
    fn to_tagged(self) -> TaggedValue {
        self
    }
}

/// Stamp written into a handle slot each time it is handed out. Checking builds
/// compare it against the handle's copy to catch a slot reused by a later scope.
#[cfg(any(debug_assertions, feature = "handle_check"))]
type Stamp = u32;

#[cfg(not(any(debug_assertions, feature = "handle_check")))]
type Stamp = ();

/// Handles are indices into the context's handle stack. The collector may
/// rewrite the slot behind a handle when it moves the object, so a handle stays
/// valid across a GC while a raw address does not.
///
/// A handle is valid until the scope that created it closes.
pub struct Handle<T = TaggedValue> {
    index: u32,
    stamp: Stamp,
    phantom_data: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    #[inline]
    fn new(index: usize, stamp: Stamp) -> Handle<T> {
        Handle {
            index: index as u32,
            stamp,
            phantom_data: PhantomData,
        }
    }

    /// Position of this handle on the handle stack
    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn cast<U>(self) -> Handle<U> {
        Handle::new(self.index(), self.stamp)
    }

    #[inline]
    pub fn as_value(self) -> Handle<TaggedValue> {
        self.cast()
    }
}

impl<T: HandleContents> Handle<T> {
    /// Read the current contents of the handle.
    #[inline]
    pub fn get(self, cx: &Context) -> T {
        T::from_tagged(cx.handles.load(self))
    }

    /// The raw tagged value behind the handle
    #[inline]
    pub fn value(self, cx: &Context) -> TaggedValue {
        cx.handles.load(self)
    }

    /// Replace the contents behind this handle. Every copy of the handle sees
    /// the new contents.
    #[inline]
    pub fn replace(self, cx: &mut Context, contents: T) {
        cx.handles.store(self, contents.to_tagged());
    }
}

impl<T> Clone for Handle<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.stamp == other.stamp
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.index)
    }
}

type HandleBlock = Box<[TaggedValue; HANDLE_BLOCK_SIZE]>;

fn new_block() -> HandleBlock {
    Box::new([TaggedValue::UNDEFINED; HANDLE_BLOCK_SIZE])
}

/// The handle stack of a context: a chain of fixed-size blocks, allocated LIFO.
pub struct HandleContext {
    /// Blocks currently in use. Every block but the last is full.
    blocks: Vec<HandleBlock>,

    /// Blocks released by closed scopes, reused before allocating new ones
    free_blocks: Vec<HandleBlock>,

    /// Index of the next handle to allocate
    top: usize,

    /// Stamp of the handle last given out for each slot
    #[cfg(any(debug_assertions, feature = "handle_check"))]
    stamps: Vec<Stamp>,
    #[cfg(any(debug_assertions, feature = "handle_check"))]
    next_stamp: Stamp,

    /// Max number of handles allocated at once observed so far
    #[cfg(feature = "handle_stats")]
    max_handles: usize,
}

#[cfg(feature = "handle_stats")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleStats {
    pub num_handles: usize,
    pub max_handles: usize,
}

impl HandleContext {
    /// Create a new HandleContext with its first block allocated
    pub fn new() -> HandleContext {
        HandleContext {
            blocks: vec![new_block()],
            free_blocks: Vec::new(),
            top: 0,
            #[cfg(any(debug_assertions, feature = "handle_check"))]
            stamps: Vec::new(),
            #[cfg(any(debug_assertions, feature = "handle_check"))]
            next_stamp: 0,
            #[cfg(feature = "handle_stats")]
            max_handles: 0,
        }
    }

    /// Push a value onto the handle stack, returning a handle to its slot.
    #[inline]
    pub(crate) fn push(&mut self, value: TaggedValue) -> Handle<TaggedValue> {
        let index = self.top;
        let (block, offset) = (index / HANDLE_BLOCK_SIZE, index % HANDLE_BLOCK_SIZE);

        // Handle block is full, so push a new block onto the stack
        if block == self.blocks.len() {
            self.push_block();
        }

        self.blocks[block][offset] = value;
        self.top += 1;

        #[cfg(feature = "handle_stats")]
        {
            self.max_handles = self.max_handles.max(self.top);
        }

        Handle::new(index, self.stamp_slot(index))
    }

    #[cfg(any(debug_assertions, feature = "handle_check"))]
    fn stamp_slot(&mut self, index: usize) -> Stamp {
        self.next_stamp = self.next_stamp.wrapping_add(1);
        if index == self.stamps.len() {
            self.stamps.push(self.next_stamp);
        } else {
            self.stamps[index] = self.next_stamp;
        }
        self.next_stamp
    }

    #[cfg(not(any(debug_assertions, feature = "handle_check")))]
    #[inline]
    fn stamp_slot(&mut self, _: usize) -> Stamp {}

    #[inline]
    pub(crate) fn load<T>(&self, handle: Handle<T>) -> TaggedValue {
        let index = handle.index();
        self.check_live(handle);
        self.blocks[index / HANDLE_BLOCK_SIZE][index % HANDLE_BLOCK_SIZE]
    }

    #[inline]
    pub(crate) fn store<T>(&mut self, handle: Handle<T>, value: TaggedValue) {
        let index = handle.index();
        self.check_live(handle);
        self.blocks[index / HANDLE_BLOCK_SIZE][index % HANDLE_BLOCK_SIZE] = value;
    }

    /// A handle past the top belongs to a closed scope. A handle whose stamp
    /// no longer matches its slot belongs to a closed scope whose slot a later
    /// scope reused.
    #[cfg(any(debug_assertions, feature = "handle_check"))]
    #[inline]
    fn check_live<T>(&self, handle: Handle<T>) {
        let index = handle.index();
        if index >= self.top {
            fatal!("use of handle {index} after its scope closed (handle top is {})", self.top);
        }
        if self.stamps[index] != handle.stamp {
            fatal!("use of handle {index} after its scope closed (slot was reused)");
        }
    }

    #[cfg(not(any(debug_assertions, feature = "handle_check")))]
    #[inline]
    fn check_live<T>(&self, _: Handle<T>) {}

    fn push_block(&mut self) {
        let block = self.free_blocks.pop().unwrap_or_else(new_block);
        self.blocks.push(block);
    }

    /// Current top of the handle stack, saved when a scope opens.
    #[inline]
    pub(crate) fn top(&self) -> usize {
        self.top
    }

    /// Release every handle at or above `saved_top`. Blocks emptied by the
    /// release go to the free list, the first block is always kept.
    pub(crate) fn close_scope(&mut self, saved_top: usize) {
        if saved_top > self.top {
            fatal!("handle scopes closed out of order: saved top {saved_top} above {}", self.top);
        }

        let needed_blocks = saved_top.div_ceil(HANDLE_BLOCK_SIZE).max(1);
        while self.blocks.len() > needed_blocks {
            if let Some(block) = self.blocks.pop() {
                self.free_blocks.push(block);
            }
        }

        self.top = saved_top;
    }

    /// Return the number of handles that are currently being used.
    pub fn handle_count(&self) -> usize {
        self.top
    }

    /// Return the number of blocks in use.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Return the number of free handle blocks in the free list.
    pub fn free_handle_block_count(&self) -> usize {
        self.free_blocks.len()
    }

    #[cfg(feature = "handle_stats")]
    pub fn handle_stats(&self) -> HandleStats {
        HandleStats {
            num_handles: self.top,
            max_handles: self.max_handles,
        }
    }
}

impl GcContext for HandleContext {
    fn visit_roots(&mut self, visitor: &mut dyn RootVisitor) {
        // Only visit values that have been used, aka before the top
        for (index, block) in self.blocks.iter_mut().enumerate() {
            let start = index * HANDLE_BLOCK_SIZE;
            if start >= self.top {
                break;
            }

            let used = (self.top - start).min(HANDLE_BLOCK_SIZE);
            visitor.visit_root_range(&mut block[..used]);
        }
    }
}

impl Default for HandleContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A guard which enters a handle scope and exits it when dropped, on every exit
/// path including unwinding. Derefs to the context so handles can be created
/// through it.
#[must_use = "a handle scope closes as soon as it is dropped"]
pub struct HandleScope<'a> {
    cx: &'a mut Context,
    saved_top: usize,
}

impl<'a> HandleScope<'a> {
    #[inline]
    pub fn new(cx: &'a mut Context) -> HandleScope<'a> {
        let saved_top = cx.handles.top();
        HandleScope { cx, saved_top }
    }

    /// Exit the handle scope and return a handle escaped into the parent's
    /// handle scope.
    pub fn escape<T>(self, handle: Handle<T>) -> Handle<T> {
        let value = self.cx.handles.load(handle);

        let mut scope = std::mem::ManuallyDrop::new(self);
        let saved_top = scope.saved_top;
        scope.cx.handles.close_scope(saved_top);
        scope.cx.handles.push(value).cast()
    }
}

impl Deref for HandleScope<'_> {
    type Target = Context;

    #[inline]
    fn deref(&self) -> &Context {
        self.cx
    }
}

impl DerefMut for HandleScope<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Context {
        self.cx
    }
}

impl Drop for HandleScope<'_> {
    #[inline]
    fn drop(&mut self) {
        self.cx.handles.close_scope(self.saved_top);
    }
}

impl Context {
    /// Root a value in the current handle scope.
    #[inline]
    pub fn handle<T: HandleContents>(&mut self, contents: T) -> Handle<T> {
        self.handles.push(contents.to_tagged()).cast()
    }
}
