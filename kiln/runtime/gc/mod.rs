mod heap;

pub use heap::Heap;
