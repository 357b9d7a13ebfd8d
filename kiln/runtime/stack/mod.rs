pub mod handle;

pub use handle::{Handle, HandleContents, HandleContext, HandleScope, HANDLE_BLOCK_SIZE};

#[cfg(feature = "handle_stats")]
pub use handle::HandleStats;
