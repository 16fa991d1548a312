pub mod cleaner;
pub mod control_block;
pub mod evict;
pub mod latch;
pub mod pool;

pub use cleaner::Cleaner;
pub use control_block::ControlBlock;
pub use evict::EvictUrgency;
pub use latch::{Latch, LatchMode};
pub use pool::{BufferPool, EvictPolicy, PageGuard};
