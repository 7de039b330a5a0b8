//! Child process bookkeeping
//!
//! One [`ChildProcess`] per OS process: the recording child and the pool of
//! replaying children. Each child runs at most one manifest at a time.

mod pool;
mod process;

pub use pool::ChildPool;
pub use process::{ChildProcess, InFlight, Role};

/// Child identifier assigned by the engine
pub type ChildId = usize;
