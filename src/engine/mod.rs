//! Mirroring engine: snapshot classification, capital allocation, order
//! execution, and post-execution exit monitoring.

mod allocator;
mod detector;
mod executor;
mod exits;

pub use allocator::{CapitalAllocator, FundingMode};
pub use detector::SignalDetector;
pub use executor::{ExecutionMode, OrderExecutor};
pub use exits::ExitMonitor;
