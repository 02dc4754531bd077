pub mod sync;
pub mod types;

pub use sync::ScanScheduler;
pub use types::*;
