pub mod slot;
pub mod stats;
pub mod watchdog;

pub use stats::StreamStats;
pub use watchdog::{Clock, ManualClock, SystemClock, WatchdogState};
