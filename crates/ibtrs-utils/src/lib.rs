pub mod background_runner;
pub mod backoff;
pub mod semaphore;
pub mod shards;

pub use background_runner::BackgroundRunner;
pub use backoff::{BackoffPolicy, ReconnectBackoff};
pub use semaphore::{AcquireError, Semaphore};
pub use shards::{Shards, current_cpu};
