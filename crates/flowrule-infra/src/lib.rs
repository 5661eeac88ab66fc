//! Resilience and concurrency building blocks shared by the workflow and
//! automation crates.

pub mod cache;
pub mod lock;
pub mod resilience;

pub use cache::{CacheStats, VersionedCache};
pub use lock::{KeyedLock, KeyedLockGuard};
pub use resilience::{retry_with, with_timeout, RetryConfig, RetryPolicy, TimeoutError};
