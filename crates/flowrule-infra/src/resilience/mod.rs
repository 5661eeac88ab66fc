//! Resilience patterns for calls to external collaborators
//!
//! Provides bounded retry with exponential backoff and per-call timeouts.

pub mod retry;
pub mod timeout;

pub use retry::{retry_with, RetryConfig, RetryPolicy};
pub use timeout::{with_timeout, TimeoutError};
