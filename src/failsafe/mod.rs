//! Failsafe mechanisms for calls to shared infrastructure

mod retry;

pub use retry::{RetryPolicy, with_retry};
