pub mod local;
pub mod retry;

pub use local::LocalBackend;
pub use retry::{RetryBackend, RetryConfig, Retryable, retry_with_backoff};
pub use strata_core::{Backend, BackendType};
