//! tideway-executor: run blocking calls off the event loop
//!
//! Blocking driver calls are handed to Tokio's blocking pool, with a semaphore
//! capping how many run at once. The caller's task only ever awaits.

mod executor;

pub use executor::ThreadPoolExecutor;
