//! Queue module: priority scheduling, admission control and retry timing.

mod retry;
mod scheduler;

pub use retry::RetryPolicy;
pub use scheduler::{Admission, Scheduler};
