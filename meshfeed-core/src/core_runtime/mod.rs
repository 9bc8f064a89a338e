//! Runtime plumbing shared by the actors: owned tasks, time, retry policy.

pub mod backoff;
pub mod clock;
pub mod task;

pub use backoff::{Backoff, BackoffPolicy, FullJitter, Jitter, NoJitter};
pub use clock::{Clock, ManualClock, TokioClock};
pub use task::{spawn_owned, AbortingJoinHandle};
