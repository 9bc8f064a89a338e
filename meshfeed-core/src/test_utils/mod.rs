//! Test utilities and helpers for meshfeed
//!
//! Shared by the unit tests inside the crate and the integration tests
//! under `tests/`.

pub mod assertions;
pub mod async_helpers;
pub mod deterministic_rng;
pub mod fixtures;

pub use assertions::*;
pub use async_helpers::*;
pub use deterministic_rng::*;
pub use fixtures::*;
