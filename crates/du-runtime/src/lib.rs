#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod aggregate;
pub mod cycle;
pub mod handler;
pub mod metrics;
pub mod scheduler;
pub mod snapshot;
