//! External tooling: version control and metrics capture.

pub mod git;
pub mod metrics;
