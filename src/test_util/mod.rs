//! Utilities for testing code built on routers and streams. They are used by the crate's own
//!  tests, and they are exported for application testing.

pub mod link;
pub mod router;
