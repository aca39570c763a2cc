//! Safety and cleanup
//!
//! Every resource a launch creates is recorded and released exactly once.

pub mod cleanup;
