//! Execution control
//!
//! Orders kernel primitives into a confinement chain with type-state enforcement.

pub mod preexec;
