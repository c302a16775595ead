//! Deterministic, pure logic for the iteration loop.
//!
//! Nothing in here touches the filesystem, git or the network. Types are
//! plain data and every rule is testable in isolation.

pub mod budget;
pub mod errors;
pub mod patch;
pub mod state;
pub mod types;
pub mod verdict;
