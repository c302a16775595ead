//! Side-effecting collaborators of the loop: git, processes, the network and
//! the on-disk task log.

pub mod checks;
pub mod config;
pub mod diff;
pub mod gate;
pub mod generator;
pub mod git;
pub mod llm;
pub mod process;
pub mod prompt;
pub mod report;
pub mod workspace;
