//! Iterative code-change loop.
//!
//! A task pairs a natural-language requirement with a repository. The loop
//! asks a generator for a patch, applies it on a working branch, runs the
//! quality gate and either accepts the change or reverts it and tries again
//! with the gate's findings, until the change passes or the iteration budget
//! runs out.
//!
//! - **[`core`]**: Pure data and rules (patches, verdicts, history, phases).
//! - **[`io`]**: Git workspaces, generators, checks, config and task logs.
//!
//! [`controller`] drives one task over those seams; [`task`] wires a task
//! spec and a config into a run for the CLI.

pub mod cancel;
pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
