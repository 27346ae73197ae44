pub mod cli;
pub mod comments;
pub mod config;
pub mod convergence;
pub mod diff;
pub mod engine;
pub mod error;
pub mod extract;
pub mod generation;
pub mod host;
pub mod issue;
pub mod prompts;
pub mod reconcile;
pub mod report;
pub mod steps;
pub mod threads;

#[cfg(test)]
pub mod test_helpers;
