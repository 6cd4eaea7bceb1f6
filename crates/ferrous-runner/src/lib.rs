//! Build backend execution for Ferrous CI.

pub mod runner;
pub mod shell;

pub use runner::{OutputLine, OutputStream, RunnerConfig};
pub use shell::ShellBackend;
