//! Ferrous CI Core
//!
//! Core domain types, traits, and error handling for Ferrous CI.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the scheduler, the runner and the CLI.

pub mod cancel;
pub mod error;
pub mod events;
pub mod ids;
pub mod interpolation;
pub mod ports;
pub mod run;
pub mod trigger;
pub mod workflow;

pub use cancel::{CancelSignal, CancelToken};
pub use error::{Error, Result};
pub use ids::*;
