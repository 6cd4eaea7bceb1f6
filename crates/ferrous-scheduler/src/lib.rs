//! Trigger filtering, concurrency groups and run coordination for Ferrous CI.

pub mod archive;
pub mod bus;
pub mod concurrency;
pub mod coordinator;
pub mod triggers;

pub use archive::{InMemoryRunArchive, JsonFileRunArchive};
pub use bus::EventBus;
pub use concurrency::{Admission, ConcurrencyRegistry, RunSlot};
pub use coordinator::{RunCoordinator, RunHandle, resolve_group};
pub use triggers::{TriggerMatcher, glob_match};
