//! Driver events and their console rendering

pub mod console;
pub mod events;

pub use console::{ConsoleRenderer, FailurePolicy};
pub use events::DriverEvent;
