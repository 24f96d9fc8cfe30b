//! Shared SDK state with actor pattern
//!
//! The [`State`] record is the only shared mutable resource in the SDK.
//! A `StateManager` actor owns it and processes commands via channels, so
//! every component reads and writes through [`StateHandle`] rather than
//! holding direct references. Racing writes stay visible as racing `set`
//! calls instead of hidden aliasing bugs.

mod manager;
mod messages;

pub use manager::{StateHandle, StateManager};
pub use messages::{State, StateCommand, StateError, StateResponse, StateUpdate};
