//! Session events and their delivery to listeners

pub mod dispatcher;
pub mod events;

// Re-export main components for convenience
pub use dispatcher::{EventDispatcher, SharedDispatcher};
pub use events::{AuthEvent, AuthEventKind, AuthListener, FnListener};
