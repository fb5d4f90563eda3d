mod queue;
mod types;

pub use queue::EventStream;
pub use types::{DisconnectReason, Event};
