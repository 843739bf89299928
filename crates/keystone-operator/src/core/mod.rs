mod context;
mod event;

pub use context::{Context, SharedContext};
pub use event::{CancelEvent, CancelReason, CancelRegistry};
