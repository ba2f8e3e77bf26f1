mod base;
mod broadcaster;

pub use base::{EventEmitter, EventPayload, ExecutionEvent};
pub use broadcaster::{EventBroadcaster, Subscription, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_LAG};
