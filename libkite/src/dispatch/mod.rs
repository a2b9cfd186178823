//! Where finished jobs go: local hooks and the message queue. Both are
//! enabled independently and fail independently.

pub mod hooks;
pub mod queue;

pub use hooks::{HookError, HookReport, HookRunner};
pub use queue::{publish_job, Publisher, QueueConnection, RedisPublisher, TransportError};
