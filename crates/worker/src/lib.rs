//! Job consumption for package testing.
//!
//! Jobs arrive on a queue as JSON payloads and are tested either in this
//! process or in an isolated child process.

#![warn(missing_docs)]

pub mod queue;
pub mod consumer;
pub mod dispatch;

pub use queue::{JobQueue, MemoryQueue, QueueError, SpoolQueue};
pub use consumer::{Consumer, DrainStats, JobHandler};
pub use dispatch::{ChildRunner, Dispatch, DispatchError};
