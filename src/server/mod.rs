//! Server side: listeners, their sessions and the scheduler

/// Session admission on one bound address
pub mod listener;
/// Dispatch targets
pub mod scheduler;
#[allow(clippy::module_inception)]
pub mod server;

pub use listener::{Listener, ListenerStatus};
pub use scheduler::{Dispatch, Job, Scheduler};
pub use server::{Server, ServerStatus};
