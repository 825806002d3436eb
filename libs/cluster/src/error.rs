//! Error types for watch plumbing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    /// The consumer side of an event channel is gone; the source should
    /// shut down.
    #[error("{0} event channel closed")]
    ChannelClosed(&'static str),
}
