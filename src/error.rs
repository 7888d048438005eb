//! Error taxonomy for the shared-memory publication core.
//!
//! Collaborators at the edges (camera, decoder, config) report through
//! `anyhow`; everything that touches the shared segment or the named lock
//! reports a `RelayError` so the acquisition loop can tell a transient fault
//! from one that will never heal.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Creating, opening or mapping a named OS object failed.
    #[error("shared resource {name}: {source}")]
    Resource {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Camera fetch or decode failed; the next cycle may succeed.
    #[error("acquisition failed: {0:#}")]
    Transient(anyhow::Error),

    /// An OS call failed while publishing into an open segment.
    #[error("publish i/o: {0}")]
    Io(#[source] io::Error),

    #[error("frame length mismatch: expected {expected} bytes, got {actual}")]
    FrameLength { expected: usize, actual: usize },

    /// The segment mapping is gone; publishing can never succeed again.
    #[error("shared segment {0} is closed")]
    Closed(String),

    /// The lock handle is no longer a valid semaphore.
    #[error("named lock {name} is unusable: {source}")]
    LockInvalid {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Shutdown was requested while waiting for the named lock.
    #[error("shutdown requested while waiting for named lock {0}")]
    Cancelled(String),

    #[error("invalid shared object name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
}

impl RelayError {
    pub(crate) fn resource(name: &str, source: io::Error) -> Self {
        Self::Resource {
            name: name.to_string(),
            source,
        }
    }

    /// Errors that must stop the process instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Resource { .. }
                | Self::Closed(_)
                | Self::LockInvalid { .. }
                | Self::InvalidName { .. }
        )
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;
