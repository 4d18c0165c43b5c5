use std::fmt;

use super::identity::Identity;

//------------ IpCacheError --------------------------------------------------

/// Possible errors returned by operations on the metadata cache.
#[derive(Debug, PartialEq, Eq)]
pub enum IpCacheError {
    /// The identity allocator has not been initialized yet. The injection
    /// run returning this error re-enqueued everything it dequeued, so
    /// retrying is safe and will eventually succeed once the allocator
    /// comes up.
    AllocatorUninitialized,
    /// The identity allocator failed to hand out an identity. The affected
    /// prefixes were re-enqueued; retrying is safe.
    Allocator(AllocatorError),
    /// The operation was cancelled through its cancellation token before
    /// it could complete.
    Cancelled,
    /// One of the metric collectors could not be registered. Returned only
    /// during construction.
    Metrics(String),
}

impl fmt::Display for IpCacheError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IpCacheError::AllocatorUninitialized => {
                write!(f, "Error: The identity allocator is uninitialized.")
            }
            IpCacheError::Allocator(err) => {
                write!(f, "Error: Identity allocation failed: {}", err)
            }
            IpCacheError::Cancelled => {
                write!(f, "Error: The operation was cancelled.")
            }
            IpCacheError::Metrics(msg) => {
                write!(
                    f,
                    "Error: A metric collector could not be registered: {}",
                    msg
                )
            }
        }
    }
}

impl std::error::Error for IpCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IpCacheError::Allocator(err) => Some(err),
            _ => None,
        }
    }
}

impl From<AllocatorError> for IpCacheError {
    fn from(err: AllocatorError) -> Self {
        match err {
            AllocatorError::Uninitialized => {
                IpCacheError::AllocatorUninitialized
            }
            err => IpCacheError::Allocator(err),
        }
    }
}

impl From<prometheus::Error> for IpCacheError {
    fn from(err: prometheus::Error) -> Self {
        IpCacheError::Metrics(err.to_string())
    }
}

//------------ AllocatorError ------------------------------------------------

/// Possible errors returned by an identity allocator.
#[derive(Debug, PartialEq, Eq)]
pub enum AllocatorError {
    /// The allocator has not been initialized yet.
    Uninitialized,
    /// The locally scoped identity range is exhausted.
    Exhausted,
}

impl fmt::Display for AllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AllocatorError::Uninitialized => {
                write!(f, "Error: The allocator is uninitialized.")
            }
            AllocatorError::Exhausted => {
                write!(
                    f,
                    "Error: The locally scoped identity range is exhausted."
                )
            }
        }
    }
}

impl std::error::Error for AllocatorError {}

//------------ OverwriteError ------------------------------------------------

/// An upsert into the downstream IPCache table was rejected because the
/// existing entry takes source precedence.
#[derive(Debug, PartialEq, Eq)]
pub struct OverwriteError {
    /// The identity of the entry already in the table.
    pub existing: Identity,
    /// The identity of the rejected entry.
    pub proposed: Identity,
}

impl OverwriteError {
    /// Whether the rejected entry agreed with the table on the numeric
    /// identity. That case means the same fact arrived through two paths
    /// and is harmless; a disagreement may disrupt traffic.
    pub fn identity_unchanged(&self) -> bool {
        self.existing == self.proposed
    }
}

impl fmt::Display for OverwriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Error: Overwrite rejected, the existing entry with identity \
             {} takes precedence over identity {}.",
            self.existing, self.proposed
        )
    }
}

impl std::error::Error for OverwriteError {}
