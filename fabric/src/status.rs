//! Status codes shared by all fabric operations.
//!
//! Posting operations (`am_short`, `get_zcopy`) return a bare [`Status`]
//! because `NoResource` and `InProgress` are part of their normal protocol,
//! not failures. Fallible constructors return `Result<T, Status>`.

use std::fmt;

/// Operation status reported by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation completed.
    Ok,
    /// Operation was queued; a completion callback will report the outcome.
    InProgress,
    /// The interface is out of posting resources; retry after progress.
    NoResource,
    /// Malformed argument (bad address blob, oversized message, bad key).
    InvalidParam,
    /// A remote access fell outside the registered region.
    OutOfRange,
    /// The endpoint has no resolved peer.
    NotConnected,
    /// The peer address does not resolve to a live interface or endpoint.
    Unreachable,
    /// No such device or protection domain.
    NoDevice,
    /// Resource allocation failed.
    NoMemory,
    /// The transport lacks the capability required for this operation.
    Unsupported,
}

impl Status {
    /// Human-readable status string used in error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "success",
            Status::InProgress => "operation in progress",
            Status::NoResource => "no resources available",
            Status::InvalidParam => "invalid parameter",
            Status::OutOfRange => "address out of range",
            Status::NotConnected => "endpoint not connected",
            Status::Unreachable => "destination unreachable",
            Status::NoDevice => "no such device",
            Status::NoMemory => "out of memory",
            Status::Unsupported => "operation not supported",
        }
    }

    /// True for every status other than `Ok` and `InProgress`.
    pub fn is_error(&self) -> bool {
        !matches!(self, Status::Ok | Status::InProgress)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(!Status::Ok.is_error());
        assert!(!Status::InProgress.is_error());
        assert!(Status::NoResource.is_error());
        assert!(Status::OutOfRange.is_error());
    }
}
