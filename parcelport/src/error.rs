//! Error types for the parcel transport.

use std::fmt;

use fabric::Status;

/// Transport errors.
#[derive(Debug)]
pub enum Error {
    /// A fabric operation reported a fatal status.
    Fabric {
        /// The operation that failed.
        op: &'static str,
        /// The status it reported.
        status: Status,
    },
    /// No protection domain with the configured name is available.
    NoSuchDomain(String),
    /// The configured domain exposes no interfaces covering both the
    /// active-message and the RMA role.
    NoSuitableInterface(String),
    /// Zero-copy chunk transmission is configured but not implemented.
    ZeroCopyUnsupported,
}

impl Error {
    pub(crate) fn fabric(op: &'static str, status: Status) -> Error {
        Error::Fabric { op, status }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Fabric { op, status } => write!(f, "{}: {}", op, status.as_str()),
            Error::NoSuchDomain(domain) => write!(f, "no such protection domain: {}", domain),
            Error::NoSuitableInterface(domain) => {
                write!(f, "no suitable interface on domain {}", domain)
            }
            Error::ZeroCopyUnsupported => {
                write!(f, "zero_copy_optimization is not supported")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
