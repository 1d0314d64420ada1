//! Error types for netlink operations.

use std::io;

/// Result type for netlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during netlink operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Kernel returned an error code.
    #[error("kernel error: {message} (errno {errno})")]
    Kernel {
        /// The errno value from the kernel.
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Socket is in the wrong state: connecting twice, or configuring a
    /// kernel option on a closed descriptor.
    #[error("invalid socket state")]
    BadSocket,

    /// Kernel returned an address of unexpected size.
    #[error("no or invalid netlink address returned by kernel")]
    NoAddress,

    /// The bound socket does not belong to the netlink family.
    #[error("address family not supported")]
    AfNotSupported,

    /// Message was truncated.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// Sequence number mismatch.
    #[error("sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch {
        /// Expected sequence number.
        expected: u32,
        /// Actual sequence number received.
        actual: u32,
    },

    /// Kernel reported lost data (NLMSG_OVERRUN).
    #[error("message overflow, data lost")]
    Overflow,

    /// A dump was restarted by the kernel, returned data is inconsistent.
    #[error("dump interrupted, inconsistent data returned")]
    DumpInterrupted,

    /// Invalid message format.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Invalid attribute format.
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),

    /// No answer was picked up from the reply stream.
    #[error("no answer received")]
    NoAnswer,
}

impl Error {
    /// Create a kernel error from an errno value as reported on the wire
    /// (negative, the way error records carry it).
    pub fn from_errno(errno: i32) -> Self {
        let message = io::Error::from_raw_os_error(-errno).to_string();
        Self::Kernel {
            errno: -errno,
            message,
        }
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// Check if this is a "not found" error (ENOENT, ENODEV).
    pub fn is_not_found(&self) -> bool {
        matches!(self.errno(), Some(2) | Some(19))
    }

    /// Check if this is a permission error (EPERM, EACCES).
    pub fn is_permission_denied(&self) -> bool {
        matches!(self.errno(), Some(1) | Some(13))
    }
}
