//! Failure classes reported by the dispatcher.

use std::fmt;

/// Coarse classification of a failed invocation.
///
/// Every class leaves the message offset unacknowledged; the class only
/// tells an operator where to look.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No IP range or VM process available.
    ResourceExhaustion,
    /// VM disk, kernel or network setup failed; the VM was destroyed.
    ConfigurationFailure,
    /// Download, control socket or broker I/O failed.
    TransientIo,
    /// Offsets submitted out of order. Indicates an upstream bug.
    OrderingViolation,
    /// Message or VM output could not be understood.
    ProtocolMismatch,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::ConfigurationFailure => "configuration_failure",
            Self::TransientIo => "transient_io",
            Self::OrderingViolation => "ordering_violation",
            Self::ProtocolMismatch => "protocol_mismatch",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
