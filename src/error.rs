//! Error taxonomy shared by the snapshot controller and the orchestrator.
//!
//! `HypervisorError` carries a libvirt-style error code so callers can decide
//! which failures are expected (and silenced) while probing. `BackupError`
//! holds the run-aborting conditions; anything disk-scoped is recorded on the
//! [`Disk`](crate::disk::Disk) instead of being raised.

use thiserror::Error;

/// libvirt error codes the backup cares about.
///
/// Numbers match `virErrorNumber` so log lines stay comparable with the ones
/// libvirt's own clients print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Internal,
    OperationFailed,
    NoDomain,
    OperationInvalid,
    ArgumentUnsupported,
    AgentUnresponsive,
}

impl ErrorCode {
    pub fn number(self) -> i32 {
        match self {
            ErrorCode::Internal => 1,
            ErrorCode::OperationFailed => 9,
            ErrorCode::NoDomain => 42,
            ErrorCode::OperationInvalid => 55,
            ErrorCode::ArgumentUnsupported => 67,
            ErrorCode::AgentUnresponsive => 86,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("libvirt: error code {}: {}", .code.number(), .message)]
pub struct HypervisorError {
    pub code: ErrorCode,
    pub message: String,
}

impl HypervisorError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("domain '{0}' not found")]
    DomainNotFound(String),

    #[error("domain has no disks(!)")]
    DomainHasNoDisks,

    #[error("some disks to be backed up don't exist on the domain: {}", .0.join(" "))]
    UnknownDisks(Vec<String>),

    #[error("failed to create domain snapshot: {0}")]
    SnapshotFailed(#[source] HypervisorError),

    #[error("unreadable domain description: {0}")]
    DomainXml(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("interrupted")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hypervisor_error_formats_like_libvirt() {
        let err = HypervisorError::new(ErrorCode::OperationInvalid, "domain is not running");
        assert_eq!(err.to_string(), "libvirt: error code 55: domain is not running");
    }

    #[test]
    fn unknown_disks_lists_names() {
        let err = BackupError::UnknownDisks(vec!["sdc".into(), "sdd".into()]);
        assert!(err.to_string().ends_with("sdc sdd"));
    }
}
