use thiserror::Error;

use crate::snapshot::SnapshotError;

pub type KernelResult<T> = Result<T, KernelError>;

/// Errors surfaced to userland through the syscall interface.
///
/// Every subsystem returns these without leaving partial state behind; the
/// dispatcher hands them back to the calling process untouched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KernelError {
    #[error("ENOENT: no such file or directory: {0}")]
    NotFound(String),
    #[error("EEXIST: file exists: {0}")]
    AlreadyExists(String),
    #[error("EISDIR: is a directory: {0}")]
    IsDirectory(String),
    #[error("ENOTDIR: not a directory: {0}")]
    NotDirectory(String),
    #[error("ENOTEMPTY: directory not empty: {0}")]
    NotEmpty(String),
    #[error("EACCES: permission denied: {0}")]
    PermissionDenied(String),
    #[error("EBADF: bad descriptor {0}")]
    BadDescriptor(u64),
    #[error("EINVAL: {0}")]
    InvalidArgument(String),
    #[error("ENODEV: no such interface: {0}")]
    NoDevice(String),
    #[error("ENETDOWN: interface {0} is down")]
    NetworkDown(String),
    #[error("EADDRINUSE: port {0} already in use")]
    AddressInUse(u16),
    #[error("EHOSTUNREACH: no route to {0}")]
    HostUnreachable(String),
    #[error("syscall not permitted: {0}")]
    SyscallNotPermitted(String),
    #[error("unknown syscall: {0}")]
    UnknownSyscall(String),
    #[error("invalid process {0}")]
    InvalidProcess(u32),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error("store failure: {0}")]
    Store(String),
}

impl KernelError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// POSIX-style code used when userland renders the failure.
    pub fn errno_name(&self) -> &'static str {
        match self {
            KernelError::NotFound(_) => "ENOENT",
            KernelError::AlreadyExists(_) => "EEXIST",
            KernelError::IsDirectory(_) => "EISDIR",
            KernelError::NotDirectory(_) => "ENOTDIR",
            KernelError::NotEmpty(_) => "ENOTEMPTY",
            KernelError::PermissionDenied(_) => "EACCES",
            KernelError::BadDescriptor(_) => "EBADF",
            KernelError::InvalidArgument(_) => "EINVAL",
            KernelError::NoDevice(_) => "ENODEV",
            KernelError::NetworkDown(_) => "ENETDOWN",
            KernelError::AddressInUse(_) => "EADDRINUSE",
            KernelError::HostUnreachable(_) => "EHOSTUNREACH",
            KernelError::SyscallNotPermitted(_) => "EPERM",
            KernelError::UnknownSyscall(_) => "ENOSYS",
            KernelError::InvalidProcess(_) => "ESRCH",
            KernelError::Snapshot(_) => "EIO",
            KernelError::Store(_) => "EIO",
        }
    }

    /// Invalid-process errors abort the caller instead of being reported to it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KernelError::InvalidProcess(_))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "errno": self.errno_name(),
            "message": self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_names_match_posix_codes() {
        assert_eq!(KernelError::NotFound("/x".into()).errno_name(), "ENOENT");
        assert_eq!(KernelError::NotEmpty("/d".into()).errno_name(), "ENOTEMPTY");
        assert_eq!(
            KernelError::SyscallNotPermitted("write".into()).errno_name(),
            "EPERM"
        );
    }

    #[test]
    fn only_invalid_process_is_fatal() {
        assert!(KernelError::InvalidProcess(9).is_fatal());
        assert!(!KernelError::PermissionDenied("/etc".into()).is_fatal());
    }

    #[test]
    fn json_payload_carries_errno_and_message() {
        let json = KernelError::AddressInUse(8080).to_json();
        assert_eq!(json["errno"], "EADDRINUSE");
        assert!(json["message"].as_str().unwrap().contains("8080"));
    }
}
