//! Error taxonomy reported by every management and IKC operation

use crate::hal::TransportError;
use thiserror::Error;

pub const EPERM: i32 = 1;
pub const ENOENT: i32 = 2;
pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const ETIMEDOUT: i32 = 110;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IhkError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("bad address: {0}")]
    Fault(String),
    #[error("resource busy: {0}")]
    ResourceBusy(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("timed out: {0}")]
    TimedOut(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl IhkError {
    /// Negative errno as reported across the management surface
    pub fn errno(&self) -> i32 {
        -match self {
            IhkError::InvalidArgument(_) => EINVAL,
            IhkError::Fault(_) => EFAULT,
            IhkError::ResourceBusy(_) => EBUSY,
            IhkError::NotFound(_) => ENOENT,
            IhkError::PermissionDenied(_) => EPERM,
            IhkError::TimedOut(_) => ETIMEDOUT,
            IhkError::ResourceExhausted(_) => ENOMEM,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        IhkError::InvalidArgument(msg.into())
    }

    pub(crate) fn busy(msg: impl Into<String>) -> Self {
        IhkError::ResourceBusy(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        IhkError::NotFound(msg.into())
    }

    pub(crate) fn fault(msg: impl Into<String>) -> Self {
        IhkError::Fault(msg.into())
    }
}

impl From<TransportError> for IhkError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::OutOfMemory(_) => IhkError::ResourceExhausted(err.to_string()),
            TransportError::Unresponsive(_) => IhkError::TimedOut(err.to_string()),
            TransportError::NoSuchCpu(_) | TransportError::NoHandler(_) => {
                IhkError::InvalidArgument(err.to_string())
            }
            TransportError::Failed(_) => IhkError::ResourceBusy(err.to_string()),
        }
    }
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, IhkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(IhkError::invalid("x").errno(), -22);
        assert_eq!(IhkError::fault("x").errno(), -14);
        assert_eq!(IhkError::busy("x").errno(), -16);
        assert_eq!(IhkError::not_found("x").errno(), -2);
    }

    #[test]
    fn transport_errors_map_to_kinds() {
        let e: IhkError = TransportError::Unresponsive(3).into();
        assert!(matches!(e, IhkError::TimedOut(_)));
        let e: IhkError = TransportError::OutOfMemory(8).into();
        assert!(matches!(e, IhkError::ResourceExhausted(_)));
    }
}
