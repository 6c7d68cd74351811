// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error types for the service provider core

use thiserror::Error;

use crate::constants::TpmOrd;
use crate::types::{KeyUuid, LoadAuthChallenge, PsType};

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of every error the core can return.
///
/// Callers branch on the kind; the variant carries the detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or contradictory input, caught before any device interaction
    BadParameter,
    /// Reference to a nonexistent or wrong-kind object
    InvalidHandle,
    /// A persistent identifier is already bound
    AlreadyRegistered,
    /// No free family slot, or table row in use without overwrite permission
    ResourceExhausted,
    /// A secret is needed that the caller has not supplied yet
    AuthorizationRequired,
    /// Transport log digest disagrees with the device record
    IntegrityFailure,
    /// Failure reported by (or while talking to) the device
    DeviceError,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad parameter: {0}")]
    BadParameter(String),
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("key {uuid} is not loaded")]
    NotLoaded { uuid: String },
    #[error("key {uuid} is not registered in {ps} storage")]
    NotRegistered { ps: PsType, uuid: KeyUuid },
    #[error("key {uuid} is already registered in {ps} storage")]
    AlreadyRegistered { ps: PsType, uuid: KeyUuid },
    #[error("key hierarchy loops back to {uuid}")]
    HierarchyCycle { uuid: KeyUuid },
    #[error("no free delegation family slot")]
    NoFreeFamilySlot,
    #[error("delegation table row {row} is occupied")]
    RowOccupied { row: u32 },
    #[error("authorization required: {0}")]
    AuthorizationRequired(LoadAuthChallenge),
    #[error("owner authorization secret has not been set")]
    OwnerAuthRequired,
    #[error("transport session {session} is finalized")]
    SessionFinalized { session: String },
    #[error("transport log digest mismatch: host {expected}, device {actual}")]
    IntegrityFailure { expected: String, actual: String },
    #[error("{ordinal:?} failed with TPM error: 0x{code:08x}")]
    Device { ordinal: TpmOrd, code: u32 },
    #[error("malformed TPM response: {0}")]
    Protocol(String),
    #[error("persistent storage: {0}")]
    Storage(String),
    #[error("device i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadParameter(_)
            | Error::HierarchyCycle { .. }
            | Error::SessionFinalized { .. } => ErrorKind::BadParameter,
            Error::InvalidHandle(_) | Error::NotLoaded { .. } | Error::NotRegistered { .. } => {
                ErrorKind::InvalidHandle
            }
            Error::AlreadyRegistered { .. } => ErrorKind::AlreadyRegistered,
            Error::NoFreeFamilySlot | Error::RowOccupied { .. } => ErrorKind::ResourceExhausted,
            Error::AuthorizationRequired(_) | Error::OwnerAuthRequired => {
                ErrorKind::AuthorizationRequired
            }
            Error::IntegrityFailure { .. } => ErrorKind::IntegrityFailure,
            Error::Device { .. } | Error::Protocol(_) | Error::Storage(_) | Error::Io(_) => {
                ErrorKind::DeviceError
            }
        }
    }

    /// The device response code, when the error came from the device.
    pub fn code(&self) -> Option<u32> {
        match self {
            Error::Device { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn bad_parameter(msg: impl Into<String>) -> Self {
        Error::BadParameter(msg.into())
    }

    pub(crate) fn invalid_handle(msg: impl Into<String>) -> Self {
        Error::InvalidHandle(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_code_preserved() {
        let err = Error::Device {
            ordinal: TpmOrd::LoadKey2,
            code: 0x0000_0021,
        };
        assert_eq!(err.kind(), ErrorKind::DeviceError);
        assert_eq!(err.code(), Some(0x21));
        assert_eq!(err.to_string(), "LoadKey2 failed with TPM error: 0x00000021");
    }

    #[test]
    fn test_recoverable_kinds() {
        let dup = Error::AlreadyRegistered {
            ps: PsType::System,
            uuid: KeyUuid::SRK,
        };
        assert_eq!(dup.kind(), ErrorKind::AlreadyRegistered);
        assert_eq!(Error::RowOccupied { row: 0 }.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(Error::OwnerAuthRequired.kind(), ErrorKind::AuthorizationRequired);
        assert!(Error::NoFreeFamilySlot.code().is_none());
    }
}
