use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Status carried by credential-store failures. `NotFound` is the one
/// callers branch on: a missing entry is an error, never an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreStatus {
    NotFound,
    AccessDenied,
    Backend(String),
}

impl std::fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreStatus::NotFound => write!(f, "not found"),
            StoreStatus::AccessDenied => write!(f, "access denied"),
            StoreStatus::Backend(msg) => write!(f, "{msg}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CofferError {
    #[error("wrong password")]
    WrongPassword,

    #[error("biometric authentication failed")]
    AuthenticationFailed,

    #[error("biometrics are not available on this device")]
    BiometricsUnavailable,

    #[error("no vault with id {0}")]
    VaultNotFound(Uuid),

    #[error("a vault already covers {0}")]
    VaultAlreadyExists(PathBuf),

    #[error("{} file(s) are held open by other processes", .0.len())]
    FilesInUse(Vec<PathBuf>),

    #[error("manifest corrupted: {0}")]
    ManifestCorrupted(String),

    #[error("encrypted file missing: {0}")]
    EncryptedFileMissing(String),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed (malformed blob or authentication tag mismatch)")]
    DecryptionFailed,

    #[error("secret store write failed: {0}")]
    StoreWriteFailed(StoreStatus),

    #[error("secret store read failed: {0}")]
    StoreReadFailed(StoreStatus),

    #[error("secret store delete failed: {0}")]
    StoreDeleteFailed(StoreStatus),

    #[error("insufficient disk space")]
    InsufficientDiskSpace,

    #[error("cannot enumerate directory: {0}")]
    CannotEnumerateDirectory(String),

    #[error("vault is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialisation error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CofferError>;

/// A full disk is its own error kind; everything else stays an I/O error.
pub(crate) fn map_write_err(err: std::io::Error) -> CofferError {
    if err.kind() == std::io::ErrorKind::StorageFull {
        CofferError::InsufficientDiskSpace
    } else {
        CofferError::Io(err)
    }
}
