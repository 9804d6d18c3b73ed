//! Coffer vault engine: in-place folder encryption behind a two-layer key
//! hierarchy, with a crash-recoverable manifest and an OS credential store.
//!
//! The engine is UI-free. Shells (menubar app, CLI, test harness) drive the
//! public operations of [`manager::VaultManager`] and render state and
//! progress; platform capabilities arrive through the
//! [`authenticator::BiometricEvaluator`], [`secret_store::CredentialStore`]
//! and [`handles::OpenHandleProbe`] seams.

pub mod authenticator;
pub mod config;
pub mod crypto;
pub mod error;
mod fs_atomic;
pub mod handles;
pub mod manager;
pub mod manifest;
pub mod paths;
pub mod pipeline;
pub mod secret_store;
pub mod vault;

pub use error::{CofferError, Result, StoreStatus};
pub use manager::VaultManager;
pub use vault::{GlobalSettings, Vault, VaultConfig, VaultState};
