//! Per-vault secret persistence.
//!
//! Three slots per vault identifier, keyed under the service namespace
//! `com.loganross.coffer`:
//!
//! | slot               | account                  | access policy        |
//! |--------------------|--------------------------|----------------------|
//! | master key         | `masterKey.<uuid>`       | biometric-gated      |
//! | salt               | `salt.<uuid>`            | device-unlocked      |
//! | wrapped master key | `masterKey.wrapped.<uuid>` | device-unlocked    |
//!
//! Whenever a vault exists in the config, the salt and wrapped-master-key
//! slots exist here; the raw master-key slot exists iff the vault's
//! biometric flag is set.

use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{CofferError, Result, StoreStatus};

pub const SERVICE_NAME: &str = "com.loganross.coffer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretSlot {
    MasterKey,
    Salt,
    WrappedMasterKey,
}

impl SecretSlot {
    pub const ALL: [SecretSlot; 3] = [
        SecretSlot::MasterKey,
        SecretSlot::Salt,
        SecretSlot::WrappedMasterKey,
    ];

    pub fn account(&self, vault_id: Uuid) -> String {
        match self {
            SecretSlot::MasterKey => format!("masterKey.{vault_id}"),
            SecretSlot::Salt => format!("salt.{vault_id}"),
            SecretSlot::WrappedMasterKey => format!("masterKey.wrapped.{vault_id}"),
        }
    }
}

/// Access control requested for a slot at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicy {
    /// Requires the currently enrolled biometric set, device unlocked, this
    /// device only. Rotating the enrolled biometrics invalidates the entry;
    /// an invalidated entry reads as absent.
    BiometricCurrentSet,
    /// Device unlocked, this device only. No biometric gating.
    DeviceUnlocked,
}

/// Opaque proof of a prior successful biometric policy evaluation. Passing
/// it to a gated read suppresses the system prompt.
#[derive(Debug, Clone)]
pub struct AuthContext {
    token: u64,
}

impl AuthContext {
    /// Wrap a platform evaluation token. Only evaluators mint these.
    pub fn from_token(token: u64) -> Self {
        Self { token }
    }

    pub fn token(&self) -> u64 {
        self.token
    }
}

pub trait CredentialStore: Send + Sync {
    /// Upsert: an existing entry at the same key is deleted first, then the
    /// new value inserted.
    fn store(
        &self,
        slot: SecretSlot,
        vault_id: Uuid,
        value: &[u8],
        policy: AccessPolicy,
    ) -> Result<()>;

    /// A missing entry is `StoreReadFailed(NotFound)`, not an empty value.
    /// With a context from a prior biometric evaluation the store must not
    /// re-prompt; without one, a gated read may trigger a system prompt.
    fn retrieve(
        &self,
        slot: SecretSlot,
        vault_id: Uuid,
        context: Option<&AuthContext>,
    ) -> Result<Vec<u8>>;

    fn delete(&self, slot: SecretSlot, vault_id: Uuid) -> Result<()>;

    /// Vault identifiers with at least one stored slot. Backends that cannot
    /// enumerate their entries return an empty list, which turns the
    /// orphaned-secret sweep into a no-op.
    fn list_vault_ids(&self) -> Result<Vec<Uuid>> {
        Ok(Vec::new())
    }

    /// Remove all three slots for a vault, tolerating per-slot "not found".
    fn delete_all(&self, vault_id: Uuid) -> Result<()> {
        for slot in SecretSlot::ALL {
            match self.delete(slot, vault_id) {
                Ok(()) => {}
                Err(CofferError::StoreDeleteFailed(StoreStatus::NotFound)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

// ── OS keychain backend ─────────────────────────────────────────────────────

/// Credential store backed by the OS keychain.
///
/// The portable keyring backend cannot express a "current biometric set"
/// access-control list, so `BiometricCurrentSet` degrades to device-unlocked
/// storage here. Platform shells that can set the real policy (macOS
/// Keychain with Touch ID access control) substitute their own
/// [`CredentialStore`] implementation.
pub struct KeyringStore;

impl KeyringStore {
    fn entry(slot: SecretSlot, vault_id: Uuid) -> std::result::Result<Entry, StoreStatus> {
        Entry::new(SERVICE_NAME, &slot.account(vault_id)).map_err(Self::status)
    }

    fn status(err: keyring::Error) -> StoreStatus {
        match err {
            keyring::Error::NoEntry => StoreStatus::NotFound,
            other => StoreStatus::Backend(other.to_string()),
        }
    }
}

impl CredentialStore for KeyringStore {
    fn store(
        &self,
        slot: SecretSlot,
        vault_id: Uuid,
        value: &[u8],
        _policy: AccessPolicy,
    ) -> Result<()> {
        let entry = Self::entry(slot, vault_id).map_err(CofferError::StoreWriteFailed)?;
        // Upsert: drop any stale entry before inserting.
        match entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(CofferError::StoreWriteFailed(Self::status(e))),
        }
        let encoded = general_purpose::STANDARD.encode(value);
        entry
            .set_password(&encoded)
            .map_err(|e| CofferError::StoreWriteFailed(Self::status(e)))
    }

    fn retrieve(
        &self,
        slot: SecretSlot,
        vault_id: Uuid,
        _context: Option<&AuthContext>,
    ) -> Result<Vec<u8>> {
        let entry = Self::entry(slot, vault_id).map_err(CofferError::StoreReadFailed)?;
        let encoded = entry
            .get_password()
            .map_err(|e| CofferError::StoreReadFailed(Self::status(e)))?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CofferError::StoreReadFailed(StoreStatus::Backend(e.to_string())))
    }

    fn delete(&self, slot: SecretSlot, vault_id: Uuid) -> Result<()> {
        let entry = Self::entry(slot, vault_id).map_err(CofferError::StoreDeleteFailed)?;
        entry
            .delete_password()
            .map_err(|e| CofferError::StoreDeleteFailed(Self::status(e)))
    }
}

// ── In-memory backend ───────────────────────────────────────────────────────

struct StoredSecret {
    value: Vec<u8>,
    policy: AccessPolicy,
    invalidated: bool,
}

/// In-memory store for tests and headless harnesses.
///
/// Honours the access policy: [`simulate_biometric_reset`] marks every
/// biometric-gated entry invalidated, after which it reads as absent —
/// matching an OS keychain discarding entries when the enrolled biometric
/// set changes. Ungated slots are unaffected.
///
/// [`simulate_biometric_reset`]: MemoryCredentialStore::simulate_biometric_reset
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<(SecretSlot, Uuid), StoredSecret>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn simulate_biometric_reset(&self) {
        let mut entries = self.entries.lock();
        for secret in entries.values_mut() {
            if secret.policy == AccessPolicy::BiometricCurrentSet {
                secret.invalidated = true;
            }
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn store(
        &self,
        slot: SecretSlot,
        vault_id: Uuid,
        value: &[u8],
        policy: AccessPolicy,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(
            (slot, vault_id),
            StoredSecret {
                value: value.to_vec(),
                policy,
                invalidated: false,
            },
        );
        Ok(())
    }

    fn retrieve(
        &self,
        slot: SecretSlot,
        vault_id: Uuid,
        _context: Option<&AuthContext>,
    ) -> Result<Vec<u8>> {
        let entries = self.entries.lock();
        match entries.get(&(slot, vault_id)) {
            Some(secret) if secret.invalidated => {
                Err(CofferError::StoreReadFailed(StoreStatus::NotFound))
            }
            Some(secret) => Ok(secret.value.clone()),
            None => Err(CofferError::StoreReadFailed(StoreStatus::NotFound)),
        }
    }

    fn delete(&self, slot: SecretSlot, vault_id: Uuid) -> Result<()> {
        let mut entries = self.entries.lock();
        entries
            .remove(&(slot, vault_id))
            .map(|_| ())
            .ok_or(CofferError::StoreDeleteFailed(StoreStatus::NotFound))
    }

    fn list_vault_ids(&self) -> Result<Vec<Uuid>> {
        let entries = self.entries.lock();
        let mut ids: Vec<Uuid> = entries.keys().map(|(_, id)| *id).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
