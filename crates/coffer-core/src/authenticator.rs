//! Vault authentication: the biometric and password paths to a usable
//! master key, plus vault setup and password change.
//!
//! Biometrics bind to the master key, not the password: the gated slot
//! holds the raw key, so rotating the password never touches it.

use std::sync::Arc;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{self, MasterKey};
use crate::error::{CofferError, Result};
use crate::secret_store::{AccessPolicy, AuthContext, CredentialStore, SecretSlot};

/// Why a biometric policy evaluation did not produce a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BiometricFailure {
    UserCancel,
    AppCancel,
    SystemCancel,
    NotAvailable,
    NotEnrolled,
    Other(String),
}

pub trait BiometricEvaluator: Send + Sync {
    /// Whether the device currently offers biometric evaluation. Sampled by
    /// the authenticator at construction; re-probe after device
    /// configuration changes by constructing a fresh authenticator.
    fn available(&self) -> bool;

    /// Drive the platform prompt with a localized reason.
    fn evaluate(&self, reason: &str) -> std::result::Result<AuthContext, BiometricFailure>;
}

/// Evaluator for builds without a platform biometric shell attached.
pub struct UnsupportedEvaluator;

impl BiometricEvaluator for UnsupportedEvaluator {
    fn available(&self) -> bool {
        false
    }

    fn evaluate(&self, _reason: &str) -> std::result::Result<AuthContext, BiometricFailure> {
        Err(BiometricFailure::NotAvailable)
    }
}

pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    evaluator: Arc<dyn BiometricEvaluator>,
    biometrics_available: bool,
}

impl Authenticator {
    pub fn new(store: Arc<dyn CredentialStore>, evaluator: Arc<dyn BiometricEvaluator>) -> Self {
        let biometrics_available = evaluator.available();
        Self {
            store,
            evaluator,
            biometrics_available,
        }
    }

    pub fn biometrics_available(&self) -> bool {
        self.biometrics_available
    }

    /// Evaluate the biometric policy, then read the gated master-key slot
    /// with the authenticated context so the OS does not re-prompt.
    pub fn unlock_with_biometrics(&self, vault_id: Uuid, vault_name: &str) -> Result<MasterKey> {
        let reason = format!("unlock the vault \u{201c}{vault_name}\u{201d}");
        let context = self.evaluator.evaluate(&reason).map_err(|failure| match failure {
            BiometricFailure::NotAvailable | BiometricFailure::NotEnrolled => {
                CofferError::BiometricsUnavailable
            }
            BiometricFailure::UserCancel
            | BiometricFailure::AppCancel
            | BiometricFailure::SystemCancel
            | BiometricFailure::Other(_) => CofferError::AuthenticationFailed,
        })?;
        let raw = Zeroizing::new(self.store.retrieve(
            SecretSlot::MasterKey,
            vault_id,
            Some(&context),
        )?);
        MasterKey::try_from_slice(&raw)
    }

    /// Derive the wrapping key from the password and unwrap the stored
    /// master key. Any unwrap failure is `WrongPassword`; the caller cannot
    /// tell which step rejected.
    pub fn unlock_with_password(&self, password: &str, vault_id: Uuid) -> Result<MasterKey> {
        let salt = Zeroizing::new(self.store.retrieve(SecretSlot::Salt, vault_id, None)?);
        let wrapped = self
            .store
            .retrieve(SecretSlot::WrappedMasterKey, vault_id, None)?;
        let wrapping = crypto::derive_wrapping_key(password, &salt);
        crypto::unwrap_master_key(&wrapped, &wrapping)
    }

    /// Provision the secret-store slots for a new vault and return the
    /// master key so the caller can proceed directly to an immediate lock.
    pub fn setup_vault(
        &self,
        vault_id: Uuid,
        password: &str,
        enable_biometric: bool,
    ) -> Result<MasterKey> {
        let master = crypto::generate_master_key();
        let salt = crypto::generate_salt();
        let wrapping = crypto::derive_wrapping_key(password, &salt);
        let wrapped = crypto::wrap_master_key(&master, &wrapping)?;

        self.store
            .store(SecretSlot::Salt, vault_id, &salt, AccessPolicy::DeviceUnlocked)?;
        self.store.store(
            SecretSlot::WrappedMasterKey,
            vault_id,
            &wrapped,
            AccessPolicy::DeviceUnlocked,
        )?;
        if enable_biometric && self.biometrics_available {
            self.store.store(
                SecretSlot::MasterKey,
                vault_id,
                master.as_bytes(),
                AccessPolicy::BiometricCurrentSet,
            )?;
        }
        Ok(master)
    }

    /// Rewrap the existing master key under a new salt and password. The
    /// biometric slot is untouched.
    pub fn change_password(&self, vault_id: Uuid, current: &str, new: &str) -> Result<()> {
        let master = self.unlock_with_password(current, vault_id)?;
        let salt = crypto::generate_salt();
        let wrapping = crypto::derive_wrapping_key(new, &salt);
        let wrapped = crypto::wrap_master_key(&master, &wrapping)?;

        self.store
            .store(SecretSlot::Salt, vault_id, &salt, AccessPolicy::DeviceUnlocked)?;
        self.store.store(
            SecretSlot::WrappedMasterKey,
            vault_id,
            &wrapped,
            AccessPolicy::DeviceUnlocked,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_store::MemoryCredentialStore;

    struct ApprovingEvaluator;

    impl BiometricEvaluator for ApprovingEvaluator {
        fn available(&self) -> bool {
            true
        }

        fn evaluate(&self, _reason: &str) -> std::result::Result<AuthContext, BiometricFailure> {
            Ok(AuthContext::from_token(1))
        }
    }

    struct CancellingEvaluator;

    impl BiometricEvaluator for CancellingEvaluator {
        fn available(&self) -> bool {
            true
        }

        fn evaluate(&self, _reason: &str) -> std::result::Result<AuthContext, BiometricFailure> {
            Err(BiometricFailure::UserCancel)
        }
    }

    fn authenticator(evaluator: impl BiometricEvaluator + 'static) -> Authenticator {
        Authenticator::new(
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(evaluator),
        )
    }

    #[test]
    fn setup_then_password_unlock() {
        let auth = authenticator(ApprovingEvaluator);
        let id = Uuid::new_v4();
        let master = auth.setup_vault(id, "pw", false).unwrap();

        let unlocked = auth.unlock_with_password("pw", id).unwrap();
        assert_eq!(unlocked.as_bytes(), master.as_bytes());

        assert!(matches!(
            auth.unlock_with_password("nope", id),
            Err(CofferError::WrongPassword)
        ));
    }

    #[test]
    fn setup_with_biometrics_stores_gated_key() {
        let auth = authenticator(ApprovingEvaluator);
        let id = Uuid::new_v4();
        let master = auth.setup_vault(id, "pw", true).unwrap();

        let unlocked = auth.unlock_with_biometrics(id, "Docs").unwrap();
        assert_eq!(unlocked.as_bytes(), master.as_bytes());
    }

    #[test]
    fn setup_without_biometric_support_skips_gated_slot() {
        let auth = authenticator(UnsupportedEvaluator);
        let id = Uuid::new_v4();
        auth.setup_vault(id, "pw", true).unwrap();

        assert!(matches!(
            auth.unlock_with_biometrics(id, "Docs"),
            Err(CofferError::BiometricsUnavailable)
        ));
        // The password path is unaffected.
        auth.unlock_with_password("pw", id).unwrap();
    }

    #[test]
    fn cancelled_prompt_is_authentication_failed() {
        let auth = authenticator(CancellingEvaluator);
        let id = Uuid::new_v4();
        auth.setup_vault(id, "pw", true).unwrap();

        assert!(matches!(
            auth.unlock_with_biometrics(id, "Docs"),
            Err(CofferError::AuthenticationFailed)
        ));
    }

    #[test]
    fn change_password_preserves_master_key_and_biometric_slot() {
        let auth = authenticator(ApprovingEvaluator);
        let id = Uuid::new_v4();
        let master = auth.setup_vault(id, "pw", true).unwrap();

        auth.change_password(id, "pw", "pw2").unwrap();

        assert!(matches!(
            auth.unlock_with_password("pw", id),
            Err(CofferError::WrongPassword)
        ));
        let unlocked = auth.unlock_with_password("pw2", id).unwrap();
        assert_eq!(unlocked.as_bytes(), master.as_bytes());

        let via_biometrics = auth.unlock_with_biometrics(id, "Docs").unwrap();
        assert_eq!(via_biometrics.as_bytes(), master.as_bytes());
    }

    #[test]
    fn change_password_rejects_wrong_current() {
        let auth = authenticator(ApprovingEvaluator);
        let id = Uuid::new_v4();
        auth.setup_vault(id, "pw", false).unwrap();

        assert!(matches!(
            auth.change_password(id, "bad", "pw2"),
            Err(CofferError::WrongPassword)
        ));
        auth.unlock_with_password("pw", id).unwrap();
    }
}
