//! The local account: long-term identity keys, one-time keys, signing.
//!
//! One account per device, created on first use and loaded from the store
//! afterwards. The live `vodozemac` account sits behind a mutex — that is
//! the per-account critical section: key generation, publication marking
//! and inbound session creation all mutate it, and each mutation is
//! re-pickled and persisted before the call returns.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};
use vodozemac::olm::{
    Account, AccountPickle, InboundCreationResult, PreKeyMessage, SessionConfig,
    SessionCreationError,
};
use vodozemac::Curve25519PublicKey;

use lowkey_store::{SessionStore, StoreKey};

use crate::error::CryptoError;
use crate::PickleKey;

/// Public identity keys of the local device, base64-encoded. Immutable
/// for the lifetime of the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKeys {
    /// Curve25519 key, used for session key agreement.
    pub curve25519: String,
    /// Ed25519 key, used for signing.
    pub ed25519: String,
}

pub struct AccountManager {
    store: Arc<dyn SessionStore>,
    pickle_key: Arc<PickleKey>,
    account: Mutex<Account>,
}

impl std::fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountManager").finish_non_exhaustive()
    }
}

impl AccountManager {
    /// Load the account from the store, or create and persist a fresh one
    /// if none exists yet.
    ///
    /// Failure here is fatal for the device: no account means no
    /// cryptographic identity.
    pub fn open(
        store: Arc<dyn SessionStore>,
        pickle_key: Arc<PickleKey>,
    ) -> Result<Self, CryptoError> {
        let blob = store
            .get(&StoreKey::Account)
            .map_err(|e| CryptoError::Configuration(format!("account load failed: {e}")))?;

        let account = match blob {
            Some(blob) => {
                let encrypted = String::from_utf8(blob).map_err(|e| {
                    CryptoError::Configuration(format!("account blob is not UTF-8: {e}"))
                })?;
                let pickle = AccountPickle::from_encrypted(&encrypted, pickle_key.bytes())
                    .map_err(|e| {
                        CryptoError::Configuration(format!("account pickle rejected: {e}"))
                    })?;
                let account = Account::from_pickle(pickle);
                debug!(
                    curve25519 = %account.curve25519_key().to_base64(),
                    "loaded account from store"
                );
                account
            }
            None => {
                let account = Account::new();
                persist(store.as_ref(), &pickle_key, &account)
                    .map_err(|e| CryptoError::Configuration(format!("account create failed: {e}")))?;
                info!(
                    curve25519 = %account.curve25519_key().to_base64(),
                    "created new account"
                );
                account
            }
        };

        Ok(Self {
            store,
            pickle_key,
            account: Mutex::new(account),
        })
    }

    pub fn identity_keys(&self) -> IdentityKeys {
        let account = self.account.lock();
        IdentityKeys {
            curve25519: account.curve25519_key().to_base64(),
            ed25519: account.ed25519_key().to_base64(),
        }
    }

    /// Sign arbitrary bytes with the account's Ed25519 key; returns the
    /// base64-encoded signature.
    pub fn sign(&self, message: &[u8]) -> String {
        self.account.lock().sign(message).to_base64()
    }

    /// Sign the canonical form of a JSON value (see
    /// [`crate::sign::canonical_json`]).
    pub fn sign_json(&self, value: &Value) -> String {
        self.sign(crate::sign::canonical_json(value).as_bytes())
    }

    /// One-time keys awaiting publication, key id to Curve25519 key (both
    /// base64). Keys already marked published are withheld, so repeated
    /// calls between publishes are idempotent.
    pub fn one_time_keys(&self) -> BTreeMap<String, String> {
        self.account
            .lock()
            .one_time_keys()
            .iter()
            .map(|(key_id, key)| (key_id.to_base64(), key.to_base64()))
            .collect()
    }

    /// The primitive library's ceiling on stored one-time keys. A soft
    /// bound: generation past it is allowed but pointless, the oldest
    /// keys get discarded.
    pub fn max_number_of_one_time_keys(&self) -> usize {
        self.account.lock().max_number_of_one_time_keys()
    }

    /// Generate `count` fresh one-time keys and persist the account.
    pub fn generate_one_time_keys(&self, count: usize) -> Result<(), CryptoError> {
        let mut account = self.account.lock();
        account.generate_one_time_keys(count);
        persist(self.store.as_ref(), &self.pickle_key, &account)?;
        debug!(count, unpublished = account.one_time_keys().len(), "generated one-time keys");
        Ok(())
    }

    /// Flip every unpublished one-time key to published and persist.
    ///
    /// Call after a successful upload. At-least-once is fine — an already
    /// published key re-uploaded is harmless; a key marked published but
    /// never uploaded would be unusable, so mark only on success.
    pub fn mark_keys_as_published(&self) -> Result<(), CryptoError> {
        let mut account = self.account.lock();
        account.mark_keys_as_published();
        persist(self.store.as_ref(), &self.pickle_key, &account)?;
        debug!("marked one-time keys as published");
        Ok(())
    }

    /// Start an outbound session towards a remote device. Does not mutate
    /// the account.
    pub(crate) fn create_outbound(
        &self,
        their_identity_key: Curve25519PublicKey,
        their_one_time_key: Curve25519PublicKey,
    ) -> vodozemac::olm::Session {
        self.account.lock().create_outbound_session(
            SessionConfig::version_2(),
            their_identity_key,
            their_one_time_key,
        )
    }

    /// Derive an inbound session from a pre-key message, decrypting it in
    /// the same step. On success the referenced one-time key has been
    /// consumed, so the account is persisted before the session is handed
    /// back — that key must never be usable twice.
    pub(crate) fn create_inbound(
        &self,
        their_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<InboundCreationResult, CryptoError> {
        let mut account = self.account.lock();
        let result = account
            .create_inbound_session(their_identity_key, message)
            .map_err(|e| match e {
                SessionCreationError::MissingOneTimeKey(_) => CryptoError::NoMatchingOneTimeKey,
                other => CryptoError::Decryption(other.to_string()),
            })?;
        persist(self.store.as_ref(), &self.pickle_key, &account)?;
        Ok(result)
    }
}

fn persist(
    store: &dyn SessionStore,
    pickle_key: &PickleKey,
    account: &Account,
) -> Result<(), CryptoError> {
    let encrypted = account.pickle().encrypt(pickle_key.bytes());
    store.put(&StoreKey::Account, encrypted.into_bytes())?;
    Ok(())
}
