//! lowkey_store — persistence contract for the Lowkey E2EE session layer
//!
//! The session layer keeps all of its durable state as passphrase-pickled
//! blobs: one for the local account, one per pairwise session, one per
//! outbound group session. This crate owns the contract those blobs are
//! stored through, nothing else — blob contents are produced and consumed
//! exclusively by the crypto layer and are opaque here.
//!
//! # Contract
//! - Every `get`/`put`/`delete` is atomic with respect to the same key.
//!   A read-modify-write cycle against a session blob is serialized by the
//!   *caller* (the session layer holds a per-session lock across it); the
//!   store only has to guarantee it never tears a single value.
//! - `session_ids` enumerates the pairwise sessions stored for one remote
//!   identity key, in no particular order. Callers that need a stable
//!   order sort on their own metadata.
//!
//! Durable backends (SQLite, sled, OS keychain, ...) live outside this
//! core. `MemoryStore` is the reference backend and what the test suites
//! run against.

pub mod error;
pub mod memory;

pub use error::StoreError;
pub use memory::MemoryStore;

use std::fmt;

/// Namespaced location of one pickled blob.
///
/// Pairwise sessions are scoped by the remote device's Curve25519 identity
/// key so that one device can hold several concurrent sessions with the
/// same peer (races, multi-device) without collisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// The single local account blob.
    Account,
    /// One pairwise ratchet session.
    Session {
        /// Remote device Curve25519 identity key (base64).
        remote_identity_key: String,
        /// Session id, unique within the scope of the remote key.
        session_id: String,
    },
    /// One outbound group (broadcast) session.
    GroupSession { session_id: String },
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::Account => write!(f, "account"),
            StoreKey::Session { remote_identity_key, session_id } => {
                write!(f, "session/{remote_identity_key}/{session_id}")
            }
            StoreKey::GroupSession { session_id } => write!(f, "group/{session_id}"),
        }
    }
}

/// Durable key-value store for pickled cryptographic state.
pub trait SessionStore: Send + Sync {
    /// Fetch the blob at `key`, or `None` if nothing is stored there.
    fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `value` at `key`, replacing any previous value atomically.
    fn put(&self, key: &StoreKey, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove the blob at `key`. Removing an absent key is not an error.
    fn delete(&self, key: &StoreKey) -> Result<(), StoreError>;

    /// All session ids currently stored for `remote_identity_key`.
    fn session_ids(&self, remote_identity_key: &str) -> Result<Vec<String>, StoreError>;
}
