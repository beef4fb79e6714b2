//! Outbound group sessions for broadcast encryption.
//!
//! A group session is a sender-side ratchet whose session key is shared
//! with each recipient over a pairwise session; recipients then decrypt
//! broadcast ciphertext without per-recipient encryption work. This
//! module owns the sender side only. The same persistence rule as
//! pairwise sessions applies: every ratchet step is re-pickled and
//! stored before the call returns.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vodozemac::megolm::{GroupSession, GroupSessionPickle, SessionConfig};

use lowkey_store::{SessionStore, StoreKey};

use crate::error::CryptoError;
use crate::PickleKey;

#[derive(Serialize, Deserialize)]
struct GroupSessionRecord {
    session_id: String,
    pickle: String,
    created_at: DateTime<Utc>,
}

pub struct GroupSessionManager {
    store: Arc<dyn SessionStore>,
    pickle_key: Arc<PickleKey>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GroupSessionManager {
    pub fn new(store: Arc<dyn SessionStore>, pickle_key: Arc<PickleKey>) -> Self {
        Self {
            store,
            pickle_key,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Create a fresh outbound group session and persist it; returns its
    /// session id. The caller distributes
    /// [`session_key`](Self::session_key) to recipients out of band.
    pub fn create_outbound_group_session(&self) -> Result<String, CryptoError> {
        let session = GroupSession::new(SessionConfig::version_1());
        let session_id = session.session_id();

        let record = GroupSessionRecord {
            session_id: session_id.clone(),
            pickle: session.pickle().encrypt(self.pickle_key.bytes()),
            created_at: Utc::now(),
        };

        let lock = self.session_lock(&session_id);
        let _guard = lock.lock();
        self.store_record(&record)?;

        info!(session_id = %session_id, "created outbound group session");
        Ok(session_id)
    }

    /// The exportable session key at the session's current ratchet
    /// position. A recipient joining from this key sees messages from the
    /// current index onward, nothing earlier.
    pub fn session_key(&self, session_id: &str) -> Result<String, CryptoError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock();

        let session = self.unpickle(&self.load_record(session_id)?)?;
        Ok(session.session_key().to_base64())
    }

    /// Current ratchet index; equals the number of messages encrypted so
    /// far on this session.
    pub fn message_index(&self, session_id: &str) -> Result<u32, CryptoError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock();

        let session = self.unpickle(&self.load_record(session_id)?)?;
        Ok(session.message_index())
    }

    /// Encrypt one broadcast message, advancing the ratchet.
    pub fn encrypt(&self, session_id: &str, plaintext: &[u8]) -> Result<String, CryptoError> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock();

        let mut record = self.load_record(session_id)?;
        let mut session = self.unpickle(&record)?;

        let message = session.encrypt(plaintext);
        record.pickle = session.pickle().encrypt(self.pickle_key.bytes());
        self.store_record(&record)?;

        debug!(session_id, index = session.message_index(), "encrypted group message");
        Ok(message.to_base64())
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.entry(session_id.to_owned()).or_default().clone()
    }

    fn load_record(&self, session_id: &str) -> Result<GroupSessionRecord, CryptoError> {
        let key = StoreKey::GroupSession {
            session_id: session_id.to_owned(),
        };
        let blob = self
            .store
            .get(&key)?
            .ok_or_else(|| CryptoError::UnknownGroupSession(session_id.to_owned()))?;
        Ok(serde_json::from_slice(&blob)?)
    }

    fn store_record(&self, record: &GroupSessionRecord) -> Result<(), CryptoError> {
        let key = StoreKey::GroupSession {
            session_id: record.session_id.clone(),
        };
        self.store.put(&key, serde_json::to_vec(record)?)?;
        Ok(())
    }

    fn unpickle(&self, record: &GroupSessionRecord) -> Result<GroupSession, CryptoError> {
        let pickle = GroupSessionPickle::from_encrypted(&record.pickle, self.pickle_key.bytes())
            .map_err(|e| CryptoError::Pickle(e.to_string()))?;
        Ok(GroupSession::from_pickle(pickle))
    }
}
