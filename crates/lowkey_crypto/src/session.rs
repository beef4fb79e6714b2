//! Pairwise ratchet sessions: creation, selection, encrypt/decrypt.
//!
//! A device may hold several concurrent sessions with the same remote
//! identity key (session races, multi-device peers). Selection among them
//! is deterministic: most recently used for outgoing encryption first,
//! then most recently created, then session id. Index 0 of
//! [`SessionManager::session_ids_for_device`] is "the" current session.
//!
//! Ratchet discipline (non-negotiable): encrypt and decrypt advance the
//! ratchet irreversibly, so each runs under the session's own lock and
//! the re-encrypted pickle is stored before the call returns. Decryption
//! is attempted only against an explicitly named session —
//! [`SessionManager::matches_session`] exists so callers can pick the
//! right candidate without a destructive trial decrypt.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vodozemac::olm::{Message, OlmMessage, PreKeyMessage, Session, SessionPickle};
use vodozemac::Curve25519PublicKey;

use lowkey_store::{SessionStore, StoreKey};

use crate::account::AccountManager;
use crate::error::CryptoError;
use crate::{PickleKey, NORMAL_MESSAGE_TYPE, PRE_KEY_MESSAGE_TYPE};

// ── Public records ───────────────────────────────────────────────────────────

/// Output of [`SessionManager::encrypt_message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    /// `0` for a pre-key message, `1` for a normal ratchet message. The
    /// ratchet state decides; callers cannot choose.
    pub message_type: usize,
    /// Base64-encoded ciphertext body.
    pub ciphertext: String,
}

/// Output of [`SessionManager::create_inbound_session`]: the decrypted
/// first payload and the id of the freshly derived session.
#[derive(Debug, Clone)]
pub struct InboundSessionResult {
    pub session_id: String,
    pub plaintext: Vec<u8>,
}

/// Summary of one session with a remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    /// False while the session is merely "offered" (outbound, nothing
    /// decrypted yet); true once a message has been received on it.
    pub has_received_message: bool,
}

// ── Durable envelope ─────────────────────────────────────────────────────────

/// What actually goes into the store for one session. The `pickle` field
/// is the primitive library's encrypted pickle and is never inspected
/// here; the metadata around it drives selection and `SessionInfo`.
#[derive(Serialize, Deserialize)]
struct SessionRecord {
    session_id: String,
    remote_identity_key: String,
    pickle: String,
    created_at: DateTime<Utc>,
    /// Set on every outgoing encrypt; decrypts do not count as "use" for
    /// selection purposes.
    last_used_at: Option<DateTime<Utc>>,
    has_received_message: bool,
}

// ── Manager ──────────────────────────────────────────────────────────────────

pub struct SessionManager {
    account: Arc<AccountManager>,
    store: Arc<dyn SessionStore>,
    pickle_key: Arc<PickleKey>,
    /// One mutex per (remote identity key, session id), held across
    /// load → ratchet step → persist, on every exit path.
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        account: Arc<AccountManager>,
        store: Arc<dyn SessionStore>,
        pickle_key: Arc<PickleKey>,
    ) -> Self {
        Self {
            account,
            store,
            pickle_key,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Initialise a new outbound session from a remote device's identity
    /// key and one claimed one-time key; returns the new session id.
    pub fn create_outbound_session(
        &self,
        their_identity_key: &str,
        their_one_time_key: &str,
    ) -> Result<String, CryptoError> {
        let identity_key = parse_curve25519(their_identity_key)?;
        let one_time_key = parse_curve25519(their_one_time_key)?;

        let session = self.account.create_outbound(identity_key, one_time_key);
        let session_id = session.session_id();

        let record = SessionRecord {
            session_id: session_id.clone(),
            remote_identity_key: their_identity_key.to_owned(),
            pickle: session.pickle().encrypt(self.pickle_key.bytes()),
            created_at: Utc::now(),
            last_used_at: None,
            has_received_message: false,
        };

        let lock = self.session_lock(their_identity_key, &session_id);
        let _guard = lock.lock();
        self.store_record(&record)?;

        info!(device = their_identity_key, session_id = %session_id, "created outbound session");
        Ok(session_id)
    }

    /// Derive an inbound session from an incoming pre-key message,
    /// decrypting its payload in the same step.
    ///
    /// On success the one-time key the message referenced has been
    /// removed from the account — it must never establish a second
    /// session — and the new session is stored already confirmed
    /// (`has_received_message = true`).
    pub fn create_inbound_session(
        &self,
        their_identity_key: &str,
        message_type: usize,
        ciphertext: &str,
    ) -> Result<InboundSessionResult, CryptoError> {
        if message_type != PRE_KEY_MESSAGE_TYPE {
            return Err(CryptoError::InvalidPreKeyMessage(message_type));
        }
        let identity_key = parse_curve25519(their_identity_key)?;
        let message = PreKeyMessage::from_base64(ciphertext)
            .map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?;

        // Consumes the one-time key and persists the account before we
        // ever see the session.
        let result = self.account.create_inbound(identity_key, &message)?;
        let session_id = result.session.session_id();

        let record = SessionRecord {
            session_id: session_id.clone(),
            remote_identity_key: their_identity_key.to_owned(),
            pickle: result.session.pickle().encrypt(self.pickle_key.bytes()),
            created_at: Utc::now(),
            last_used_at: None,
            has_received_message: true,
        };

        let lock = self.session_lock(their_identity_key, &session_id);
        let _guard = lock.lock();
        self.store_record(&record)?;

        info!(device = their_identity_key, session_id = %session_id, "created inbound session");
        Ok(InboundSessionResult {
            session_id,
            plaintext: result.plaintext,
        })
    }

    /// All known session ids for a remote device, selection order (see
    /// module docs). Stable across calls absent mutation.
    pub fn session_ids_for_device(
        &self,
        their_identity_key: &str,
    ) -> Result<Vec<String>, CryptoError> {
        Ok(self
            .records_for_device(their_identity_key)?
            .into_iter()
            .map(|record| record.session_id)
            .collect())
    }

    /// The preferred session for outgoing messages, or `None` if no
    /// session exists with that device.
    pub fn session_id_for_device(
        &self,
        their_identity_key: &str,
    ) -> Result<Option<String>, CryptoError> {
        Ok(self
            .records_for_device(their_identity_key)?
            .into_iter()
            .next()
            .map(|record| record.session_id))
    }

    /// Session summaries for a remote device, same order as
    /// [`session_ids_for_device`](Self::session_ids_for_device).
    pub fn session_info_for_device(
        &self,
        their_identity_key: &str,
    ) -> Result<Vec<SessionInfo>, CryptoError> {
        Ok(self
            .records_for_device(their_identity_key)?
            .into_iter()
            .map(|record| SessionInfo {
                session_id: record.session_id,
                has_received_message: record.has_received_message,
            })
            .collect())
    }

    /// Encrypt a payload on an existing session.
    ///
    /// Advances the sending chain irreversibly — never call
    /// speculatively. The session becomes the preferred one for
    /// subsequent [`session_id_for_device`](Self::session_id_for_device)
    /// calls.
    pub fn encrypt_message(
        &self,
        their_identity_key: &str,
        session_id: &str,
        payload: &[u8],
    ) -> Result<EncryptedMessage, CryptoError> {
        let lock = self.session_lock(their_identity_key, session_id);
        let _guard = lock.lock();

        let mut record = self.load_record(their_identity_key, session_id)?;
        let mut session = self.unpickle(&record)?;

        let message = session.encrypt(payload);
        record.pickle = session.pickle().encrypt(self.pickle_key.bytes());
        record.last_used_at = Some(Utc::now());
        self.store_record(&record)?;

        let (message_type, ciphertext) = message_parts(&message);
        debug!(device = their_identity_key, session_id, message_type, "encrypted message");
        Ok(EncryptedMessage {
            message_type,
            ciphertext,
        })
    }

    /// Decrypt a message on an existing session.
    ///
    /// A [`CryptoError::Decryption`] failure is final for this
    /// (session, ciphertext) pair; callers with several candidate
    /// sessions disambiguate with [`matches_session`](Self::matches_session)
    /// first, not by trial decryption.
    pub fn decrypt_message(
        &self,
        their_identity_key: &str,
        session_id: &str,
        message_type: usize,
        ciphertext: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let message = parse_message(message_type, ciphertext)?;

        let lock = self.session_lock(their_identity_key, session_id);
        let _guard = lock.lock();

        let mut record = self.load_record(their_identity_key, session_id)?;
        let mut session = self.unpickle(&record)?;

        let plaintext = session.decrypt(&message).map_err(|e| {
            warn!(device = their_identity_key, session_id, "decryption failed: {e}");
            CryptoError::Decryption(e.to_string())
        })?;

        record.pickle = session.pickle().encrypt(self.pickle_key.bytes());
        record.has_received_message = session.has_received_message();
        self.store_record(&record)?;

        debug!(device = their_identity_key, session_id, "decrypted message");
        Ok(plaintext)
    }

    /// Does this pre-key message belong to the named session?
    ///
    /// Pure probe: the session id is derived from the key material a
    /// session was created from, and a pre-key message carries that same
    /// material, so id equality is exactly "same founding keys". No
    /// ratchet state is touched, nothing is persisted.
    pub fn matches_session(
        &self,
        their_identity_key: &str,
        session_id: &str,
        message_type: usize,
        ciphertext: &str,
    ) -> Result<bool, CryptoError> {
        if message_type != PRE_KEY_MESSAGE_TYPE {
            return Err(CryptoError::InvalidPreKeyMessage(message_type));
        }
        let message = PreKeyMessage::from_base64(ciphertext)
            .map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?;

        let record = self.load_record(their_identity_key, session_id)?;
        Ok(message.session_id() == record.session_id)
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn session_lock(&self, remote: &str, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry((remote.to_owned(), session_id.to_owned()))
            .or_default()
            .clone()
    }

    fn records_for_device(
        &self,
        their_identity_key: &str,
    ) -> Result<Vec<SessionRecord>, CryptoError> {
        let mut records = Vec::new();
        for session_id in self.store.session_ids(their_identity_key)? {
            let key = StoreKey::Session {
                remote_identity_key: their_identity_key.to_owned(),
                session_id,
            };
            // a session removed between listing and load is skipped
            if let Some(blob) = self.store.get(&key)? {
                records.push(serde_json::from_slice(&blob)?);
            }
        }
        records.sort_by(|a: &SessionRecord, b: &SessionRecord| {
            b.last_used_at
                .cmp(&a.last_used_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(records)
    }

    fn load_record(
        &self,
        remote: &str,
        session_id: &str,
    ) -> Result<SessionRecord, CryptoError> {
        let key = StoreKey::Session {
            remote_identity_key: remote.to_owned(),
            session_id: session_id.to_owned(),
        };
        let blob = self
            .store
            .get(&key)?
            .ok_or_else(|| CryptoError::UnknownSession {
                remote_identity_key: remote.to_owned(),
                session_id: session_id.to_owned(),
            })?;
        Ok(serde_json::from_slice(&blob)?)
    }

    fn store_record(&self, record: &SessionRecord) -> Result<(), CryptoError> {
        let key = StoreKey::Session {
            remote_identity_key: record.remote_identity_key.clone(),
            session_id: record.session_id.clone(),
        };
        self.store.put(&key, serde_json::to_vec(record)?)?;
        Ok(())
    }

    fn unpickle(&self, record: &SessionRecord) -> Result<Session, CryptoError> {
        let pickle = SessionPickle::from_encrypted(&record.pickle, self.pickle_key.bytes())
            .map_err(|e| CryptoError::Pickle(e.to_string()))?;
        Ok(Session::from_pickle(pickle))
    }
}

fn parse_curve25519(key: &str) -> Result<Curve25519PublicKey, CryptoError> {
    Curve25519PublicKey::from_base64(key)
        .map_err(|e| CryptoError::SessionInit(format!("bad curve25519 key: {e}")))
}

fn parse_message(message_type: usize, ciphertext: &str) -> Result<OlmMessage, CryptoError> {
    match message_type {
        PRE_KEY_MESSAGE_TYPE => Ok(OlmMessage::PreKey(
            PreKeyMessage::from_base64(ciphertext)
                .map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?,
        )),
        NORMAL_MESSAGE_TYPE => Ok(OlmMessage::Normal(
            Message::from_base64(ciphertext)
                .map_err(|e| CryptoError::MalformedCiphertext(e.to_string()))?,
        )),
        other => Err(CryptoError::MalformedCiphertext(format!(
            "unknown message type {other}"
        ))),
    }
}

fn message_parts(message: &OlmMessage) -> (usize, String) {
    match message {
        OlmMessage::PreKey(m) => (PRE_KEY_MESSAGE_TYPE, m.to_base64()),
        OlmMessage::Normal(m) => (NORMAL_MESSAGE_TYPE, m.to_base64()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lowkey_store::MemoryStore;

    struct TestDevice {
        account: Arc<AccountManager>,
        sessions: SessionManager,
    }

    fn device() -> TestDevice {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let pickle_key = Arc::new(PickleKey::new([9u8; 32]));
        let account = Arc::new(AccountManager::open(store.clone(), pickle_key.clone()).unwrap());
        let sessions = SessionManager::new(account.clone(), store, pickle_key);
        TestDevice { account, sessions }
    }

    /// Generate, read out and publish one one-time key of `device`.
    fn claim_one_time_key(device: &TestDevice) -> String {
        device.account.generate_one_time_keys(1).unwrap();
        let keys = device.account.one_time_keys();
        let key = keys.values().next().unwrap().clone();
        device.account.mark_keys_as_published().unwrap();
        key
    }

    #[test]
    fn outbound_to_inbound_roundtrip() {
        let alice = device();
        let bob = device();
        let alice_curve = alice.account.identity_keys().curve25519;
        let bob_curve = bob.account.identity_keys().curve25519;

        let otk = claim_one_time_key(&alice);
        let session_id_b = bob
            .sessions
            .create_outbound_session(&alice_curve, &otk)
            .unwrap();

        let encrypted = bob
            .sessions
            .encrypt_message(&alice_curve, &session_id_b, b"hello")
            .unwrap();
        assert_eq!(encrypted.message_type, PRE_KEY_MESSAGE_TYPE);

        let result = alice
            .sessions
            .create_inbound_session(&bob_curve, encrypted.message_type, &encrypted.ciphertext)
            .unwrap();
        assert_eq!(result.plaintext, b"hello");
        assert_eq!(result.session_id, session_id_b);

        // inbound sessions start confirmed
        let info = alice.sessions.session_info_for_device(&bob_curve).unwrap();
        assert_eq!(
            info,
            vec![SessionInfo {
                session_id: result.session_id.clone(),
                has_received_message: true
            }]
        );

        // the consumed one-time key never reappears for publication
        assert!(alice.account.one_time_keys().is_empty());

        // reply travels back on the same session pair as a normal message
        let reply = alice
            .sessions
            .encrypt_message(&bob_curve, &result.session_id, b"hi yourself")
            .unwrap();
        assert_eq!(reply.message_type, NORMAL_MESSAGE_TYPE);

        let plaintext = bob
            .sessions
            .decrypt_message(&alice_curve, &session_id_b, reply.message_type, &reply.ciphertext)
            .unwrap();
        assert_eq!(plaintext, b"hi yourself");

        // ...which confirms Bob's outbound session
        let info = bob.sessions.session_info_for_device(&alice_curve).unwrap();
        assert!(info[0].has_received_message);
    }

    #[test]
    fn replayed_prekey_message_cannot_consume_twice() {
        let alice = device();
        let bob = device();
        let alice_curve = alice.account.identity_keys().curve25519;
        let bob_curve = bob.account.identity_keys().curve25519;

        let otk = claim_one_time_key(&alice);
        let session_id = bob
            .sessions
            .create_outbound_session(&alice_curve, &otk)
            .unwrap();
        let encrypted = bob
            .sessions
            .encrypt_message(&alice_curve, &session_id, b"first")
            .unwrap();

        alice
            .sessions
            .create_inbound_session(&bob_curve, encrypted.message_type, &encrypted.ciphertext)
            .unwrap();

        let err = alice
            .sessions
            .create_inbound_session(&bob_curve, encrypted.message_type, &encrypted.ciphertext)
            .unwrap_err();
        assert!(matches!(err, CryptoError::NoMatchingOneTimeKey));
    }

    #[test]
    fn matches_session_distinguishes_sessions_and_is_pure() {
        let alice = device();
        let bob = device();
        let alice_curve = alice.account.identity_keys().curve25519;
        let bob_curve = bob.account.identity_keys().curve25519;

        // first session, consumed by Alice
        let k1 = claim_one_time_key(&alice);
        let sid1 = bob.sessions.create_outbound_session(&alice_curve, &k1).unwrap();
        let ct1 = bob.sessions.encrypt_message(&alice_curve, &sid1, b"one").unwrap();
        let inbound = alice
            .sessions
            .create_inbound_session(&bob_curve, ct1.message_type, &ct1.ciphertext)
            .unwrap();

        // second session from a different, unconsumed one-time key
        let k2 = claim_one_time_key(&alice);
        let sid2 = bob.sessions.create_outbound_session(&alice_curve, &k2).unwrap();
        let ct2 = bob.sessions.encrypt_message(&alice_curve, &sid2, b"two").unwrap();

        // ct2 belongs to a different ratchet than Alice's existing session
        assert!(!alice
            .sessions
            .matches_session(&bob_curve, &inbound.session_id, ct2.message_type, &ct2.ciphertext)
            .unwrap());
        // the replayed ct1 still reflects the original session's identity
        assert!(alice
            .sessions
            .matches_session(&bob_curve, &inbound.session_id, ct1.message_type, &ct1.ciphertext)
            .unwrap());

        // probing any number of times must not disturb the ratchet:
        // a follow-up message still decrypts afterwards
        for _ in 0..5 {
            alice
                .sessions
                .matches_session(&bob_curve, &inbound.session_id, ct2.message_type, &ct2.ciphertext)
                .unwrap();
        }
        let next = bob.sessions.encrypt_message(&alice_curve, &sid1, b"three").unwrap();
        let plaintext = alice
            .sessions
            .decrypt_message(&bob_curve, &inbound.session_id, next.message_type, &next.ciphertext)
            .unwrap();
        assert_eq!(plaintext, b"three");

        let err = alice
            .sessions
            .matches_session(&bob_curve, &inbound.session_id, NORMAL_MESSAGE_TYPE, &ct1.ciphertext)
            .unwrap_err();
        assert!(matches!(err, CryptoError::InvalidPreKeyMessage(1)));
    }

    #[test]
    fn selection_prefers_last_sender_then_newest() {
        let alice = device();
        let bob = device();
        let alice_curve = alice.account.identity_keys().curve25519;

        let k1 = claim_one_time_key(&alice);
        let sid1 = bob.sessions.create_outbound_session(&alice_curve, &k1).unwrap();
        let k2 = claim_one_time_key(&alice);
        let sid2 = bob.sessions.create_outbound_session(&alice_curve, &k2).unwrap();

        // nothing sent yet: most recently created wins
        assert_eq!(
            bob.sessions.session_id_for_device(&alice_curve).unwrap(),
            Some(sid2.clone())
        );
        assert_eq!(
            bob.sessions.session_ids_for_device(&alice_curve).unwrap(),
            vec![sid2.clone(), sid1.clone()]
        );

        // repeated calls with no mutation are stable
        for _ in 0..3 {
            assert_eq!(
                bob.sessions.session_id_for_device(&alice_curve).unwrap(),
                Some(sid2.clone())
            );
        }

        // sending on the older session promotes it
        bob.sessions
            .encrypt_message(&alice_curve, &sid1, b"ping")
            .unwrap();
        assert_eq!(
            bob.sessions.session_id_for_device(&alice_curve).unwrap(),
            Some(sid1.clone())
        );
        assert_eq!(
            bob.sessions.session_ids_for_device(&alice_curve).unwrap(),
            vec![sid1, sid2]
        );
    }

    #[test]
    fn unknown_sessions_and_devices() {
        let bob = device();
        let alice_curve = device().account.identity_keys().curve25519;

        assert_eq!(bob.sessions.session_id_for_device(&alice_curve).unwrap(), None);
        assert!(bob.sessions.session_ids_for_device(&alice_curve).unwrap().is_empty());

        let err = bob
            .sessions
            .encrypt_message(&alice_curve, "no-such-session", b"x")
            .unwrap_err();
        assert!(matches!(err, CryptoError::UnknownSession { .. }));

        let err = bob
            .sessions
            .decrypt_message(&alice_curve, "no-such-session", NORMAL_MESSAGE_TYPE, "AAAA")
            .unwrap_err();
        // ciphertext parsing happens first
        assert!(matches!(
            err,
            CryptoError::MalformedCiphertext(_) | CryptoError::UnknownSession { .. }
        ));
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let alice = device();
        let bob = device();
        let bob_curve = bob.account.identity_keys().curve25519;

        let err = bob
            .sessions
            .create_outbound_session("not a key", "also not a key")
            .unwrap_err();
        assert!(matches!(err, CryptoError::SessionInit(_)));

        let err = alice
            .sessions
            .create_inbound_session(&bob_curve, NORMAL_MESSAGE_TYPE, "AAAA")
            .unwrap_err();
        assert!(matches!(err, CryptoError::InvalidPreKeyMessage(1)));

        let err = alice
            .sessions
            .create_inbound_session(&bob_curve, PRE_KEY_MESSAGE_TYPE, "definitely not a message")
            .unwrap_err();
        assert!(matches!(err, CryptoError::MalformedCiphertext(_)));
    }

    #[test]
    fn wrong_session_decrypt_fails_without_poisoning_the_right_one() {
        let alice = device();
        let bob = device();
        let carol = device();
        let alice_curve = alice.account.identity_keys().curve25519;
        let bob_curve = bob.account.identity_keys().curve25519;
        let carol_curve = carol.account.identity_keys().curve25519;

        // Bob and Carol each establish a session with Alice
        let kb = claim_one_time_key(&alice);
        let sid_bob = bob.sessions.create_outbound_session(&alice_curve, &kb).unwrap();
        let ct_bob = bob.sessions.encrypt_message(&alice_curve, &sid_bob, b"from bob").unwrap();
        let inbound_bob = alice
            .sessions
            .create_inbound_session(&bob_curve, ct_bob.message_type, &ct_bob.ciphertext)
            .unwrap();

        let kc = claim_one_time_key(&alice);
        let sid_carol = carol.sessions.create_outbound_session(&alice_curve, &kc).unwrap();

        // a later message from Carol cannot decrypt on Bob's session
        let ct_carol = carol
            .sessions
            .encrypt_message(&alice_curve, &sid_carol, b"from carol")
            .unwrap();
        let err = alice
            .sessions
            .decrypt_message(
                &bob_curve,
                &inbound_bob.session_id,
                ct_carol.message_type,
                &ct_carol.ciphertext,
            )
            .unwrap_err();
        assert!(matches!(err, CryptoError::Decryption(_)));

        // Bob's session still works afterwards
        let ct_bob2 = bob.sessions.encrypt_message(&alice_curve, &sid_bob, b"again").unwrap();
        let plaintext = alice
            .sessions
            .decrypt_message(
                &bob_curve,
                &inbound_bob.session_id,
                ct_bob2.message_type,
                &ct_bob2.ciphertext,
            )
            .unwrap();
        assert_eq!(plaintext, b"again");
    }
}
