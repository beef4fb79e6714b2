use lowkey_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the session layer.
///
/// Each variant maps to one recovery posture for the caller: a
/// [`Configuration`](CryptoError::Configuration) failure is fatal for the
/// device, session-creation failures are recoverable by re-requesting
/// keys or choosing another session, and nothing here is retried
/// internally — retry policy belongs to the caller.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The local account could not be loaded or created. Without an
    /// account there is no cryptographic identity; nothing else works.
    #[error("cryptographic identity unavailable: {0}")]
    Configuration(String),

    /// Session initialisation was handed malformed key material (wrong
    /// length or encoding). Trust in the keys is the caller's concern;
    /// this is the only local validation.
    #[error("could not initialise session: {0}")]
    SessionInit(String),

    /// The operation requires a pre-key message and got something else.
    #[error("expected a pre-key message (type 0), got message type {0}")]
    InvalidPreKeyMessage(usize),

    /// The pre-key message references a one-time key this account no
    /// longer holds — already consumed, or never issued.
    #[error("pre-key message references an unknown one-time key")]
    NoMatchingOneTimeKey,

    /// The ciphertext could not even be parsed.
    #[error("ciphertext is structurally invalid: {0}")]
    MalformedCiphertext(String),

    /// The caller named a session id that does not exist under that
    /// remote key. Stale id, caller bug.
    #[error("no session `{session_id}` known for device key `{remote_identity_key}`")]
    UnknownSession {
        remote_identity_key: String,
        session_id: String,
    },

    /// The caller named a group session id that does not exist.
    #[error("no outbound group session `{0}`")]
    UnknownGroupSession(String),

    /// Authentic cryptographic failure (bad MAC, ratchet mismatch).
    /// Retrying the same ciphertext against the same session cannot
    /// succeed; a different candidate session may (see
    /// `SessionManager::matches_session`).
    #[error("message failed to decrypt: {0}")]
    Decryption(String),

    /// A verification key was not a valid Ed25519 key encoding. Distinct
    /// from a signature that simply does not match, which is `Ok(false)`.
    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    /// A signature was structurally unverifiable (bad base64, wrong
    /// length). Also distinct from an honest mismatch.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// A stored pickle could not be decrypted or restored.
    #[error("pickled state could not be restored: {0}")]
    Pickle(String),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("serialisation failure: {0}")]
    Serialisation(#[from] serde_json::Error),
}
