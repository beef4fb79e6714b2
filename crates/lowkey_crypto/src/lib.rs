//! lowkey_crypto — Lowkey end-to-end encryption session layer
//!
//! Manages the per-device cryptographic identity and the ratcheting
//! sessions used to encrypt and decrypt messages between devices. The
//! double-ratchet primitives themselves come from `vodozemac`; durable
//! state goes through the `lowkey_store::SessionStore` contract as
//! passphrase-pickled blobs.
//!
//! # Design principles
//! - NO custom crypto; every primitive operation is a vodozemac call.
//! - Ratchets are destructive: any encrypt/decrypt happens under a lock
//!   scoped to the mutated state (the account, or one session) and the
//!   new pickle is persisted before the call returns. A crash can lose a
//!   message, never replay a consumed ratchet step.
//! - One explicitly constructed [`Device`] per logged-in device; no
//!   ambient globals.
//!
//! # Module layout
//! - `account` — local identity keys, one-time keys, signing
//! - `session` — pairwise ratchet sessions: create, select, encrypt, decrypt
//! - `group`   — outbound broadcast sessions for room-key distribution
//! - `sign`    — canonical JSON + Ed25519 signature verification
//! - `device`  — facade wiring the managers over one shared store
//! - `error`   — unified error type

pub mod account;
pub mod device;
pub mod error;
pub mod group;
pub mod session;
pub mod sign;

pub use account::{AccountManager, IdentityKeys};
pub use device::Device;
pub use error::CryptoError;
pub use group::GroupSessionManager;
pub use session::{EncryptedMessage, InboundSessionResult, SessionInfo, SessionManager};
pub use sign::{canonical_json, verify_signature, verify_signature_json};

use zeroize::ZeroizeOnDrop;

/// Wire tag of a pre-key message (the first message of a session, carrying
/// the key material the recipient derives the session from).
pub const PRE_KEY_MESSAGE_TYPE: usize = 0;
/// Wire tag of a normal ratchet message on an established session.
pub const NORMAL_MESSAGE_TYPE: usize = 1;

/// 32-byte key that encrypts pickled state at rest. Wiped from memory on
/// drop. Key provisioning (user passphrase KDF, OS keyring, ...) is the
/// caller's concern.
#[derive(Clone, ZeroizeOnDrop)]
pub struct PickleKey([u8; 32]);

impl PickleKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub(crate) fn bytes(&self) -> &[u8; 32] {
        &self.0
    }
}
