//! The per-device entry point.

use std::sync::Arc;

use lowkey_store::SessionStore;

use crate::account::AccountManager;
use crate::error::CryptoError;
use crate::group::GroupSessionManager;
use crate::session::SessionManager;
use crate::PickleKey;

/// All cryptographic state of one logged-in device: the account, its
/// pairwise sessions and its outbound group sessions, wired over a single
/// store and pickle key.
///
/// Construct one per device and pass it around explicitly; there is no
/// global instance.
pub struct Device {
    account: Arc<AccountManager>,
    sessions: SessionManager,
    groups: GroupSessionManager,
}

impl Device {
    /// Open the device state, creating a fresh identity if the store
    /// holds none.
    pub fn open(
        store: Arc<dyn SessionStore>,
        pickle_key: PickleKey,
    ) -> Result<Self, CryptoError> {
        let pickle_key = Arc::new(pickle_key);
        let account = Arc::new(AccountManager::open(store.clone(), pickle_key.clone())?);
        let sessions = SessionManager::new(account.clone(), store.clone(), pickle_key.clone());
        let groups = GroupSessionManager::new(store, pickle_key);
        Ok(Self {
            account,
            sessions,
            groups,
        })
    }

    pub fn account(&self) -> &AccountManager {
        &self.account
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn groups(&self) -> &GroupSessionManager {
        &self.groups
    }
}
