// Node identity: a stable Ed25519 keypair and the PeerId derived from it

mod keys;
mod store;

pub use keys::NodeKeys;
pub use store::IdentityStore;

use anyhow::Result;
use libp2p::PeerId;
use std::path::Path;

/// Manages node identity and its persistence
pub struct IdentityManager {
    store: IdentityStore,
    keys: Option<NodeKeys>,
}

impl IdentityManager {
    /// Create a new identity manager with in-memory storage
    pub fn new() -> Self {
        Self {
            store: IdentityStore::memory(),
            keys: None,
        }
    }

    /// Create a new identity manager backed by a key file
    pub fn with_key_file(path: impl AsRef<Path>) -> Self {
        Self {
            store: IdentityStore::file(path),
            keys: None,
        }
    }

    /// Load the stored identity, generating and saving one if none exists
    pub fn initialize(&mut self) -> Result<&NodeKeys> {
        let keys = match self.store.load_keys()? {
            Some(keys) => {
                tracing::info!("🔑 Loaded existing identity {}", keys.peer_id());
                keys
            }
            None => {
                let keys = NodeKeys::generate();
                tracing::info!("🔑 Generated new identity {}", keys.peer_id());
                self.store.save_keys(&keys)?;
                keys
            }
        };
        Ok(self.keys.insert(keys))
    }

    /// Get node keys (if initialized)
    pub fn keys(&self) -> Option<&NodeKeys> {
        self.keys.as_ref()
    }

    /// Get the peer identity (if initialized)
    pub fn peer_id(&self) -> Option<PeerId> {
        self.keys.as_ref().map(|k| k.peer_id())
    }
}

impl Default for IdentityManager {
    fn default() -> Self {
        Self::new()
    }
}
