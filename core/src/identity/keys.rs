// Node key material

use anyhow::{Context, Result};
use libp2p::identity::Keypair;
use libp2p::PeerId;
use zeroize::Zeroizing;

/// Ed25519 keypair that defines the node's peer identity
#[derive(Clone)]
pub struct NodeKeys {
    keypair: Keypair,
}

impl NodeKeys {
    /// Generate a new random Ed25519 keypair
    pub fn generate() -> Self {
        Self {
            keypair: Keypair::generate_ed25519(),
        }
    }

    /// Wrap an existing libp2p keypair
    pub fn from_keypair(keypair: Keypair) -> Self {
        Self { keypair }
    }

    /// Build keys from a raw 32-byte Ed25519 secret
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self> {
        let mut bytes = Zeroizing::new(secret.to_vec());
        let keypair = Keypair::ed25519_from_bytes(&mut *bytes)
            .map_err(|e| anyhow::anyhow!("Invalid Ed25519 secret: {}", e))?;
        Ok(Self { keypair })
    }

    /// The libp2p keypair
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Peer identity derived from the public key
    pub fn peer_id(&self) -> PeerId {
        self.keypair.public().to_peer_id()
    }

    /// Protobuf encoding of the keypair.
    /// Returns a `Zeroizing<Vec<u8>>` that wipes the secret on drop.
    pub fn to_protobuf(&self) -> Result<Zeroizing<Vec<u8>>> {
        let bytes = self
            .keypair
            .to_protobuf_encoding()
            .context("Failed to encode keypair")?;
        Ok(Zeroizing::new(bytes))
    }

    /// Decode a protobuf-encoded keypair
    pub fn from_protobuf(bytes: &[u8]) -> Result<Self> {
        let keypair =
            Keypair::from_protobuf_encoding(bytes).context("Invalid protobuf keypair")?;
        Ok(Self { keypair })
    }

    /// Hex form of the protobuf encoding, as stored in key files
    pub fn to_protobuf_hex(&self) -> Result<Zeroizing<String>> {
        let bytes = self.to_protobuf()?;
        Ok(Zeroizing::new(hex::encode(bytes.as_slice())))
    }

    /// Parse the hex form written by [`NodeKeys::to_protobuf_hex`]
    pub fn from_protobuf_hex(text: &str) -> Result<Self> {
        let bytes = Zeroizing::new(hex::decode(text.trim()).context("Key file is not hex")?);
        Self::from_protobuf(&bytes)
    }
}

impl std::fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeys")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protobuf_hex_preserves_peer_id() {
        let keys = NodeKeys::generate();
        let text = keys.to_protobuf_hex().unwrap();
        let restored = NodeKeys::from_protobuf_hex(&text).unwrap();
        assert_eq!(keys.peer_id(), restored.peer_id());
    }

    #[test]
    fn test_secret_bytes_are_deterministic() {
        let secret = [7u8; 32];
        let a = NodeKeys::from_secret_bytes(&secret).unwrap();
        let b = NodeKeys::from_secret_bytes(&secret).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(NodeKeys::from_protobuf_hex("zz").is_err());
        assert!(NodeKeys::from_protobuf(&[1, 2, 3]).is_err());
        assert!(NodeKeys::from_secret_bytes(&[1, 2, 3]).is_err());
    }
}
