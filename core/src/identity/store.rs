// Identity storage in a key file

use super::NodeKeys;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Storage backend for node keys
pub enum IdentityStore {
    Memory,
    File(PathBuf),
}

impl IdentityStore {
    /// Create in-memory storage
    pub fn memory() -> Self {
        Self::Memory
    }

    /// Create storage backed by a key file
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File(path.as_ref().to_path_buf())
    }

    /// Save keys to storage
    pub fn save_keys(&self, keys: &NodeKeys) -> Result<()> {
        match self {
            Self::Memory => Ok(()),
            Self::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .context("Failed to create key directory")?;
                }
                let text = keys.to_protobuf_hex()?;
                std::fs::write(path, text.as_bytes())
                    .with_context(|| format!("Failed to write key file {}", path.display()))?;
                restrict_permissions(path)?;
                Ok(())
            }
        }
    }

    /// Load keys from storage
    pub fn load_keys(&self) -> Result<Option<NodeKeys>> {
        match self {
            Self::Memory => Ok(None),
            Self::File(path) => {
                if !path.exists() {
                    return Ok(None);
                }
                let text = zeroize::Zeroizing::new(
                    std::fs::read_to_string(path)
                        .with_context(|| format!("Failed to read key file {}", path.display()))?,
                );
                let keys = NodeKeys::from_protobuf_hex(&text)
                    .with_context(|| format!("Corrupt key file {}", path.display()))?;
                Ok(Some(keys))
            }
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("Failed to restrict key file permissions")
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
