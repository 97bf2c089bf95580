//! Long-term server identity.
//!
//! The key pair is stored as the raw 32-byte Ed25519 secret, owner
//! read/write only. A missing file means first start: generate and
//! persist.

use std::path::Path;

use anyhow::{Context, Result};
use iroh::SecretKey;
use tracing::info;

/// Loads the identity from `path`, generating and persisting a fresh key
/// pair if the file does not exist.
pub fn load_or_create(path: &Path) -> Result<SecretKey> {
    if path.exists() {
        let bytes = std::fs::read(path)
            .with_context(|| format!("read identity {}", path.display()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity file has wrong length"))?;
        return Ok(SecretKey::from_bytes(&arr));
    }

    let key = SecretKey::generate(rand::thread_rng());
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            create_private_dir(dir)?;
        }
    }
    write_private(path, &key.to_bytes())?;
    info!(path = %path.display(), "generated new server identity");
    Ok(key)
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .with_context(|| format!("create {}", dir.display()))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    f.write_all(bytes).context("write identity")?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generates_then_reloads_same_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("identity");

        let k1 = load_or_create(&path).unwrap();
        assert!(path.exists());
        let k2 = load_or_create(&path).unwrap();
        assert_eq!(k1.to_bytes(), k2.to_bytes());
        assert_eq!(k1.public(), k2.public());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity");
        load_or_create(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn wrong_length_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity");
        std::fs::write(&path, b"short").unwrap();
        assert!(load_or_create(&path).is_err());
    }
}
