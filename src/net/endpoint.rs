//! Iroh endpoint management and device identity.
//!
//! Each device keeps a cryptographic identity at
//! `~/.config/wormhole/device_key` so its public identifier stays stable
//! across restarts. The endpoint binds with NAT traversal and relay
//! fallback; which ALPNs it accepts depends on the role (clients accept
//! chat connections, the server accepts rendezvous ones).
//!
//! The config directory can be overridden with `WORMHOLE_CONFIG_DIR`,
//! which is how two instances share one test machine.

use std::net::SocketAddrV4;
use std::path::PathBuf;

use anyhow::{Context, Result};
use iroh::{Endpoint as IrohEndpoint, NodeAddr, PublicKey, SecretKey};
use once_cell::sync::OnceCell;
use tokio::fs;
use tracing::{debug, info};

/// Default configuration directory name.
const CONFIG_DIR: &str = "wormhole";

/// Device key filename.
const DEVICE_KEY_FILE: &str = "device_key";

/// Cached config directory path.
static CONFIG_DIR_CACHE: OnceCell<PathBuf> = OnceCell::new();

/// Errors from endpoint setup.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("failed to access configuration directory: {0}")]
    ConfigDir(String),

    #[error("failed to persist device key: {0}")]
    KeyPersistence(String),
}

/// Wraps the iroh endpoint together with the device identity.
#[derive(Debug, Clone)]
pub struct Endpoint {
    public_key: PublicKey,
    endpoint: IrohEndpoint,
}

impl Endpoint {
    /// Binds an endpoint accepting the given ALPNs, loading or creating
    /// the device identity.
    pub async fn bind(alpns: Vec<Vec<u8>>, bind_addr: Option<SocketAddrV4>) -> Result<Self> {
        let secret_key = Self::load_or_create_device_key().await?;
        Self::bind_with_key(secret_key, alpns, bind_addr).await
    }

    /// Binds with an explicit key (the server loads its own identity file).
    pub async fn bind_with_key(
        secret_key: SecretKey,
        alpns: Vec<Vec<u8>>,
        bind_addr: Option<SocketAddrV4>,
    ) -> Result<Self> {
        let public_key = secret_key.public();
        info!(device_id = %public_key, "device identity loaded");

        let mut builder = IrohEndpoint::builder()
            .secret_key(secret_key)
            .alpns(alpns)
            .discovery_n0();
        if let Some(addr) = bind_addr {
            builder = builder.bind_addr_v4(addr);
        }
        let endpoint = builder.bind().await.context("failed to bind endpoint")?;
        debug!("endpoint initialized");

        Ok(Self {
            public_key,
            endpoint,
        })
    }

    /// The device's public key, its identifier on the overlay.
    pub fn device_id(&self) -> PublicKey {
        self.public_key
    }

    /// Dialable address of this endpoint (identity, relay, direct sockets).
    pub async fn node_addr(&self) -> Result<NodeAddr> {
        self.endpoint
            .node_addr()
            .await
            .context("endpoint has no dialable address yet")
    }

    /// The underlying iroh endpoint.
    pub fn iroh(&self) -> &IrohEndpoint {
        &self.endpoint
    }

    /// Connects to a peer with the given ALPN.
    pub async fn connect(
        &self,
        addr: NodeAddr,
        alpn: &[u8],
    ) -> Result<iroh::endpoint::Connection> {
        debug!(peer = %addr.node_id, "dialing");
        self.endpoint
            .connect(addr, alpn)
            .await
            .context("failed to connect to peer")
    }

    /// Accepts the next incoming connection, or `None` once closed.
    pub async fn accept(&self) -> Result<Option<iroh::endpoint::Connection>> {
        if let Some(incoming) = self.endpoint.accept().await {
            let connection = incoming.await.context("failed to accept connection")?;
            if let Ok(peer) = iroh::endpoint::get_remote_node_id(&connection) {
                info!(peer = %peer, "accepted incoming connection");
            }
            Ok(Some(connection))
        } else {
            Ok(None)
        }
    }

    /// Gracefully shuts the endpoint down.
    pub async fn close(&self) {
        self.endpoint.close().await;
    }

    /// Config directory, honoring `WORMHOLE_CONFIG_DIR` (cached).
    fn config_dir() -> Result<PathBuf> {
        CONFIG_DIR_CACHE
            .get_or_try_init(|| {
                if let Ok(custom) = std::env::var("WORMHOLE_CONFIG_DIR") {
                    return Ok(PathBuf::from(custom));
                }
                dirs::config_dir()
                    .map(|p| p.join(CONFIG_DIR))
                    .ok_or_else(|| {
                        EndpointError::ConfigDir("could not determine config directory".into())
                            .into()
                    })
            })
            .cloned()
    }

    fn device_key_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(DEVICE_KEY_FILE))
    }

    async fn load_or_create_device_key() -> Result<SecretKey> {
        let key_path = Self::device_key_path()?;

        if key_path.exists() {
            debug!(path = %key_path.display(), "loading existing device key");
            let buffer = fs::read(&key_path).await.context("read device key")?;
            let key_array: [u8; 32] = buffer
                .try_into()
                .map_err(|_| EndpointError::KeyPersistence("invalid key length".into()))?;
            return Ok(SecretKey::from_bytes(&key_array));
        }

        debug!("no device key found, generating a new identity");
        let secret_key = SecretKey::generate(rand::thread_rng());

        let config_dir = Self::config_dir()?;
        fs::create_dir_all(&config_dir)
            .await
            .context("create config directory")?;

        #[cfg(unix)]
        Self::write_key_unix(&key_path, secret_key.to_bytes()).await?;

        #[cfg(not(unix))]
        fs::write(&key_path, secret_key.to_bytes())
            .await
            .context("write device key")?;

        info!(path = %key_path.display(), "generated new device identity");
        Ok(secret_key)
    }

    /// Writes the device key with mode 0600.
    #[cfg(unix)]
    async fn write_key_unix(key_path: &std::path::Path, key_bytes: [u8; 32]) -> Result<()> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let key_path = key_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)
                .context("open key file")?;
            file.write_all(&key_bytes).context("write key")?;
            file.flush().context("flush key file")?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("key write task failed")??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The config-dir cache is process-wide and set once, so the whole
    // key-persistence lifecycle runs in a single sequential test.
    #[tokio::test]
    async fn device_key_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        std::env::set_var("WORMHOLE_CONFIG_DIR", dir.path());

        // First call generates and persists.
        let key1 = Endpoint::load_or_create_device_key().await.unwrap();
        let key_path = Endpoint::device_key_path().unwrap();
        assert!(key_path.exists());

        let on_disk = std::fs::read(&key_path).unwrap();
        assert_eq!(on_disk.len(), 32);
        assert_eq!(on_disk, key1.to_bytes());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        // Second call reloads the same identity.
        let key2 = Endpoint::load_or_create_device_key().await.unwrap();
        assert_eq!(key1.to_bytes(), key2.to_bytes());
        assert_eq!(key1.public(), key2.public());

        // A corrupt key file is an error, not a silent regeneration.
        std::fs::write(&key_path, b"too short").unwrap();
        let res = Endpoint::load_or_create_device_key().await;
        assert!(res.is_err());
        assert!(res.unwrap_err().to_string().contains("invalid key length"));
    }
}
