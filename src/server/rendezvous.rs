//! Overlay rendezvous service.
//!
//! Hosts register a dialable address under a topic; connectors look the
//! topic up. Registrations live in the `rendezvous` table of the server
//! database and age out by TTL, pruned on every lookup. The service runs
//! on the server's own endpoint under the rendezvous ALPN, one framed
//! request/response per bi-directional stream.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::proto::wire::{
    RzvDiscover, RzvPeers, RzvRegister, FRAME_RZV_DISCOVER, FRAME_RZV_ERROR, FRAME_RZV_OK,
    FRAME_RZV_PEERS, FRAME_RZV_REGISTER,
};
use crate::proto::{read_frame, write_frame};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rendezvous(
  namespace TEXT NOT NULL,
  topic TEXT NOT NULL,
  addr TEXT NOT NULL,
  registered_at INTEGER NOT NULL,
  ttl_seconds INTEGER NOT NULL,
  PRIMARY KEY(topic, addr)
);
CREATE INDEX IF NOT EXISTS idx_rendezvous_topic ON rendezvous(namespace, topic);
";

/// The persisted topic registry.
#[derive(Clone)]
pub struct RendezvousDb {
    conn: Arc<Mutex<Connection>>,
}

impl RendezvousDb {
    /// Opens the registry inside the shared server database file.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("open rendezvous db")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Inserts or refreshes a registration.
    pub fn register(
        &self,
        namespace: &str,
        topic: &str,
        addr: &str,
        ttl_seconds: i64,
        now: i64,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rendezvous(namespace, topic, addr, registered_at, ttl_seconds)
             VALUES(?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(topic, addr) DO UPDATE SET registered_at=?4, ttl_seconds=?5",
            params![namespace, topic, addr, now, ttl_seconds],
        )?;
        Ok(())
    }

    /// Returns the live addresses under a topic, pruning expired rows.
    pub fn discover(&self, namespace: &str, topic: &str, now: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM rendezvous WHERE (registered_at + ttl_seconds) < ?1",
            params![now],
        )?;
        let mut stmt = conn.prepare(
            "SELECT addr FROM rendezvous WHERE namespace=?1 AND topic=?2 ORDER BY registered_at DESC",
        )?;
        let addrs = stmt
            .query_map(params![namespace, topic], |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(addrs)
    }
}

/// Accept loop for the rendezvous ALPN. Runs until the endpoint closes.
pub async fn serve(endpoint: iroh::Endpoint, db: RendezvousDb) {
    info!("rendezvous service up");
    while let Some(incoming) = endpoint.accept().await {
        let db = db.clone();
        tokio::spawn(async move {
            let conn = match incoming.await {
                Ok(c) => c,
                Err(e) => {
                    debug!("incoming rendezvous connection failed: {e}");
                    return;
                }
            };
            // One request/response per bi-stream; the connection stays up
            // for as long as the client keeps polling.
            loop {
                let (mut send, mut recv) = match conn.accept_bi().await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!("rendezvous connection closed: {e}");
                        return;
                    }
                };
                let db = db.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_request(&db, &mut send, &mut recv).await {
                        warn!("rendezvous request failed: {e}");
                    }
                });
            }
        });
    }
}

async fn handle_request(
    db: &RendezvousDb,
    send: &mut iroh::endpoint::SendStream,
    recv: &mut iroh::endpoint::RecvStream,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let (typ, payload) = read_frame(recv).await?;
    match typ {
        FRAME_RZV_REGISTER => {
            let req: RzvRegister = serde_json::from_slice(&payload)?;
            db.register(&req.namespace, &req.topic, &req.addr, req.ttl_seconds, now)?;
            debug!(topic = %req.topic, "registered peer");
            write_frame(send, FRAME_RZV_OK, b"").await?;
        }
        FRAME_RZV_DISCOVER => {
            let req: RzvDiscover = serde_json::from_slice(&payload)?;
            let addrs = db.discover(&req.namespace, &req.topic, now)?;
            debug!(topic = %req.topic, found = addrs.len(), "discover");
            let body = serde_json::to_vec(&RzvPeers { addrs })?;
            write_frame(send, FRAME_RZV_PEERS, &body).await?;
        }
        other => {
            write_frame(send, FRAME_RZV_ERROR, b"unknown request").await?;
            anyhow::bail!("unknown rendezvous frame 0x{other:02x}");
        }
    }
    let _ = send.finish();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_discover() {
        let db = RendezvousDb::open_in_memory().unwrap();
        db.register("wormhole", "/wormhole/250", "addr-a", 120, 1000)
            .unwrap();
        db.register("wormhole", "/wormhole/250", "addr-b", 120, 1001)
            .unwrap();

        let addrs = db.discover("wormhole", "/wormhole/250", 1002).unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0], "addr-b"); // newest first
    }

    #[test]
    fn discover_prunes_expired_registrations() {
        let db = RendezvousDb::open_in_memory().unwrap();
        db.register("wormhole", "/wormhole/250", "addr-a", 10, 1000)
            .unwrap();
        assert_eq!(
            db.discover("wormhole", "/wormhole/250", 1005).unwrap().len(),
            1
        );
        assert!(db
            .discover("wormhole", "/wormhole/250", 1011)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn reregistration_refreshes_ttl() {
        let db = RendezvousDb::open_in_memory().unwrap();
        db.register("wormhole", "/wormhole/250", "addr-a", 10, 1000)
            .unwrap();
        db.register("wormhole", "/wormhole/250", "addr-a", 10, 1008)
            .unwrap();
        assert_eq!(
            db.discover("wormhole", "/wormhole/250", 1015).unwrap(),
            vec!["addr-a".to_string()]
        );
    }

    #[test]
    fn topics_and_namespaces_are_isolated() {
        let db = RendezvousDb::open_in_memory().unwrap();
        db.register("wormhole", "/wormhole/250", "addr-a", 120, 1000)
            .unwrap();
        assert!(db.discover("wormhole", "/wormhole/251", 1001).unwrap().is_empty());
        assert!(db.discover("other", "/wormhole/250", 1001).unwrap().is_empty());
    }
}
