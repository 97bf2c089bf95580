//! Connector orchestrator.
//!
//! Split the nameplate off the code, claim the connector side, then hunt
//! for the host inside the discovery window and dial it. A claim that
//! comes back failed means the code is invalid, expired, or already
//! taken - which one is intentionally not knowable.

use std::net::SocketAddrV4;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::api::{self, PlateStatus};
use crate::config::{ClientConfig, CHAT_ALPN};
use crate::console::Console;
use crate::crypto::PakeRole;
use crate::net::overlay::{discover_and_dial, RendezvousClient};
use crate::net::session::{run_session, SessionParams};
use crate::net::Endpoint;
use crate::words::Code;

pub async fn run(
    cfg: ClientConfig,
    code: Code,
    listen: Option<SocketAddrV4>,
    console: Arc<Console>,
) -> Result<()> {
    let control = api::Client::new(&cfg.control_url, cfg.timeout);

    let claim = control
        .claim(code.nameplate(), "connect")
        .await
        .context("claim")?;
    if claim.status == PlateStatus::Failed {
        bail!("claim failed (possibly invalid/expired/duplicate); ask the host for a fresh code");
    }
    info!(nameplate = %code.nameplate(), status = ?claim.status, "claimed");

    let endpoint = Endpoint::bind(vec![CHAT_ALPN.to_vec()], listen)
        .await
        .context("bind overlay endpoint")?;
    let rzv = RendezvousClient::connect(&endpoint, &claim.conn.rendezvous.addrs)
        .await
        .context("connect rendezvous")?;

    console.println(&format!("looking for the host on {}...", claim.conn.topic));
    let conn = match discover_and_dial(
        &endpoint,
        &rzv,
        &claim.conn.rendezvous.namespace,
        &claim.conn.topic,
    )
    .await
    {
        Ok(conn) => conn,
        Err(e) => {
            // The pairing will never complete; release the nameplate.
            let _ = control.fail(code.nameplate()).await;
            return Err(e.context("open chat"));
        }
    };

    let input = console.spawn_stdin();
    let params = SessionParams {
        role: PakeRole::Initiator,
        nameplate: code.nameplate().to_string(),
        code: code.to_string(),
        verify: cfg.verify,
        out_dir: cfg.out_dir.clone(),
    };
    run_session(&endpoint, conn, params, console, input, control).await?;
    endpoint.close().await;
    Ok(())
}
