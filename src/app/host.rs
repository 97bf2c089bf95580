//! Host orchestrator.
//!
//! Allocate a nameplate, mint the full code, announce under the topic,
//! and wait for the first claimant. When the code expires before anyone
//! shows up, rotate: allocate a fresh one and announce again. After one
//! successful session the host exits; it does not re-serve.

use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::api;
use crate::config::{ClientConfig, CHAT_ALPN};
use crate::console::Console;
use crate::crypto::PakeRole;
use crate::net::overlay::RendezvousClient;
use crate::net::session::{run_session, SessionParams};
use crate::net::Endpoint;
use crate::words::Code;

pub async fn run(
    cfg: ClientConfig,
    listen: Option<SocketAddrV4>,
    console: Arc<Console>,
) -> Result<()> {
    let control = api::Client::new(&cfg.control_url, cfg.timeout);
    let endpoint = Endpoint::bind(vec![CHAT_ALPN.to_vec()], listen)
        .await
        .context("bind overlay endpoint")?;
    let mut input = Some(console.spawn_stdin());

    loop {
        let alloc = control.allocate().await.context("allocate")?;
        let code = Code::generate(&alloc.nameplate);
        console.println(&format!(
            "hosting at code \"{code}\" (expires: {})",
            alloc.expires_at.to_rfc3339()
        ));

        let rzv = RendezvousClient::connect(&endpoint, &alloc.conn.rendezvous.addrs)
            .await
            .context("connect rendezvous")?;
        let me = endpoint.node_addr().await?;
        let ttl = (alloc.expires_at - chrono::Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(60));
        rzv.register(&alloc.conn.rendezvous.namespace, &alloc.conn.topic, &me, ttl)
            .await
            .context("register on rendezvous")?;

        console.println("waiting for peer...");
        let expiry = tokio::time::sleep(ttl);
        tokio::pin!(expiry);

        tokio::select! {
            accepted = endpoint.accept() => {
                // First claimant wins; the handler is gone after this.
                let Some(conn) = accepted? else {
                    return Ok(());
                };
                info!(nameplate = %alloc.nameplate, "peer arrived");
                let params = SessionParams {
                    role: PakeRole::Responder,
                    nameplate: alloc.nameplate.clone(),
                    code: code.to_string(),
                    verify: cfg.verify,
                    out_dir: cfg.out_dir.clone(),
                };
                run_session(
                    &endpoint,
                    conn,
                    params,
                    Arc::clone(&console),
                    input.take().expect("only one session per host run"),
                    control.clone(),
                )
                .await?;
                endpoint.close().await;
                return Ok(());
            }
            _ = &mut expiry => {
                console.logln("code expired, rotating");
                continue;
            }
            _ = tokio::signal::ctrl_c() => {
                console.logln("interrupted");
                endpoint.close().await;
                return Ok(());
            }
        }
    }
}
