//! The chat session: handshake, SAS gate, and the interactive loop.
//!
//! The dialing side opens the chat stream and sends `##HELLO <id>`; the
//! accepting side waits up to thirty seconds for it. Both then run the
//! PAKE sub-handshake on the same stream, show the short authentication
//! string, and exchange `##ACCEPT`/`##REJECT` verdicts. Only mutual accept
//! opens the chat; anything else tears the session down and reports a
//! failure to the control plane.
//!
//! After establishment the stream has exactly one reader task and one
//! writer (the input loop). Transfers ride on separate streams and never
//! interleave with chat bytes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::api;
use crate::config::{
    CHAT_ACCEPT, CHAT_BYE, CHAT_HELLO, CHAT_REJECT, CONFIRM_TIMEOUT, HELLO_TIMEOUT, OFFER_TIMEOUT,
    PEER_ACCEPT_TIMEOUT, PROTO_CHAT, PROTO_XFER,
};
use crate::console::{Console, HELP_TEXT};
use crate::crypto::sas::{sas_from_key, transfer_seed};
use crate::crypto::{run_pake, PakeRole, Transcript};
use crate::net::endpoint::Endpoint;
use crate::net::overlay::classify_path;
use crate::net::transfer::{run_receiver, run_sender, SendSource};

/// Session-fatal failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Everything the session needs to know up front.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub role: PakeRole,
    pub nameplate: String,
    /// The full code; it is the PAKE password.
    pub code: String,
    /// Require local SAS confirmation on the dialing side.
    pub verify: bool,
    pub out_dir: PathBuf,
}

/// Keys derived once the handshake lands.
#[derive(Debug)]
pub struct SessionKeys {
    pub key: Vec<u8>,
    pub sas: String,
    pub xfer_seed: u64,
}

/// Runs HELLO, PAKE, SAS confirmation, and the accept exchange on an
/// established chat stream.
///
/// `confirm` is handed the SAS string and must resolve to the local
/// user's verdict; timeouts are the caller's business and count as no.
pub async fn handshake<R, W, F, Fut>(
    reader: &mut R,
    writer: &mut W,
    params: &SessionParams,
    local_id: &str,
    remote_id: &str,
    confirm: F,
) -> Result<SessionKeys, SessionError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnOnce(String) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    // HELLO travels dialer -> listener before any frame.
    match params.role {
        PakeRole::Initiator => {
            let hello = format!("{CHAT_HELLO} {local_id}\n");
            writer
                .write_all(hello.as_bytes())
                .await
                .context("write hello")?;
            writer.flush().await.context("flush hello")?;
        }
        PakeRole::Responder => {
            let line = read_line_deadline(reader, HELLO_TIMEOUT)
                .await
                .map_err(|_| {
                    SessionError::Handshake("did not receive valid HELLO in time".into())
                })?;
            if !line.starts_with(CHAT_HELLO) {
                return Err(SessionError::Handshake(
                    "did not receive valid HELLO in time".into(),
                ));
            }
        }
    }

    let transcript = Transcript::new(&params.nameplate, PROTO_CHAT, local_id, remote_id);
    let key = run_pake(
        reader,
        writer,
        params.role,
        &params.code,
        &transcript,
        local_id,
        remote_id,
    )
    .await
    .map_err(|e| SessionError::Handshake(e.to_string()))?;

    let sas = sas_from_key(&key, &transcript);
    // The seed binds the transfer subprotocol, not the chat one.
    let xfer_transcript = Transcript::new(&params.nameplate, PROTO_XFER, local_id, remote_id);
    let xfer_seed = transfer_seed(&key, &xfer_transcript);

    // Local verdict. The listening side always asks; the dialing side can
    // opt out with verify=false.
    let must_ask = matches!(params.role, PakeRole::Responder) || params.verify;
    let accepted = if must_ask { confirm(sas.clone()).await } else { true };

    if !accepted {
        let _ = writer.write_all(format!("{CHAT_REJECT}\n").as_bytes()).await;
        let _ = writer.flush().await;
        return Err(SessionError::Handshake("local reject or timeout".into()));
    }
    writer
        .write_all(format!("{CHAT_ACCEPT}\n").as_bytes())
        .await
        .context("write accept")?;
    writer.flush().await.context("flush accept")?;

    let peer_line = read_line_deadline(reader, PEER_ACCEPT_TIMEOUT)
        .await
        .map_err(|_| SessionError::Handshake("peer didn't confirm in time".into()))?;
    match peer_line.trim() {
        s if s == CHAT_ACCEPT => Ok(SessionKeys {
            key,
            sas,
            xfer_seed,
        }),
        s if s == CHAT_REJECT => Err(SessionError::Handshake(
            "peer rejected the verification".into(),
        )),
        _ => Err(SessionError::Handshake("unexpected response".into())),
    }
}

async fn read_line_deadline<R>(reader: &mut R, d: std::time::Duration) -> anyhow::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = tokio::time::timeout(d, reader.read_line(&mut line))
        .await
        .context("read deadline elapsed")?
        .context("stream read")?;
    if n == 0 {
        anyhow::bail!("stream closed");
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Drives a whole session on an established connection: handshake, then
/// the chat and transfer loops, until either side closes.
pub async fn run_session(
    endpoint: &Endpoint,
    conn: iroh::endpoint::Connection,
    params: SessionParams,
    console: Arc<Console>,
    mut input: mpsc::Receiver<String>,
    control: api::Client,
) -> Result<(), SessionError> {
    let remote_id = iroh::endpoint::get_remote_node_id(&conn)
        .context("connection has no remote identity")?;
    let local_id = endpoint.device_id().to_string();

    let (send, recv) = match params.role {
        PakeRole::Initiator => conn.open_bi().await.context("open chat stream")?,
        PakeRole::Responder => conn.accept_bi().await.context("accept chat stream")?,
    };
    let mut reader = BufReader::new(recv);
    let mut writer = send;

    let keys = {
        let console = Arc::clone(&console);
        let remote = remote_id.to_string();
        let result = handshake(
            &mut reader,
            &mut writer,
            &params,
            &local_id,
            &remote_id.to_string(),
            move |sas| async move {
                console.logln(&format!("Remote peer: {remote} | SAS: {sas}"));
                console
                    .confirm("Confirm peer within 30s [y/N]:", CONFIRM_TIMEOUT)
                    .await
            },
        )
        .await;
        match result {
            Ok(keys) => keys,
            Err(e) => {
                // The pairing never reached mutual accept.
                control.fail_async(&params.nameplate);
                return Err(e);
            }
        }
    };
    // First peer ##ACCEPT observed: release the nameplate.
    control.consume_async(&params.nameplate);
    info!(peer = %remote_id, "session established");

    let path = classify_path(endpoint, remote_id);
    console.logln(&format!("connected to {remote_id}"));
    console.println(&format!("path: {path}"));
    console.println(HELP_TEXT);
    console.println("connected. type a message to chat, or a command starting with '/'.");

    // One shot of "why did this end"; whoever fires first wins.
    let (end_tx, mut end_rx) = mpsc::channel::<String>(4);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    // Reader task: renders peer lines, watches for BYE and EOF.
    let reader_console = Arc::clone(&console);
    let reader_end = end_tx.clone();
    let mut reader_cancel = cancel_rx.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            let mut line = String::new();
            tokio::select! {
                _ = reader_cancel.changed() => return,
                read = reader.read_line(&mut line) => match read {
                    Ok(0) => {
                        let _ = reader_end.send("peer disconnected".into()).await;
                        return;
                    }
                    Ok(_) => {
                        let line = line.trim_end_matches(['\r', '\n']);
                        if line.starts_with(CHAT_BYE) {
                            let _ = reader_end.send("peer closed the chat".into()).await;
                            return;
                        }
                        if !line.trim().is_empty() {
                            reader_console.println(&format!("← {line}"));
                        }
                    }
                    Err(e) => {
                        debug!("chat read failed: {e}");
                        let _ = reader_end.send("peer disconnected".into()).await;
                        return;
                    }
                },
            }
        }
    });

    // Transfer accept task: every further bi-stream is an incoming offer.
    let xfer_conn = conn.clone();
    let xfer_console = Arc::clone(&console);
    let xfer_out = params.out_dir.clone();
    let xfer_seed = keys.xfer_seed;
    let mut xfer_cancel = cancel_rx.clone();
    let xfer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = xfer_cancel.changed() => return,
                accepted = xfer_conn.accept_bi() => {
                    let (mut send, mut recv) = match accepted {
                        Ok(s) => s,
                        Err(e) => {
                            debug!("no more transfer streams: {e}");
                            return;
                        }
                    };
                    let console = Arc::clone(&xfer_console);
                    let out_dir = xfer_out.clone();
                    tokio::spawn(async move {
                        let decide_console = Arc::clone(&console);
                        let result = run_receiver(
                            &mut recv,
                            &mut send,
                            &out_dir,
                            xfer_seed,
                            false,
                            move |offer| {
                                let question = match offer.files {
                                    Some(n) => format!(
                                        "Peer wants to send directory {:?} ({} files, total {} bytes). Accept? [y/N]:",
                                        offer.name, n, offer.size
                                    ),
                                    None => format!(
                                        "Peer wants to send file {:?} ({} bytes). Accept? [y/N]:",
                                        offer.name, offer.size
                                    ),
                                };
                                async move {
                                    decide_console.confirm(&question, OFFER_TIMEOUT).await
                                }
                            },
                        )
                        .await;
                        match result {
                            Ok(report) if report.accepted => {
                                for (name, size) in &report.received {
                                    console.println(&format!("← received: {name} ({size} bytes)"));
                                }
                                if !report.failed.is_empty() {
                                    console.println("some files failed integrity check:");
                                    for name in &report.failed {
                                        console.println(&format!("  - {name}"));
                                    }
                                }
                            }
                            Ok(_) => console.println("transfer declined."),
                            Err(e) => console.println(&format!("← xfer error: {e}")),
                        }
                    });
                }
            }
        }
    });

    // Input loop: the only chat writer.
    let reason = loop {
        tokio::select! {
            Some(reason) = end_rx.recv() => break reason,
            _ = tokio::signal::ctrl_c() => {
                let _ = writer.write_all(format!("{CHAT_BYE}\n").as_bytes()).await;
                let _ = writer.flush().await;
                break "interrupted".to_string();
            }
            line = input.recv() => {
                let Some(line) = line else {
                    let _ = writer.write_all(format!("{CHAT_BYE}\n").as_bytes()).await;
                    let _ = writer.flush().await;
                    break "stdin closed".to_string();
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(reason) = handle_line(
                    trimmed,
                    &mut writer,
                    &conn,
                    endpoint,
                    remote_id,
                    keys.xfer_seed,
                    &console,
                )
                .await
                {
                    break reason;
                }
            }
        }
    };

    console.logln(&reason);
    let _ = cancel_tx.send(true);
    let _ = writer.finish();
    conn.close(0u32.into(), b"session over");
    reader_task.abort();
    xfer_task.abort();
    Ok(())
}

/// Handles one input line. Returns a session-end reason when the line
/// closes the chat.
async fn handle_line(
    line: &str,
    writer: &mut iroh::endpoint::SendStream,
    conn: &iroh::endpoint::Connection,
    endpoint: &Endpoint,
    remote_id: iroh::NodeId,
    seed: u64,
    console: &Arc<Console>,
) -> Option<String> {
    if line == "/bye" {
        let _ = writer.write_all(format!("{CHAT_BYE}\n").as_bytes()).await;
        let _ = writer.flush().await;
        return Some("you closed the chat".to_string());
    }
    if line == "/peer" {
        let path = classify_path(endpoint, remote_id);
        console.println(&format!("peer: {remote_id}"));
        console.println(&format!("path: {path}"));
        return None;
    }
    if let Some(rest) = line.strip_prefix("/send") {
        let source = parse_send_args(rest);
        let Some(source) = source else {
            console.println("usage: /send -f <file> | -d <dir>");
            return None;
        };
        console.println("sending...");
        let conn = conn.clone();
        let console = Arc::clone(console);
        tokio::spawn(async move {
            let opened = conn.open_bi().await;
            let (mut send, mut recv) = match opened {
                Ok(s) => s,
                Err(e) => {
                    console.println(&format!("send failed: {e}"));
                    return;
                }
            };
            match run_sender(&mut recv, &mut send, &source, seed, false).await {
                Ok(report) => {
                    let _ = send.finish();
                    if report.failed.is_empty() {
                        console.println(&format!(
                            "xfer done: {} file(s), {} bytes.",
                            report.sent.len(),
                            report.total_bytes
                        ));
                    } else {
                        console.println("xfer finished with failures:");
                        for name in &report.failed {
                            console.println(&format!("  - {name}"));
                        }
                    }
                }
                Err(e) => console.println(&format!("send failed: {e}")),
            }
        });
        return None;
    }
    if line.starts_with('/') {
        console.println(HELP_TEXT);
        return None;
    }

    // Ordinary chat line.
    if writer
        .write_all(format!("{line}\n").as_bytes())
        .await
        .is_err()
    {
        warn!("chat write failed");
        return Some("peer disconnected".to_string());
    }
    let _ = writer.flush().await;
    console.println(&format!("→ {line}"));
    None
}

fn parse_send_args(rest: &str) -> Option<SendSource> {
    let mut parts = rest.split_whitespace();
    match parts.next()? {
        "-f" => Some(SendSource::File(PathBuf::from(
            parts.collect::<Vec<_>>().join(" "),
        ))),
        "-d" => Some(SendSource::Dir(PathBuf::from(
            parts.collect::<Vec<_>>().join(" "),
        ))),
        _ => None,
    }
    .filter(|s| match s {
        SendSource::File(p) | SendSource::Dir(p) => !p.as_os_str().is_empty(),
    })
}
