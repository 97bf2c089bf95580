//! Shared configuration and protocol constants.
//!
//! The numeric knobs (timeouts, windows, chunk size) live here as a single
//! read-only value constructed at startup and plumbed through constructors;
//! nothing else in the crate keeps process-global mutable state apart from
//! the server's store handle.

use std::time::Duration;

/// ALPN for peer-to-peer connections. The first bi-directional stream on
/// such a connection is the chat stream; every later accepted stream is a
/// transfer stream.
pub const CHAT_ALPN: &[u8] = b"/wormhole/1.0.0/chat";

/// ALPN for client-to-server rendezvous connections.
pub const RZV_ALPN: &[u8] = b"/wormhole/1.0.0/rzv";

/// Subprotocol tag bound into the chat transcript (key confirmation, SAS).
pub const PROTO_CHAT: &str = "/wormhole/1.0.0/chat";

/// Subprotocol tag bound into the transfer transcript (xxh3 seed).
pub const PROTO_XFER: &str = "/wormhole/1.0.0/xfer";

/// Chat control tokens. Plain lines that do not start with one of these are
/// ordinary chat messages.
pub const CHAT_HELLO: &str = "##HELLO";
pub const CHAT_ACCEPT: &str = "##ACCEPT";
pub const CHAT_REJECT: &str = "##REJECT";
pub const CHAT_BYE: &str = "##BYE";

/// Maximum accepted frame payload length (2^31 - 1).
pub const MAX_FRAME_LEN: u64 = (1 << 31) - 1;

/// Transfer chunk size (1 MiB).
pub const CHUNK_SIZE: usize = 1 << 20;

/// Wait for the peer's `##HELLO` line.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait for the local user to confirm the short authentication string.
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait for the peer's `##ACCEPT` / `##REJECT` line.
pub const PEER_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait for the receiver's accept-transfer prompt.
pub const OFFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Connector-side discovery window.
pub const DISCOVER_WINDOW: Duration = Duration::from_secs(60);

/// Pause between discovery rounds.
pub const DISCOVER_INTERVAL: Duration = Duration::from_millis(1200);

/// Per-attempt deadline for a direct dial.
pub const DIAL_DIRECT_TIMEOUT: Duration = Duration::from_secs(12);

/// Per-attempt deadline for a relay-assisted dial.
pub const DIAL_RELAY_TIMEOUT: Duration = Duration::from_secs(20);

/// Default deadline for control-plane HTTP requests.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Retries of a single file after a receiver hash mismatch.
pub const SEND_FILE_ATTEMPTS: u32 = 3;

/// Backoff unit between file retries (multiplied by the attempt number).
pub const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(300);

/// Client-side configuration assembled from the command line.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Control-plane base URL, e.g. `http://127.0.0.1:8080`.
    pub control_url: String,
    /// Directory where incoming files are written.
    pub out_dir: std::path::PathBuf,
    /// Require a local y/N confirmation of the SAS on the dialing side.
    pub verify: bool,
    /// Overall deadline applied to control-plane calls.
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            control_url: "http://127.0.0.1:8080".to_string(),
            out_dir: std::path::PathBuf::from("."),
            verify: true,
            timeout: HTTP_TIMEOUT,
        }
    }
}

/// Parses durations of the `90s` / `10m` / `2h` / `500ms` shape; a bare
/// number means seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (num, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let n: u64 = num
        .parse()
        .map_err(|_| format!("bad duration {s:?}: want e.g. 30s, 10m, 2h"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(format!("bad duration unit {unit:?} in {s:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("ten minutes").is_err());
        assert!(parse_duration("30x").is_err());
    }

    #[test]
    fn alpns_are_distinct() {
        assert_ne!(CHAT_ALPN, RZV_ALPN);
        assert!(CHAT_ALPN.is_ascii());
        assert!(RZV_ALPN.is_ascii());
    }

    #[test]
    fn chat_tokens_share_prefix() {
        for tok in [CHAT_HELLO, CHAT_ACCEPT, CHAT_REJECT, CHAT_BYE] {
            assert!(tok.starts_with("##"));
        }
    }

    #[test]
    fn frame_cap_is_2_31() {
        assert_eq!(MAX_FRAME_LEN, 2_147_483_647);
    }
}
