//! Frame type registry and structured payloads.

use serde::{Deserialize, Serialize};

// Transfer stream: 0x01-0x09, plus 0x7F for diagnostics.
pub const FRAME_OFFER: u8 = 0x01;
pub const FRAME_ACCEPT: u8 = 0x02;
pub const FRAME_REJECT: u8 = 0x03;
pub const FRAME_FILE_HDR: u8 = 0x04;
pub const FRAME_CHUNK: u8 = 0x05;
pub const FRAME_FILE_DONE: u8 = 0x06;
pub const FRAME_XFER_DONE: u8 = 0x07;
pub const FRAME_FILE_ACK: u8 = 0x08;
pub const FRAME_FILE_NACK: u8 = 0x09;
pub const FRAME_ERROR: u8 = 0x7F;

// PAKE sub-handshake on the chat stream: 0x10-0x1F.
pub const FRAME_PAKE_MSG: u8 = 0x10;
pub const FRAME_PAKE_CONFIRM: u8 = 0x11;
pub const FRAME_PAKE_ABORT: u8 = 0x1F;

// Rendezvous service (its own streams, never mixed with the above).
pub const FRAME_RZV_REGISTER: u8 = 0x40;
pub const FRAME_RZV_DISCOVER: u8 = 0x41;
pub const FRAME_RZV_PEERS: u8 = 0x42;
pub const FRAME_RZV_OK: u8 = 0x43;
pub const FRAME_RZV_ERROR: u8 = 0x4F;

/// Hash algorithm tag carried in every file header.
pub const HASH_ALGO: &str = "xxh3-128-seed";

/// Transfer offer, sent as the first frame on a transfer stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    /// `"file"` or `"dir"`.
    pub kind: String,
    /// Base file or directory name.
    pub name: String,
    /// Total byte size of all regular files covered by the offer.
    pub size: u64,
    /// File count, present for directory offers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<u64>,
}

/// Per-file header preceding the chunk stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    /// Relative destination path (or the bare name in single-file mode).
    pub name: String,
    /// Exact byte size of the file content.
    pub size: u64,
    /// Must be [`HASH_ALGO`].
    pub algo: String,
    /// Lowercase hex of the expected 128-bit seeded digest.
    pub hash: String,
}

/// Registration of a peer under a rendezvous topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RzvRegister {
    pub namespace: String,
    pub topic: String,
    /// Opaque dialable address (a JSON-serialized node address).
    pub addr: String,
    pub ttl_seconds: i64,
}

/// Lookup of peers registered under a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RzvDiscover {
    pub namespace: String,
    pub topic: String,
}

/// Discovery result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RzvPeers {
    pub addrs: Vec<String>,
}
