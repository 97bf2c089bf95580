//! Wormhole - point-to-point file and message transfer
//!
//! Two endpoints that share a short human-readable code (for example
//! `250-acorn-basin`) establish an authenticated, confidential channel
//! across arbitrary network topologies and exchange chat lines, files,
//! and directory trees with per-file integrity verification.
//!
//! # Architecture
//!
//! - [`server`]: the control plane - code allocation, claim matching,
//!   rate limiting, and the overlay rendezvous service
//! - [`net`]: the client networking stack - endpoint identity, peer
//!   discovery and dialing, the PAKE-gated chat session, and the framed
//!   transfer protocol
//! - [`crypto`]: SPAKE2 key establishment, key confirmation, and the
//!   short authentication string
//! - [`proto`]: the shared framing codec and wire payloads
//! - [`app`]: host and connector orchestration
//!
//! # Roles
//!
//! The **host** allocates a nameplate from the control plane, appends two
//! words from an embedded word list, shows the full code to its user, and
//! waits under the topic `/wormhole/{nameplate}`. The **connector** is
//! given the code out-of-band, claims the nameplate, discovers the host,
//! and dials. Both ends then run SPAKE2 over the chat stream with the code
//! as the password, compare a five-emoji short authentication string, and
//! only talk after both users confirm.

pub mod api;
pub mod app;
pub mod config;
pub mod console;
pub mod crypto;
pub mod net;
pub mod proto;
pub mod server;
pub mod words;
