//! Control plane: nameplate store, rate limiting, the HTTP API, and the
//! overlay rendezvous service.
//!
//! One server process owns a single database file with two tables: the
//! `nameplates` table driven by the store, and the `rendezvous` table
//! driven by the overlay service. Concurrent access is safe through WAL
//! journaling and a five-second busy timeout.

pub mod http;
pub mod identity;
pub mod limiter;
pub mod rendezvous;
pub mod store;

pub use http::{router, ControlState};
pub use limiter::IpLimiter;
pub use store::{Side, Store, StoreError};
