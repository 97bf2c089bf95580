//! Key establishment and derivation.
//!
//! - [`pake`]: the SPAKE2 handshake over a framed stream, with key
//!   confirmation tags
//! - [`sas`]: the short authentication string and the transfer hash seed
//!
//! All derivations hang off the session transcript, a canonical byte string
//! binding the session to both identities, the nameplate, and the
//! subprotocol.

pub mod pake;
pub mod sas;

pub use pake::{run_pake, PakeError, PakeRole, Transcript};

use hkdf::Hkdf;
use sha2::Sha256;

/// HKDF-SHA256 expand with `info = label || transcript` and no salt.
pub(crate) fn hkdf_bytes(ikm: &[u8], label: &str, transcript: &[u8], out: &mut [u8]) {
    let mut info = Vec::with_capacity(label.len() + transcript.len());
    info.extend_from_slice(label.as_bytes());
    info.extend_from_slice(transcript);
    let hk = Hkdf::<Sha256>::new(None, ikm);
    hk.expand(&info, out)
        .expect("requested HKDF output length is always < 255 * 32");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic_and_label_sensitive() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        let mut c = [0u8; 32];
        hkdf_bytes(b"ikm", "confirm|", b"transcript", &mut a);
        hkdf_bytes(b"ikm", "confirm|", b"transcript", &mut b);
        hkdf_bytes(b"ikm", "sas|", b"transcript", &mut c);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
