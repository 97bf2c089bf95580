//! SPAKE2 handshake with key confirmation.
//!
//! Roles are asymmetric: the dialer plays side A, the listener side B. Peer
//! identities are bound into SPAKE2's identity inputs in role-assigned
//! order, while the transcript sorts them so both sides derive identical
//! byte strings regardless of who dialed.
//!
//! Frame flow (side A):
//! `PakeMsg(A)` out, `PakeMsg(B)` in, `PakeConfirm(tag_A)` out,
//! `PakeConfirm(tag_B)` in. Side B mirrors it. A bad confirmation tag sends
//! `PakeAbort` best-effort and fails the handshake.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::crypto::hkdf_bytes;
use crate::proto::wire::{FRAME_PAKE_ABORT, FRAME_PAKE_CONFIRM, FRAME_PAKE_MSG};
use crate::proto::{read_frame, write_frame, FrameError};

type HmacSha256 = Hmac<Sha256>;

/// Which side of the handshake we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PakeRole {
    /// The dialing side (SPAKE2 side A).
    Initiator,
    /// The listening side (SPAKE2 side B).
    Responder,
}

/// Non-retryable handshake failures.
#[derive(Debug, thiserror::Error)]
pub enum PakeError {
    /// The peer sent a frame type we were not awaiting.
    #[error("unexpected frame 0x{got:02x} while awaiting 0x{want:02x}")]
    BadFrame { want: u8, got: u8 },

    /// The SPAKE2 library rejected the peer's exchange message.
    #[error("pake finish: {0}")]
    Finish(spake2::Error),

    /// The peer's confirmation tag did not verify: wrong code, or an
    /// active attacker.
    #[error("key confirmation mismatch")]
    KeyConfirmMismatch,

    /// The peer aborted the handshake.
    #[error("peer aborted the handshake")]
    Aborted,

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Canonical session transcript.
///
/// Joined with `|` separators: the protocol label, the code's nameplate
/// portion, the subprotocol tag, and the two peer identifiers sorted
/// lexicographically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript(Vec<u8>);

impl Transcript {
    pub fn new(nameplate: &str, subprotocol: &str, local_id: &str, remote_id: &str) -> Self {
        let (lo, hi) = if local_id <= remote_id {
            (local_id, remote_id)
        } else {
            (remote_id, local_id)
        };
        let s = ["wormhole-pake-v1", nameplate, subprotocol, lo, hi].join("|");
        Self(s.into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

fn confirm_tag(confirm_key: &[u8; 32], side: &str, transcript: &Transcript) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(confirm_key)
        .expect("hmac accepts any key length");
    mac.update(side.as_bytes());
    mac.update(b"|");
    mac.update(transcript.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

fn verify_tag(confirm_key: &[u8; 32], side: &str, transcript: &Transcript, tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(confirm_key)
        .expect("hmac accepts any key length");
    mac.update(side.as_bytes());
    mac.update(b"|");
    mac.update(transcript.as_bytes());
    mac.verify_slice(tag).is_ok()
}

async fn expect_frame<R>(r: &mut R, want: u8) -> Result<Vec<u8>, PakeError>
where
    R: AsyncRead + Unpin,
{
    let (typ, payload) = read_frame(r).await?;
    if typ == FRAME_PAKE_ABORT {
        return Err(PakeError::Aborted);
    }
    if typ != want {
        return Err(PakeError::BadFrame { want, got: typ });
    }
    Ok(payload)
}

/// Runs the SPAKE2 exchange plus key confirmation on a framed stream and
/// returns the shared key `K`.
///
/// Side A passes identities `(local, remote)` to SPAKE2, side B
/// `(remote, local)`, so both agree on which identity is A's.
pub async fn run_pake<R, W>(
    r: &mut R,
    w: &mut W,
    role: PakeRole,
    code: &str,
    transcript: &Transcript,
    local_id: &str,
    remote_id: &str,
) -> Result<Vec<u8>, PakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let pw = Password::new(code.as_bytes());
    let (state, my_msg) = match role {
        PakeRole::Initiator => Spake2::<Ed25519Group>::start_a(
            &pw,
            &Identity::new(local_id.as_bytes()),
            &Identity::new(remote_id.as_bytes()),
        ),
        PakeRole::Responder => Spake2::<Ed25519Group>::start_b(
            &pw,
            &Identity::new(remote_id.as_bytes()),
            &Identity::new(local_id.as_bytes()),
        ),
    };

    let key = match role {
        PakeRole::Initiator => {
            write_frame(w, FRAME_PAKE_MSG, &my_msg).await?;
            let peer_msg = expect_frame(r, FRAME_PAKE_MSG).await?;
            let key = state.finish(&peer_msg).map_err(PakeError::Finish)?;

            let mut kc = [0u8; 32];
            hkdf_bytes(&key, "confirm|", transcript.as_bytes(), &mut kc);

            write_frame(w, FRAME_PAKE_CONFIRM, &confirm_tag(&kc, "A", transcript)).await?;
            let tag_b = expect_frame(r, FRAME_PAKE_CONFIRM).await?;
            if !verify_tag(&kc, "B", transcript, &tag_b) {
                let _ = write_frame(w, FRAME_PAKE_ABORT, b"").await;
                return Err(PakeError::KeyConfirmMismatch);
            }
            key
        }
        PakeRole::Responder => {
            let peer_msg = expect_frame(r, FRAME_PAKE_MSG).await?;
            let key = state.finish(&peer_msg).map_err(PakeError::Finish)?;
            write_frame(w, FRAME_PAKE_MSG, &my_msg).await?;

            let mut kc = [0u8; 32];
            hkdf_bytes(&key, "confirm|", transcript.as_bytes(), &mut kc);

            let tag_a = expect_frame(r, FRAME_PAKE_CONFIRM).await?;
            if !verify_tag(&kc, "A", transcript, &tag_a) {
                let _ = write_frame(w, FRAME_PAKE_ABORT, b"").await;
                return Err(PakeError::KeyConfirmMismatch);
            }
            write_frame(w, FRAME_PAKE_CONFIRM, &confirm_tag(&kc, "B", transcript)).await?;
            key
        }
    };

    Ok(key)
}
