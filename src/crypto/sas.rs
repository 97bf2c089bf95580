//! Short authentication string and transfer-seed derivation.
//!
//! The SAS is a small human-verifiable projection of the shared key: four
//! HKDF bytes read as a little-endian u32, sliced into five 6-bit fields,
//! each indexing a fixed 64-emoji table. Both users compare the five emojis
//! out loud before accepting the session.

use crate::crypto::{hkdf_bytes, Transcript};

/// The fixed emoji table. Indexed mod 64; order is part of the protocol.
const EMOJI: [&str; 64] = [
    "😀", "😂", "😅", "😊", "😍", "😎", "🤔", "😴",
    "😇", "🙃", "🤓", "😼", "🤖", "👻", "💩", "👾",
    "🦄", "🐶", "🐱", "🐼", "🐧", "🐸", "🦊", "🦁",
    "🌞", "🌙", "⭐", "⚡", "🔥", "🌈", "❄️", "💧",
    "🍕", "🍔", "🍟", "🎂", "☕", "🍺", "🎈", "🎲",
    "🎵", "🎧", "🎮", "📷", "💡", "🔌", "🔋", "🔧",
    "⚙️", "🧲", "🌋", "⛰️", "🌳", "🌻", "🍄", "🍎",
    "🍇", "🍋", "🍪", "🍫", "🍦", "🍩", "🍭", "🥐",
];

/// Renders the SAS for a session key: five emojis joined by single spaces.
pub fn sas_from_key(key: &[u8], transcript: &Transcript) -> String {
    let mut b = [0u8; 4];
    hkdf_bytes(key, "sas|", transcript.as_bytes(), &mut b);
    let acc = u32::from_le_bytes(b);
    let mut parts = Vec::with_capacity(5);
    for i in 0..5 {
        let idx = (acc >> (i * 6)) & 0x3F;
        parts.push(EMOJI[idx as usize % EMOJI.len()]);
    }
    parts.join(" ")
}

/// Derives the 64-bit seed for the content hash.
///
/// The transcript here must be the *transfer*-subprotocol one; the SAS and
/// key confirmation bind the chat subprotocol instead. The pairing matters:
/// both peers must seed their hashers identically or every file would nack.
pub fn transfer_seed(key: &[u8], transcript_xfer: &Transcript) -> u64 {
    let mut b = [0u8; 8];
    hkdf_bytes(key, "xfer-xxh3-seed|", transcript_xfer.as_bytes(), &mut b);
    u64::from_le_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PROTO_CHAT, PROTO_XFER};

    fn chat_transcript() -> Transcript {
        Transcript::new("250", PROTO_CHAT, "node-a", "node-b")
    }

    #[test]
    fn sas_has_five_space_separated_emojis() {
        let sas = sas_from_key(&[7u8; 32], &chat_transcript());
        assert_eq!(sas.split(' ').count(), 5);
        for part in sas.split(' ') {
            assert!(EMOJI.contains(&part));
        }
    }

    #[test]
    fn sas_is_deterministic_for_same_key_and_transcript() {
        let k = [42u8; 32];
        let a = sas_from_key(&k, &chat_transcript());
        let b = sas_from_key(&k, &chat_transcript());
        assert_eq!(a, b);
    }

    #[test]
    fn sas_differs_across_transcripts() {
        let k = [42u8; 32];
        let t1 = Transcript::new("250", PROTO_CHAT, "node-a", "node-b");
        let t2 = Transcript::new("251", PROTO_CHAT, "node-a", "node-b");
        assert_ne!(sas_from_key(&k, &t1), sas_from_key(&k, &t2));
    }

    #[test]
    fn sas_is_role_symmetric() {
        let k = [9u8; 32];
        let host = Transcript::new("613", PROTO_CHAT, "node-host", "node-conn");
        let conn = Transcript::new("613", PROTO_CHAT, "node-conn", "node-host");
        assert_eq!(sas_from_key(&k, &host), sas_from_key(&k, &conn));
    }

    #[test]
    fn seed_uses_transfer_transcript() {
        let k = [5u8; 32];
        let chat = Transcript::new("250", PROTO_CHAT, "node-a", "node-b");
        let xfer = Transcript::new("250", PROTO_XFER, "node-a", "node-b");
        let s1 = transfer_seed(&k, &xfer);
        let s2 = transfer_seed(&k, &xfer);
        assert_eq!(s1, s2);
        assert_ne!(s1, transfer_seed(&k, &chat));
    }

    #[test]
    fn seed_is_little_endian() {
        // Reconstruct the expansion by hand and compare the interpretation.
        let k = [1u8; 32];
        let xfer = Transcript::new("250", PROTO_XFER, "node-a", "node-b");
        let mut raw = [0u8; 8];
        crate::crypto::hkdf_bytes(&k, "xfer-xxh3-seed|", xfer.as_bytes(), &mut raw);
        assert_eq!(transfer_seed(&k, &xfer), u64::from_le_bytes(raw));
    }

    #[test]
    fn emoji_table_has_64_unique_entries() {
        let mut seen = std::collections::HashSet::new();
        for e in EMOJI {
            assert!(seen.insert(e));
        }
        assert_eq!(seen.len(), 64);
    }
}
