//! NetBIOS session-request handling
//!
//! A connection on the session-service port must open with a SESSION_REQUEST
//! frame carrying two encoded names (called, then calling). Each name is 34
//! bytes: a 0x20 tag, 32 half-ASCII digits, and a 0x00 terminator. The
//! half-ASCII digits expand pairwise to 16 raw bytes, of which the first 15
//! are the OEM-encoded machine name (space padded) and the last is the name
//! suffix.

use crate::error::{SessionError, SmbResult};

/// Exact payload length of a session request: two 34-byte encoded names
pub const SESSION_REQUEST_LEN: usize = 68;

/// Length of one encoded name, including tag and terminator
pub const ENCODED_NAME_LEN: usize = 34;

/// Negative session response reason for a malformed calling name
pub const NEGATIVE_REASON_BAD_CALLING_NAME: u8 = 0x83;

/// OEM code page 850 upper half (0x80..=0xFF)
const CP850_HIGH: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å',
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', 'ø', '£', 'Ø', '×', 'ƒ',
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '®', '¬', '½', '¼', '¡', '«', '»',
    '░', '▒', '▓', '│', '┤', 'Á', 'Â', 'À', '©', '╣', '║', '╗', '╝', '¢', '¥', '┐',
    '└', '┴', '┬', '├', '─', '┼', 'ã', 'Ã', '╚', '╔', '╩', '╦', '╠', '═', '╬', '¤',
    'ð', 'Ð', 'Ê', 'Ë', 'È', 'ı', 'Í', 'Î', 'Ï', '┘', '┌', '█', '▄', '¦', 'Ì', '▀',
    'Ó', 'ß', 'Ô', 'Ò', 'õ', 'Õ', 'µ', 'þ', 'Þ', 'Ú', 'Û', 'Ù', 'ý', 'Ý', '¯', '´',
    '\u{AD}', '±', '‗', '¾', '¶', '§', '÷', '¸', '°', '¨', '·', '¹', '³', '²', '■', '\u{A0}',
];

/// The two names carried by a session request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequestNames {
    /// The server name the client addressed
    pub called: String,
    /// The client machine name (the session's workstation)
    pub calling: String,
}

/// Check one encoded name: tag, 32 half-ASCII digits, terminator.
pub fn validate_encoded_name(name: &[u8]) -> bool {
    if name.len() != ENCODED_NAME_LEN {
        return false;
    }
    if name[0] != 0x20 || name[33] != 0x00 {
        return false;
    }
    name[1..33].iter().all(|b| (b'A'..=b'P').contains(b))
}

/// Expand an encoded name into its machine name, dropping the suffix byte
/// and truncating at the first space.
pub fn decode_name(name: &[u8]) -> SmbResult<String> {
    if !validate_encoded_name(name) {
        return Err(SessionError::Handshake("malformed encoded name".to_string()));
    }

    let mut raw = [0u8; 16];
    for (i, slot) in raw.iter_mut().enumerate() {
        let hi = name[1 + 2 * i] - b'A';
        let lo = name[2 + 2 * i] - b'A';
        *slot = (hi << 4) | lo;
    }

    // 16th byte is the name suffix, not part of the machine name
    let mut decoded = String::with_capacity(15);
    for &b in &raw[..15] {
        if b == b' ' {
            break;
        }
        if b < 0x80 {
            decoded.push(b as char);
        } else {
            decoded.push(CP850_HIGH[(b - 0x80) as usize]);
        }
    }
    Ok(decoded)
}

/// Parse a SESSION_REQUEST payload. Malformed payloads are reported as
/// handshake errors; the caller answers with a negative session response.
pub fn parse_session_request(payload: &[u8]) -> SmbResult<SessionRequestNames> {
    if payload.len() != SESSION_REQUEST_LEN {
        return Err(SessionError::Handshake(format!(
            "session request length {} (want {})",
            payload.len(),
            SESSION_REQUEST_LEN
        )));
    }

    let called = decode_name(&payload[..ENCODED_NAME_LEN])?;
    let calling = decode_name(&payload[ENCODED_NAME_LEN..])?;

    Ok(SessionRequestNames { called, calling })
}

/// Encode a machine name (at most 15 bytes of OEM text) plus suffix into
/// the 34-byte wire form.
pub fn encode_name(name: &str, suffix: u8) -> Vec<u8> {
    let mut raw = [b' '; 16];
    for (i, b) in name.bytes().take(15).enumerate() {
        raw[i] = b.to_ascii_uppercase();
    }
    raw[15] = suffix;

    let mut out = Vec::with_capacity(ENCODED_NAME_LEN);
    out.push(0x20);
    for b in raw {
        out.push(b'A' + (b >> 4));
        out.push(b'A' + (b & 0x0F));
    }
    out.push(0x00);
    out
}
