//! Session transport framing
//!
//! Every message on the wire is preceded by a 4-byte transport header. The
//! two listener flavors interpret it differently: the NetBIOS session
//! service carries a frame type byte and a 17-bit length, while
//! direct-hosted TCP requires a zero first byte and uses a 24-bit length
//! (every direct frame is an ordinary session message).

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{SessionError, SmbResult};

/// Transport header size
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest length a NetBIOS frame header can carry (17 bits)
pub const NETBIOS_MAX_LEN: u32 = 0x1FFFF;

/// Which framing rules a connection uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// NetBIOS session service (port 139): typed frames, handshake required
    NetBios,
    /// Direct-hosted TCP (port 445): session messages only
    DirectTcp,
}

/// NetBIOS session service frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Ordinary session message carrying an SMB payload
    SessionMessage = 0x00,
    /// Session request (the NetBIOS handshake)
    SessionRequest = 0x81,
    /// Positive session response
    PositiveResponse = 0x82,
    /// Negative session response
    NegativeResponse = 0x83,
    /// Retarget response
    Retarget = 0x84,
    /// Keep-alive
    KeepAlive = 0x85,
}

impl FrameType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::SessionMessage),
            0x81 => Some(Self::SessionRequest),
            0x82 => Some(Self::PositiveResponse),
            0x83 => Some(Self::NegativeResponse),
            0x84 => Some(Self::Retarget),
            0x85 => Some(Self::KeepAlive),
            _ => None,
        }
    }
}

/// A decoded transport frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame type (always `SessionMessage` on direct TCP)
    pub frame_type: FrameType,
    /// Payload length in bytes
    pub length: u32,
}

impl FrameHeader {
    /// Decode a 4-byte transport header under the given framing rules.
    pub fn decode(kind: TransportKind, raw: [u8; 4]) -> SmbResult<Self> {
        match kind {
            TransportKind::NetBios => {
                let frame_type = FrameType::from_u8(raw[0]).ok_or_else(|| {
                    SessionError::Framing(format!("unknown frame type 0x{:02X}", raw[0]))
                })?;
                let length =
                    ((raw[1] as u32 & 0x01) << 16) | ((raw[2] as u32) << 8) | raw[3] as u32;
                Ok(Self { frame_type, length })
            }
            TransportKind::DirectTcp => {
                if raw[0] != 0 {
                    return Err(SessionError::Framing(format!(
                        "nonzero first header byte 0x{:02X} on direct transport",
                        raw[0]
                    )));
                }
                let length =
                    ((raw[1] as u32) << 16) | ((raw[2] as u32) << 8) | raw[3] as u32;
                Ok(Self {
                    frame_type: FrameType::SessionMessage,
                    length,
                })
            }
        }
    }

    /// Encode a transport header under the given framing rules.
    pub fn encode(&self, kind: TransportKind) -> [u8; 4] {
        match kind {
            TransportKind::NetBios => [
                self.frame_type as u8,
                ((self.length >> 16) & 0x01) as u8,
                (self.length >> 8) as u8,
                self.length as u8,
            ],
            TransportKind::DirectTcp => [
                0,
                (self.length >> 16) as u8,
                (self.length >> 8) as u8,
                self.length as u8,
            ],
        }
    }
}

/// Read one frame header from the stream.
pub async fn read_frame_header<R>(stream: &mut R, kind: TransportKind) -> SmbResult<FrameHeader>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut raw).await?;
    FrameHeader::decode(kind, raw)
}

/// Read a frame payload of the given length.
pub async fn read_payload<R>(stream: &mut R, length: u32) -> SmbResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut payload = BytesMut::zeroed(length as usize);
    stream.read_exact(&mut payload).await?;
    Ok(payload.freeze())
}

/// Write a complete frame (header plus payload) to the stream.
pub async fn write_frame<W>(
    stream: &mut W,
    kind: TransportKind,
    frame_type: FrameType,
    payload: &[u8],
) -> SmbResult<()>
where
    W: AsyncWrite + Unpin,
{
    let header = FrameHeader {
        frame_type,
        length: payload.len() as u32,
    };
    stream.write_all(&header.encode(kind)).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    stream.flush().await?;
    Ok(())
}
