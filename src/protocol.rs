//! Minimal SMB1 command header codec
//!
//! The session layer only decodes enough of a message to admit it: the
//! 32-byte command header and the command code. Full command parsing is the
//! dispatcher's job.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{SessionError, SmbResult};

/// SMB1 protocol magic
pub const SMB_MAGIC: &[u8; 4] = b"\xFFSMB";

/// SMB1 header size; also the minimum admissible message length
pub const SMB_HEADER_LEN: usize = 32;

/// Oplock release function code in a LOCKING_ANDX request
pub const LOCKING_ANDX_OPLOCK_RELEASE: u8 = 0x02;

/// SMB1 command codes the session layer needs to recognize
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmbCommand {
    /// Close file
    Close = 0x04,
    /// Tree disconnect
    TreeDisconnect = 0x71,
    /// Negotiate protocol
    Negotiate = 0x72,
    /// Session setup
    SessionSetupAndx = 0x73,
    /// Logoff
    LogoffAndx = 0x74,
    /// Tree connect
    TreeConnectAndx = 0x75,
    /// Raw read (takes over the transport for a raw data phase)
    ReadRaw = 0x1A,
    /// Raw write (takes over the transport for a raw data phase)
    WriteRaw = 0x1D,
    /// Lock/unlock, also carries oplock breaks
    LockingAndx = 0x24,
    /// Multi-part transaction
    Transaction = 0x25,
    /// Transaction continuation
    TransactionSecondary = 0x26,
    /// Echo (ping)
    Echo = 0x2B,
    /// Read
    ReadAndx = 0x2E,
    /// Write
    WriteAndx = 0x2F,
    /// NT transaction
    NtTransact = 0xA0,
    /// Cancel an in-flight request
    NtCancel = 0xA4,
}

impl SmbCommand {
    /// Look up a known command code; unknown codes are passed through to
    /// the dispatcher untouched.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x04 => Some(Self::Close),
            0x71 => Some(Self::TreeDisconnect),
            0x72 => Some(Self::Negotiate),
            0x73 => Some(Self::SessionSetupAndx),
            0x74 => Some(Self::LogoffAndx),
            0x75 => Some(Self::TreeConnectAndx),
            0x1A => Some(Self::ReadRaw),
            0x1D => Some(Self::WriteRaw),
            0x24 => Some(Self::LockingAndx),
            0x25 => Some(Self::Transaction),
            0x26 => Some(Self::TransactionSecondary),
            0x2B => Some(Self::Echo),
            0x2E => Some(Self::ReadAndx),
            0x2F => Some(Self::WriteAndx),
            0xA0 => Some(Self::NtTransact),
            0xA4 => Some(Self::NtCancel),
            _ => None,
        }
    }

    /// Get the raw command code
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// SMB1 command header
#[derive(Debug, Clone)]
pub struct SmbHeader {
    /// Command code
    pub command: u8,
    /// Status (requests carry 0)
    pub status: u32,
    /// Header flags
    pub flags: u8,
    /// Extended header flags
    pub flags2: u16,
    /// High part of the process id
    pub pid_high: u16,
    /// Security signature
    pub signature: [u8; 8],
    /// Tree id
    pub tid: u16,
    /// Process id
    pub pid: u16,
    /// User id
    pub uid: u16,
    /// Multiplex id
    pub mid: u16,
}

impl SmbHeader {
    /// Create a request header for the given command
    pub fn new_request(command: u8) -> Self {
        Self {
            command,
            status: 0,
            flags: 0,
            flags2: 0,
            pid_high: 0,
            signature: [0; 8],
            tid: 0,
            pid: 0,
            uid: 0,
            mid: 0,
        }
    }

    /// Parse a header from the front of a message
    pub fn parse(data: &[u8]) -> SmbResult<Self> {
        if data.len() < SMB_HEADER_LEN {
            return Err(SessionError::Protocol("header too short".to_string()));
        }

        if &data[0..4] != SMB_MAGIC {
            return Err(SessionError::Protocol("bad SMB magic".to_string()));
        }

        let mut buf = &data[4..];

        let command = buf.get_u8();
        let status = buf.get_u32_le();
        let flags = buf.get_u8();
        let flags2 = buf.get_u16_le();
        let pid_high = buf.get_u16_le();

        let mut signature = [0u8; 8];
        signature.copy_from_slice(&buf[..8]);
        buf.advance(8);

        let _reserved = buf.get_u16_le();
        let tid = buf.get_u16_le();
        let pid = buf.get_u16_le();
        let uid = buf.get_u16_le();
        let mid = buf.get_u16_le();

        Ok(Self {
            command,
            status,
            flags,
            flags2,
            pid_high,
            signature,
            tid,
            pid,
            uid,
            mid,
        })
    }

    /// Encode the header
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(SMB_MAGIC);
        buf.put_u8(self.command);
        buf.put_u32_le(self.status);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.flags2);
        buf.put_u16_le(self.pid_high);
        buf.put_slice(&self.signature);
        buf.put_u16_le(0); // reserved
        buf.put_u16_le(self.tid);
        buf.put_u16_le(self.pid);
        buf.put_u16_le(self.uid);
        buf.put_u16_le(self.mid);
    }
}

/// Encode an oplock-break message: a server-initiated LOCKING_ANDX with the
/// oplock-release function and the target break level.
pub fn encode_oplock_break(tid: u16, fid: u16, break_to_level2: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(SMB_HEADER_LEN + 19);

    let mut header = SmbHeader::new_request(SmbCommand::LockingAndx.as_u8());
    header.tid = tid;
    header.pid = 0xFFFF;
    header.uid = 0;
    header.mid = 0xFFFF;
    header.encode(&mut buf);

    buf.put_u8(8); // word count
    buf.put_u8(0xFF); // no chained command
    buf.put_u8(0); // andx reserved
    buf.put_u16_le(0); // andx offset
    buf.put_u16_le(fid);
    buf.put_u8(LOCKING_ANDX_OPLOCK_RELEASE);
    buf.put_u8(if break_to_level2 { 1 } else { 0 });
    buf.put_u32_le(0); // timeout
    buf.put_u16_le(0); // unlock count
    buf.put_u16_le(0); // lock count
    buf.put_u16_le(0); // byte count

    buf.freeze()
}
