//! Connection handshake: each side writes a 17-byte record (peer ID + role tag), then reads
//! the remote's. Synchronous on purpose; hosts run it off their event loop.

use std::io::{self, Read, Write};

use crate::identity::{PeerId, PeerRole};

pub const HANDSHAKE_SIZE: usize = 16 + 1; // peer_id + role

/// Identity and role announced by one side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRecord {
    pub peer_id: PeerId,
    pub role: PeerRole,
}

impl HandshakeRecord {
    pub fn new(peer_id: PeerId, role: PeerRole) -> Self {
        Self { peer_id, role }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut out = [0u8; HANDSHAKE_SIZE];
        out[..16].copy_from_slice(self.peer_id.as_bytes());
        out[16] = self.role.to_byte();
        out
    }

    pub fn from_bytes(bytes: &[u8; HANDSHAKE_SIZE]) -> Result<Self, HandshakeError> {
        let mut peer_id = [0u8; 16];
        peer_id.copy_from_slice(&bytes[..16]);
        let role = PeerRole::from_byte(bytes[16]).ok_or(HandshakeError::InvalidRole(bytes[16]))?;
        Ok(Self {
            peer_id: PeerId::from_bytes(peer_id),
            role,
        })
    }
}

/// Send our record, then receive the remote's. A short write or read fails the exchange.
pub fn exchange<R, W>(
    input: &mut R,
    output: &mut W,
    local: &HandshakeRecord,
) -> Result<HandshakeRecord, HandshakeError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    output
        .write_all(&local.to_bytes())
        .and_then(|_| output.flush())
        .map_err(HandshakeError::Write)?;
    let mut buf = [0u8; HANDSHAKE_SIZE];
    input.read_exact(&mut buf).map_err(HandshakeError::Read)?;
    HandshakeRecord::from_bytes(&buf)
}

/// Error during the handshake. Every variant aborts the connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("failed to open streams: {0}")]
    Open(#[source] io::Error),
    #[error("handshake write failed: {0}")]
    Write(#[source] io::Error),
    #[error("handshake read failed: {0}")]
    Read(#[source] io::Error),
    #[error("invalid remote peer role {0:#04x}")]
    InvalidRole(u8),
}
