//! Peer identity: a per-process UUID plus the role the peer plays at the table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Peer identifier (16 bytes). Generated once per running instance and never persisted.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        PeerId(Uuid::new_v4())
    }

    /// Rebuild an identifier from its raw wire bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Which side of the table a peer sits on. Only configured pairings may connect.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Owns the encounter (the dungeon master's device).
    Primary,
    /// Mirrors the encounter (a player-facing initiative display).
    Secondary,
}

impl PeerRole {
    /// Role tag carried in the handshake record.
    pub fn to_byte(self) -> u8 {
        match self {
            PeerRole::Primary => 0x00,
            PeerRole::Secondary => 0x01,
        }
    }

    /// Parse a handshake role tag. Any other value is a protocol violation.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(PeerRole::Primary),
            0x01 => Some(PeerRole::Secondary),
            _ => None,
        }
    }

    /// The role this one is expected to pair with.
    pub fn counterpart(self) -> Self {
        match self {
            PeerRole::Primary => PeerRole::Secondary,
            PeerRole::Secondary => PeerRole::Primary,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Primary => f.write_str("primary"),
            PeerRole::Secondary => f.write_str("secondary"),
        }
    }
}

impl FromStr for PeerRole {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Ok(PeerRole::Primary),
            "secondary" => Ok(PeerRole::Secondary),
            _ => Err(ParseRoleError(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown peer role `{0}` (expected `primary` or `secondary`)")]
pub struct ParseRoleError(String);
