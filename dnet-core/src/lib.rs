//! DungeonNet peer protocol reference implementation.
//! Host-driven: no sockets or runtime; the host passes stream events and discovery
//! results in and receives observer callbacks.

pub mod connection;
pub mod discovery;
pub mod encounter;
pub mod handshake;
pub mod identity;
pub mod peer;
pub mod protocol;
pub mod stream;
pub mod wire;

pub use connection::{Connection, ConnectionObserver};
pub use discovery::{Discovery, DiscoveryError, ServiceRecord, SERVICE_TYPE};
pub use encounter::{ApplyError, Combatant, Encounter, EncounterError, InitiativeOrder};
pub use handshake::{HandshakeError, HandshakeRecord, HANDSHAKE_SIZE};
pub use identity::{PeerId, PeerRole};
pub use peer::{HandshakeOutcome, PeerConfig, PeerManager, PeerObserver, PendingHandshake, Rejection};
pub use protocol::{DecodeError, Message, MIN_INITIATIVE, PROTOCOL_VERSION};
pub use stream::{InputStream, OutputStream, StreamEvent, StreamPair, StreamSource};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
