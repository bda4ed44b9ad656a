//! Service advertisement and browsing. The mechanism (mDNS, multicast beacons, ...) belongs
//! to the host; the peer manager only needs these capabilities.

use std::io;
use std::net::SocketAddr;

use crate::stream::StreamPair;

/// Service type every DungeonNet peer advertises and browses for.
pub const SERVICE_TYPE: &str = "_dungeonnet._tcp";

/// An advertised service seen while browsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRecord {
    pub name: String,
    pub service_type: String,
    pub addr: SocketAddr,
}

/// Host-supplied advertise/browse/connect mechanism.
///
/// `advertise` and `browse` may fail immediately (returned error) or later, in which case
/// the host reports it through `PeerManager::advertise_failed` / `browse_failed`. Found and
/// lost services and accepted connections are likewise reported back by the host.
pub trait Discovery {
    fn advertise(&mut self, service_name: &str, service_type: &str) -> Result<(), DiscoveryError>;

    fn stop_advertising(&mut self);

    fn browse(&mut self, service_type: &str) -> Result<(), DiscoveryError>;

    fn stop_browsing(&mut self);

    /// Open a raw stream pair to a service found while browsing.
    fn connect(&mut self, service: &ServiceRecord) -> Result<StreamPair, DiscoveryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("advertising failed: {0}")]
    Advertise(String),
    #[error("browsing failed: {0}")]
    Browse(String),
    #[error("connecting to {name} failed: {source}")]
    Connect {
        name: String,
        #[source]
        source: io::Error,
    },
}
