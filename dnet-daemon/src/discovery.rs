//! LAN discovery: UDP multicast beacons advertise a service and its TCP port; browsing
//! parses beacons and maintains the list of live services.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use dnet_core::{
    Discovery, DiscoveryError, PeerId, ServiceRecord, StreamPair, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::node::LoopEvent;
use crate::tcp::{self, TcpHandle};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const SERVICE_TIMEOUT: Duration = Duration::from_secs(16);

/// Multicast announcement of one advertised service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Beacon {
    protocol_version: u8,
    instance: PeerId,
    service_type: String,
    service_name: String,
    port: u16,
}

/// `Discovery` over UDP multicast beacons and plain TCP.
///
/// Results arrive on the event loop as `LoopEvent`s. Exactly one side of a pair dials: a
/// service is only reported as found when its instance id sorts above ours.
pub struct BeaconDiscovery {
    instance: PeerId,
    discovery_port: u16,
    transport_port: u16,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<LoopEvent>,
    advertiser: Option<Advertiser>,
    browser: Option<Browser>,
    sockets: HashMap<SocketAddr, TcpHandle>,
}

struct Advertiser {
    task: JoinHandle<()>,
    port: u16,
}

struct Browser {
    task: JoinHandle<()>,
    forget: mpsc::UnboundedSender<ServiceRecord>,
}

impl BeaconDiscovery {
    pub fn new(instance: PeerId, config: &Config, events: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self {
            instance,
            discovery_port: config.discovery_port,
            transport_port: config.transport_port,
            connect_timeout: config.handshake_timeout(),
            events,
            advertiser: None,
            browser: None,
            sockets: HashMap::new(),
        }
    }

    /// TCP port accepting connections while advertising.
    pub fn listening_port(&self) -> Option<u16> {
        self.advertiser.as_ref().map(|a| a.port)
    }

    /// Socket handle for the stream pair last returned by `connect` to `addr`.
    pub fn take_socket(&mut self, addr: SocketAddr) -> Option<TcpHandle> {
        self.sockets.remove(&addr)
    }

    /// Report `service` as found again on its next beacon.
    pub fn forget(&mut self, service: &ServiceRecord) {
        self.sockets.remove(&service.addr);
        if let Some(browser) = &self.browser {
            let _ = browser.forget.send(service.clone());
        }
    }
}

#[cfg(test)]
impl BeaconDiscovery {
    /// Send `forget` requests to the returned receiver instead of a browse task.
    pub(crate) fn intercept_forgets(&mut self) -> mpsc::UnboundedReceiver<ServiceRecord> {
        self.stop_browsing();
        let (forget, forgotten) = mpsc::unbounded_channel();
        self.browser = Some(Browser {
            task: tokio::spawn(async {}),
            forget,
        });
        forgotten
    }
}

impl Discovery for BeaconDiscovery {
    fn advertise(&mut self, service_name: &str, service_type: &str) -> Result<(), DiscoveryError> {
        self.stop_advertising();
        let listener = bind_listener(self.transport_port)
            .map_err(|e| DiscoveryError::Advertise(format!("listen: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| DiscoveryError::Advertise(e.to_string()))?
            .port();
        let socket =
            make_send_socket().map_err(|e| DiscoveryError::Advertise(format!("beacon: {e}")))?;
        let beacon = Beacon {
            protocol_version: PROTOCOL_VERSION,
            instance: self.instance,
            service_type: service_type.to_string(),
            service_name: service_name.to_string(),
            port,
        };
        let payload =
            bincode::serialize(&beacon).map_err(|e| DiscoveryError::Advertise(e.to_string()))?;
        let dest = SocketAddr::from((MULTICAST_GROUP, self.discovery_port));
        info!(service = service_name, port, "advertising service");
        let task = tokio::spawn(advertise_loop(
            listener,
            socket,
            payload,
            dest,
            self.events.clone(),
        ));
        self.advertiser = Some(Advertiser { task, port });
        Ok(())
    }

    fn stop_advertising(&mut self) {
        if let Some(advertiser) = self.advertiser.take() {
            advertiser.task.abort();
        }
    }

    fn browse(&mut self, service_type: &str) -> Result<(), DiscoveryError> {
        self.stop_browsing();
        let socket = make_multicast_socket(self.discovery_port)
            .map_err(|e| DiscoveryError::Browse(e.to_string()))?;
        let (forget, forget_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(browse_loop(
            socket,
            self.instance,
            service_type.to_string(),
            forget_rx,
            self.events.clone(),
        ));
        self.browser = Some(Browser { task, forget });
        Ok(())
    }

    fn stop_browsing(&mut self) {
        if let Some(browser) = self.browser.take() {
            browser.task.abort();
        }
    }

    /// The TCP connect itself happens when the handshake opens the streams.
    fn connect(&mut self, service: &ServiceRecord) -> Result<StreamPair, DiscoveryError> {
        let runtime = Handle::try_current().map_err(|e| DiscoveryError::Connect {
            name: service.name.clone(),
            source: std::io::Error::other(e),
        })?;
        let (streams, handle) = tcp::dial(service.addr, self.connect_timeout, runtime);
        self.sockets.insert(service.addr, handle);
        Ok(streams)
    }
}

impl Drop for BeaconDiscovery {
    fn drop(&mut self) {
        self.stop_advertising();
        self.stop_browsing();
    }
}

fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    let std_listener = std::net::TcpListener::bind(("0.0.0.0", port))?;
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

fn make_send_socket() -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

/// UDP socket on `port` that other local peers can bind as well.
fn bind_shared_udp(port: u16) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let socket = bind_shared_udp(discovery_port)?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    UdpSocket::from_std(socket.into())
}

async fn advertise_loop(
    listener: TcpListener,
    socket: UdpSocket,
    payload: Vec<u8>,
    dest: SocketAddr,
    events: mpsc::UnboundedSender<LoopEvent>,
) {
    let mut beacon = tokio::time::interval(BEACON_INTERVAL);
    loop {
        tokio::select! {
            _ = beacon.tick() => {
                if let Err(e) = socket.send_to(&payload, dest).await {
                    debug!(error = %e, "beacon send failed");
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, from)) => {
                    debug!(%from, "accepted connection");
                    let stream = match stream.into_std() {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(error = %e, "failed to detach accepted socket");
                            continue;
                        }
                    };
                    if events.send(LoopEvent::Accepted(stream)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = events.send(LoopEvent::AdvertiseFailed(DiscoveryError::Advertise(
                        format!("accept: {e}"),
                    )));
                    return;
                }
            },
        }
    }
}

struct Seen {
    record: ServiceRecord,
    last_seen: Instant,
    reported: bool,
}

/// Decide whether a beacon names a service we should report, and where it lives.
fn service_from_beacon(
    beacon: &Beacon,
    from: SocketAddr,
    own: PeerId,
    service_type: &str,
) -> Option<ServiceRecord> {
    if beacon.protocol_version != PROTOCOL_VERSION
        || beacon.instance == own
        || beacon.service_type != service_type
    {
        return None;
    }
    Some(ServiceRecord {
        name: beacon.service_name.clone(),
        service_type: beacon.service_type.clone(),
        addr: SocketAddr::new(from.ip(), beacon.port),
    })
}

/// The lower instance id dials.
fn should_dial(own: PeerId, remote: PeerId) -> bool {
    own.as_bytes() < remote.as_bytes()
}

async fn browse_loop(
    socket: UdpSocket,
    own: PeerId,
    service_type: String,
    mut forget: mpsc::UnboundedReceiver<ServiceRecord>,
    events: mpsc::UnboundedSender<LoopEvent>,
) {
    let mut services: HashMap<PeerId, Seen> = HashMap::new();
    let mut buf = vec![0u8; 65536];
    let mut expiry = tokio::time::interval(BEACON_INTERVAL);
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = events.send(LoopEvent::BrowseFailed(DiscoveryError::Browse(e.to_string())));
                        return;
                    }
                };
                let Ok(beacon) = bincode::deserialize::<Beacon>(&buf[..n]) else {
                    continue;
                };
                let Some(record) = service_from_beacon(&beacon, from, own, &service_type) else {
                    continue;
                };
                let seen = services.entry(beacon.instance).or_insert(Seen {
                    record: record.clone(),
                    last_seen: Instant::now(),
                    reported: false,
                });
                seen.last_seen = Instant::now();
                if seen.record != record {
                    seen.record = record;
                    seen.reported = false;
                }
                if !seen.reported && should_dial(own, beacon.instance) {
                    seen.reported = true;
                    if events.send(LoopEvent::ServiceFound(seen.record.clone())).is_err() {
                        return;
                    }
                }
            }
            Some(record) = forget.recv() => {
                for seen in services.values_mut() {
                    if seen.record == record {
                        seen.reported = false;
                    }
                }
            }
            _ = expiry.tick() => {
                let now = Instant::now();
                let expired: Vec<PeerId> = services
                    .iter()
                    .filter(|(_, s)| now.duration_since(s.last_seen) >= SERVICE_TIMEOUT)
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    if let Some(seen) = services.remove(&id) {
                        if seen.reported {
                            let _ = events.send(LoopEvent::ServiceLost(seen.record));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnet_core::SERVICE_TYPE;

    fn beacon(instance: PeerId) -> Beacon {
        Beacon {
            protocol_version: PROTOCOL_VERSION,
            instance,
            service_type: SERVICE_TYPE.into(),
            service_name: "Dungeon Master (den)".into(),
            port: 40100,
        }
    }

    #[test]
    fn beacon_survives_bincode() {
        let b = beacon(PeerId::generate());
        let bytes = bincode::serialize(&b).unwrap();
        assert_eq!(bincode::deserialize::<Beacon>(&bytes).unwrap(), b);
    }

    #[test]
    fn beacon_maps_to_sender_address_and_advertised_port() {
        let own = PeerId::generate();
        let from: SocketAddr = "192.168.1.7:45680".parse().unwrap();
        let record = service_from_beacon(&beacon(PeerId::generate()), from, own, SERVICE_TYPE)
            .unwrap();
        assert_eq!(record.addr, "192.168.1.7:40100".parse().unwrap());
        assert_eq!(record.name, "Dungeon Master (den)");
    }

    #[test]
    fn own_foreign_and_stale_beacons_ignored() {
        let own = PeerId::generate();
        let from: SocketAddr = "10.0.0.2:45680".parse().unwrap();
        assert!(service_from_beacon(&beacon(own), from, own, SERVICE_TYPE).is_none());
        assert!(service_from_beacon(&beacon(PeerId::generate()), from, own, "_other._tcp").is_none());
        let mut old = beacon(PeerId::generate());
        old.protocol_version = PROTOCOL_VERSION.wrapping_add(1);
        assert!(service_from_beacon(&old, from, own, SERVICE_TYPE).is_none());
    }

    #[test]
    fn exactly_one_side_dials() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(should_dial(a, b), should_dial(b, a));
        assert!(!should_dial(a, a));
    }

    #[test]
    fn two_browsers_share_the_discovery_port() {
        let first = bind_shared_udp(0).unwrap();
        let port = first.local_addr().unwrap().as_socket().unwrap().port();
        let second = bind_shared_udp(port).unwrap();
        assert_eq!(second.local_addr().unwrap().as_socket().unwrap().port(), port);
    }

    struct Browsing {
        beacons: UdpSocket,
        to: SocketAddr,
        forget: mpsc::UnboundedSender<ServiceRecord>,
        events: mpsc::UnboundedReceiver<LoopEvent>,
    }

    impl Browsing {
        async fn start(own: PeerId) -> Self {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let to = socket.local_addr().unwrap();
            let (forget, forget_rx) = mpsc::unbounded_channel();
            let (events_tx, events) = mpsc::unbounded_channel();
            tokio::spawn(browse_loop(socket, own, SERVICE_TYPE.into(), forget_rx, events_tx));
            Self {
                beacons: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
                to,
                forget,
                events,
            }
        }

        async fn send(&self, beacon: &Beacon) {
            let bytes = bincode::serialize(beacon).unwrap();
            self.beacons.send_to(&bytes, self.to).await.unwrap();
        }

        async fn next(&mut self) -> LoopEvent {
            self.events.recv().await.unwrap()
        }

        async fn quiet(&mut self) -> bool {
            tokio::time::timeout(Duration::from_secs(1), self.events.recv())
                .await
                .is_err()
        }
    }

    fn dialling_pair() -> (PeerId, PeerId) {
        let a = PeerId::generate();
        let b = PeerId::generate();
        if should_dial(a, b) {
            (a, b)
        } else {
            (b, a)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn browser_reports_once_until_forgotten() {
        let (own, remote) = dialling_pair();
        let mut browsing = Browsing::start(own).await;
        let remote_beacon = beacon(remote);

        browsing.send(&remote_beacon).await;
        let found = match browsing.next().await {
            LoopEvent::ServiceFound(record) => record,
            _ => panic!("expected the service to be found"),
        };
        assert_eq!(found.addr, "127.0.0.1:40100".parse().unwrap());

        browsing.send(&remote_beacon).await;
        assert!(browsing.quiet().await);

        browsing.forget.send(found.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        browsing.send(&remote_beacon).await;
        match browsing.next().await {
            LoopEvent::ServiceFound(record) => assert_eq!(record, found),
            _ => panic!("expected the service to be found again"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn higher_id_waits_to_be_dialled() {
        let (remote, own) = dialling_pair();
        let mut browsing = Browsing::start(own).await;
        browsing.send(&beacon(remote)).await;
        assert!(browsing.quiet().await);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_service_expires() {
        let (own, remote) = dialling_pair();
        let mut browsing = Browsing::start(own).await;
        let sent_at = Instant::now();
        browsing.send(&beacon(remote)).await;
        let found = match browsing.next().await {
            LoopEvent::ServiceFound(record) => record,
            _ => panic!("expected the service to be found"),
        };

        match browsing.next().await {
            LoopEvent::ServiceLost(record) => assert_eq!(record, found),
            _ => panic!("expected the service to expire"),
        }
        assert!(sent_at.elapsed() >= SERVICE_TIMEOUT);
    }
}
