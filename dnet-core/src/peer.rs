//! Peer manager: advertising and browsing lifecycle, handshake admission, the live
//! connection table, broadcast.
//!
//! Host-driven like the rest of the crate. The host reports discovery results and stream
//! readiness; the manager answers with pending handshakes and callbacks on its observer.

use std::collections::HashMap;

use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionObserver};
use crate::discovery::{Discovery, DiscoveryError, ServiceRecord, SERVICE_TYPE};
use crate::handshake::{self, HandshakeError, HandshakeRecord};
use crate::identity::{PeerId, PeerRole};
use crate::protocol::Message;
use crate::stream::{StreamEvent, StreamPair, StreamSource};

/// Static configuration of a peer manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Name advertised for this instance's service.
    pub service_name: String,
    pub role: PeerRole,
    /// Roles a remote peer must have for its connection to be admitted.
    pub accepted_roles: Vec<PeerRole>,
}

impl PeerConfig {
    /// Config accepting only the counterpart of `role`.
    pub fn new(service_name: impl Into<String>, role: PeerRole) -> Self {
        Self {
            service_name: service_name.into(),
            role,
            accepted_roles: vec![role.counterpart()],
        }
    }
}

/// Application callbacks for the peer manager. Also receives every connection's messages
/// and close notification.
pub trait PeerObserver: ConnectionObserver {
    /// A handshake succeeded and the connection is registered. Closing it here declines it.
    fn on_connection_established(&mut self, connection: &mut Connection);
}

/// Why a stream pair did not become a connection. Its streams are closed in every case.
#[derive(Debug, thiserror::Error)]
pub enum Rejection {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("already connected to peer {0}")]
    AlreadyConnected(PeerId),
    #[error("peer {peer} has role {role}, which is not accepted")]
    RoleNotAccepted { peer: PeerId, role: PeerRole },
    #[error("peer manager is not running")]
    NotRunning,
    #[error("connected to ourselves")]
    SelfConnection,
}

/// Streams waiting for the blocking handshake. `Send`, so hosts can run `perform` on a worker.
#[derive(Debug)]
pub struct PendingHandshake {
    streams: StreamPair,
    service: Option<ServiceRecord>,
    local: HandshakeRecord,
}

impl PendingHandshake {
    pub fn service(&self) -> Option<&ServiceRecord> {
        self.service.as_ref()
    }

    /// Open the streams and exchange handshake records. Blocks until both records have
    /// moved or the streams fail.
    pub fn perform(mut self) -> HandshakeOutcome {
        let result = self
            .streams
            .input
            .open()
            .and_then(|_| self.streams.output.open())
            .map_err(HandshakeError::Open)
            .and_then(|_| {
                handshake::exchange(
                    self.streams.input.as_mut(),
                    self.streams.output.as_mut(),
                    &self.local,
                )
            });
        HandshakeOutcome {
            streams: self.streams,
            service: self.service,
            result,
        }
    }
}

/// Result of `PendingHandshake::perform`, handed back to the manager for admission.
#[derive(Debug)]
pub struct HandshakeOutcome {
    streams: StreamPair,
    service: Option<ServiceRecord>,
    result: Result<HandshakeRecord, HandshakeError>,
}

impl HandshakeOutcome {
    /// The remote's record, if the exchange succeeded.
    pub fn remote(&self) -> Option<&HandshakeRecord> {
        self.result.as_ref().ok()
    }

    pub fn service(&self) -> Option<&ServiceRecord> {
        self.service.as_ref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    Idle,
    Scheduled,
    Spent,
}

/// Owns this instance's identity and every live connection, keyed by remote peer.
pub struct PeerManager<D: Discovery, O: PeerObserver> {
    local: HandshakeRecord,
    config: PeerConfig,
    discovery: D,
    observer: O,
    connections: HashMap<PeerId, Connection>,
    running: bool,
    advertise_retry: Retry,
    browse_retry: Retry,
}

impl<D: Discovery, O: PeerObserver> PeerManager<D, O> {
    /// Create a manager with a freshly generated identity.
    pub fn new(config: PeerConfig, discovery: D, observer: O) -> Self {
        Self::with_identity(PeerId::generate(), config, discovery, observer)
    }

    pub fn with_identity(peer_id: PeerId, config: PeerConfig, discovery: D, observer: O) -> Self {
        Self {
            local: HandshakeRecord::new(peer_id, config.role),
            config,
            discovery,
            observer,
            connections: HashMap::new(),
            running: false,
            advertise_retry: Retry::Idle,
            browse_retry: Retry::Idle,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.local.peer_id
    }

    pub fn role(&self) -> PeerRole {
        self.local.role
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    pub fn discovery_mut(&mut self) -> &mut D {
        &mut self.discovery
    }

    /// Begin advertising and browsing. No-op while running.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        info!(peer = %self.local.peer_id, role = %self.local.role, "starting peer");
        self.running = true;
        self.advertise_retry = Retry::Idle;
        self.browse_retry = Retry::Idle;
        self.begin_advertising();
        self.begin_browsing();
    }

    /// Stop advertising and browsing and close every connection. No-op while stopped.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        info!(peer = %self.local.peer_id, "stopping peer");
        self.running = false;
        self.discovery.stop_advertising();
        self.discovery.stop_browsing();
        let peers: Vec<PeerId> = self.connections.keys().copied().collect();
        for peer in peers {
            self.close(peer);
        }
    }

    fn begin_advertising(&mut self) {
        if let Err(e) = self
            .discovery
            .advertise(&self.config.service_name, SERVICE_TYPE)
        {
            self.advertise_failed(e);
        }
    }

    fn begin_browsing(&mut self) {
        if let Err(e) = self.discovery.browse(SERVICE_TYPE) {
            self.browse_failed(e);
        }
    }

    /// Advertising could not start. Retried once, from `run_deferred`.
    pub fn advertise_failed(&mut self, error: DiscoveryError) {
        if !self.running {
            return;
        }
        self.advertise_retry = schedule_retry(self.advertise_retry, "advertising", &error);
    }

    /// Browsing could not start. Retried once, from `run_deferred`.
    pub fn browse_failed(&mut self, error: DiscoveryError) {
        if !self.running {
            return;
        }
        self.browse_retry = schedule_retry(self.browse_retry, "browsing", &error);
    }

    /// Whether a retry is waiting for the host to call `run_deferred`.
    pub fn has_deferred_work(&self) -> bool {
        self.running
            && (self.advertise_retry == Retry::Scheduled || self.browse_retry == Retry::Scheduled)
    }

    /// Run scheduled retries. Hosts call this after yielding to their scheduler.
    pub fn run_deferred(&mut self) {
        if !self.running {
            return;
        }
        if self.advertise_retry == Retry::Scheduled {
            self.advertise_retry = Retry::Spent;
            info!("retrying advertising");
            self.discovery.stop_advertising();
            self.begin_advertising();
        }
        if self.browse_retry == Retry::Scheduled {
            self.browse_retry = Retry::Spent;
            info!("retrying browsing");
            self.discovery.stop_browsing();
            self.begin_browsing();
        }
    }

    /// Browsing found a service. Returns the handshake to run when we dial it.
    pub fn service_found(&mut self, service: ServiceRecord) -> Option<PendingHandshake> {
        debug!(service = %service.name, addr = %service.addr, "found service");
        if !self.running {
            return None;
        }
        if service.name == self.config.service_name {
            debug!("ignoring our own service");
            return None;
        }
        match self.discovery.connect(&service) {
            Ok(streams) => Some(self.pending(streams, Some(service))),
            Err(e) => {
                warn!(error = %e, "failed to get streams");
                None
            }
        }
    }

    /// A previously found service disappeared. Connections made to it stay up.
    pub fn service_lost(&mut self, service: &ServiceRecord) {
        debug!(service = %service.name, "lost service");
        for connection in self.connections.values_mut() {
            if connection.service_lost(service) {
                debug!(peer = %connection.peer_id(), "advertisement gone, keeping connection");
            }
        }
    }

    /// Someone connected to our advertised service.
    pub fn connection_accepted(&mut self, mut streams: StreamPair) -> Option<PendingHandshake> {
        if !self.running {
            streams.close();
            return None;
        }
        debug!("accepted connection");
        Some(self.pending(streams, None))
    }

    fn pending(&self, streams: StreamPair, service: Option<ServiceRecord>) -> PendingHandshake {
        PendingHandshake {
            streams,
            service,
            local: self.local,
        }
    }

    /// Admit or reject a finished handshake. Runs on the event loop so admission is
    /// serialized against every other mutation of the connection table.
    pub fn complete_handshake(&mut self, outcome: HandshakeOutcome) -> Result<PeerId, Rejection> {
        let HandshakeOutcome {
            mut streams,
            service,
            result,
        } = outcome;
        let remote = match self.admit(result) {
            Ok(remote) => remote,
            Err(rejection) => {
                warn!(%rejection, "dropping connection");
                streams.close();
                return Err(rejection);
            }
        };
        info!(peer = %remote.peer_id, role = %remote.role, "established connection");
        let connection = self
            .connections
            .entry(remote.peer_id)
            .or_insert(Connection::new(remote.peer_id, remote.role, streams, service));
        self.observer.on_connection_established(connection);
        self.reap(remote.peer_id);
        Ok(remote.peer_id)
    }

    fn admit(
        &self,
        result: Result<HandshakeRecord, HandshakeError>,
    ) -> Result<HandshakeRecord, Rejection> {
        let remote = result?;
        if !self.running {
            return Err(Rejection::NotRunning);
        }
        if remote.peer_id == self.local.peer_id {
            return Err(Rejection::SelfConnection);
        }
        if self.connections.contains_key(&remote.peer_id) {
            return Err(Rejection::AlreadyConnected(remote.peer_id));
        }
        if !self.config.accepted_roles.contains(&remote.role) {
            return Err(Rejection::RoleNotAccepted {
                peer: remote.peer_id,
                role: remote.role,
            });
        }
        Ok(remote)
    }

    /// Handshake and admit in one blocking call.
    pub fn establish_connection(
        &mut self,
        streams: StreamPair,
        service: Option<ServiceRecord>,
    ) -> Result<PeerId, Rejection> {
        let outcome = self.pending(streams, service).perform();
        self.complete_handshake(outcome)
    }

    /// Deliver a readiness event to the connection with `peer`.
    pub fn handle_stream_event(&mut self, peer: PeerId, source: StreamSource, event: StreamEvent) {
        let Some(connection) = self.connections.get_mut(&peer) else {
            debug!(%peer, ?event, "event for unknown connection");
            return;
        };
        connection.handle_event(source, event, &mut self.observer);
        self.reap(peer);
    }

    /// Send to one peer. Returns false if there is no live connection to it.
    pub fn send_to(&mut self, peer: PeerId, message: Message) -> bool {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return false;
        };
        connection.send(message);
        self.reap(peer);
        true
    }

    /// Send to every live connection. Connections fail independently.
    pub fn broadcast(&mut self, message: Message) {
        let peers: Vec<PeerId> = self.connections.keys().copied().collect();
        for peer in peers {
            if let Some(connection) = self.connections.get_mut(&peer) {
                connection.send(message.clone());
            }
            self.reap(peer);
        }
    }

    /// Close the connection to `peer`. Returns false if there was none.
    pub fn close(&mut self, peer: PeerId) -> bool {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return false;
        };
        connection.close();
        self.reap(peer);
        true
    }

    /// Deregister `peer` once its connection has closed. No-op if open or already gone.
    fn reap(&mut self, peer: PeerId) {
        let closed = match self.connections.get_mut(&peer) {
            Some(connection) if !connection.is_open() => {
                connection.report_closed(&mut self.observer);
                true
            }
            _ => false,
        };
        if closed {
            self.connections.remove(&peer);
            info!(%peer, "removed connection");
        }
    }

    pub fn connection(&self, peer: PeerId) -> Option<&Connection> {
        self.connections.get(&peer)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl<D: Discovery, O: PeerObserver> Drop for PeerManager<D, O> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn schedule_retry(state: Retry, what: &str, error: &DiscoveryError) -> Retry {
    match state {
        Retry::Idle => {
            warn!(%error, "{what} was not successful, retrying once");
            Retry::Scheduled
        }
        Retry::Scheduled => Retry::Scheduled,
        Retry::Spent => {
            error!(%error, "{what} was not successful, giving up");
            Retry::Spent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HANDSHAKE_SIZE;
    use crate::stream::memory::{duplex, PipeControl};
    use crate::wire;
    use std::collections::VecDeque;
    use std::io;
    use std::net::SocketAddr;

    #[derive(Default)]
    struct MockDiscovery {
        advertised: Vec<String>,
        browsed: usize,
        stopped_advertising: usize,
        stopped_browsing: usize,
        advertise_failures: usize,
        browse_failures: usize,
        dialable: VecDeque<StreamPair>,
        dialed: Vec<String>,
    }

    impl Discovery for MockDiscovery {
        fn advertise(&mut self, name: &str, service_type: &str) -> Result<(), DiscoveryError> {
            assert_eq!(service_type, SERVICE_TYPE);
            self.advertised.push(name.to_string());
            if self.advertise_failures > 0 {
                self.advertise_failures -= 1;
                return Err(DiscoveryError::Advertise("name conflict".into()));
            }
            Ok(())
        }

        fn stop_advertising(&mut self) {
            self.stopped_advertising += 1;
        }

        fn browse(&mut self, _service_type: &str) -> Result<(), DiscoveryError> {
            self.browsed += 1;
            if self.browse_failures > 0 {
                self.browse_failures -= 1;
                return Err(DiscoveryError::Browse("no interface".into()));
            }
            Ok(())
        }

        fn stop_browsing(&mut self) {
            self.stopped_browsing += 1;
        }

        fn connect(&mut self, service: &ServiceRecord) -> Result<StreamPair, DiscoveryError> {
            self.dialed.push(service.name.clone());
            self.dialable.pop_front().ok_or_else(|| DiscoveryError::Connect {
                name: service.name.clone(),
                source: io::ErrorKind::ConnectionRefused.into(),
            })
        }
    }

    #[derive(Default)]
    struct Table {
        established: Vec<PeerId>,
        messages: Vec<(PeerId, Message)>,
        closed: Vec<PeerId>,
        decline: bool,
    }

    impl ConnectionObserver for Table {
        fn on_message(&mut self, connection: &mut Connection, message: Message) {
            self.messages.push((connection.peer_id(), message));
        }

        fn on_closed(&mut self, connection: &Connection) {
            self.closed.push(connection.peer_id());
        }
    }

    impl PeerObserver for Table {
        fn on_connection_established(&mut self, connection: &mut Connection) {
            self.established.push(connection.peer_id());
            if self.decline {
                connection.close();
            }
        }
    }

    /// The far end of a connection, from the test's side of the pipes.
    struct Remote {
        record: HandshakeRecord,
        /// Bytes the manager wrote to the remote.
        from_local: PipeControl,
        /// Bytes the remote sends to the manager.
        to_local: PipeControl,
    }

    impl Remote {
        /// Stream pair for the manager with the remote's handshake record already in flight.
        fn new(peer_id: PeerId, role: PeerRole) -> (StreamPair, Remote) {
            Self::with_record_bytes(HandshakeRecord::new(peer_id, role), |b| b)
        }

        fn with_record_bytes(
            record: HandshakeRecord,
            tamper: impl FnOnce([u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE],
        ) -> (StreamPair, Remote) {
            let (local, _remote_pair, from_local, to_local) = duplex();
            to_local.inject(&tamper(record.to_bytes()));
            (
                local,
                Remote {
                    record,
                    from_local,
                    to_local,
                },
            )
        }

        /// Switch to connection mode and consume the manager's handshake record.
        fn connected(&self) -> [u8; HANDSHAKE_SIZE] {
            self.from_local.set_blocking(false);
            self.to_local.set_blocking(false);
            let bytes = self.from_local.drain();
            let mut record = [0u8; HANDSHAKE_SIZE];
            record.copy_from_slice(&bytes[..HANDSHAKE_SIZE]);
            record
        }

        fn send(&self, message: &Message) {
            self.to_local.inject(&wire::encode_frame(message).unwrap());
        }

        fn received(&self) -> Vec<Message> {
            let bytes = self.from_local.drain();
            let mut out = Vec::new();
            let mut rest = &bytes[..];
            while !rest.is_empty() {
                let (m, n) = wire::decode_frame(rest).unwrap();
                out.push(m);
                rest = &rest[n..];
            }
            out
        }
    }

    fn primary() -> PeerManager<MockDiscovery, Table> {
        let mut manager = PeerManager::new(
            PeerConfig::new("Dungeon Master (table)", PeerRole::Primary),
            MockDiscovery::default(),
            Table::default(),
        );
        manager.start();
        manager
    }

    fn service(name: &str) -> ServiceRecord {
        ServiceRecord {
            name: name.into(),
            service_type: SERVICE_TYPE.into(),
            addr: SocketAddr::from(([192, 168, 1, 20], 50000)),
        }
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let mut manager = primary();
        manager.start();
        assert_eq!(manager.discovery().advertised, vec!["Dungeon Master (table)"]);
        assert_eq!(manager.discovery().browsed, 1);
        manager.stop();
        manager.stop();
        assert_eq!(manager.discovery().stopped_advertising, 1);
        assert_eq!(manager.discovery().stopped_browsing, 1);
        assert!(!manager.is_running());
    }

    #[test]
    fn handshake_registers_connection() {
        let mut manager = primary();
        let remote_id = PeerId::generate();
        let (streams, remote) = Remote::new(remote_id, PeerRole::Secondary);
        let peer = manager.establish_connection(streams, None).unwrap();
        assert_eq!(peer, remote_id);
        assert_eq!(manager.observer().established, vec![remote_id]);
        assert_eq!(manager.connection(remote_id).unwrap().role(), PeerRole::Secondary);

        let sent = remote.connected();
        let local = HandshakeRecord::from_bytes(&sent).unwrap();
        assert_eq!(local, HandshakeRecord::new(manager.peer_id(), PeerRole::Primary));
    }

    #[test]
    fn messages_flow_both_ways_after_handshake() {
        let mut manager = primary();
        let remote_id = PeerId::generate();
        let (streams, remote) = Remote::new(remote_id, PeerRole::Secondary);
        manager.establish_connection(streams, None).unwrap();
        remote.connected();

        remote.send(&Message::EndTurn { name: "Sam".into() });
        manager.handle_stream_event(remote_id, StreamSource::Input, StreamEvent::HasBytesAvailable);
        assert_eq!(
            manager.observer().messages,
            vec![(remote_id, Message::EndTurn { name: "Sam".into() })]
        );

        assert!(manager.send_to(remote_id, Message::Round { round: 2 }));
        assert_eq!(remote.received(), vec![Message::Round { round: 2 }]);
        assert!(!manager.send_to(PeerId::generate(), Message::Round { round: 2 }));
    }

    #[test]
    fn duplicate_identity_rejected() {
        let mut manager = primary();
        let remote_id = PeerId::generate();
        let (first, _r1) = Remote::new(remote_id, PeerRole::Secondary);
        let (second, r2) = Remote::new(remote_id, PeerRole::Secondary);
        manager.establish_connection(first, None).unwrap();
        let err = manager.establish_connection(second, None).unwrap_err();
        assert!(matches!(err, Rejection::AlreadyConnected(p) if p == remote_id));
        assert_eq!(manager.connection_count(), 1);
        assert!(r2.to_local.reader_closed());
        assert!(r2.from_local.writer_closed());
        assert!(manager.connection(remote_id).unwrap().is_open());
    }

    #[test]
    fn simultaneous_handshakes_admit_exactly_one() {
        let mut manager = primary();
        let remote_id = PeerId::generate();
        let (first, _r1) = Remote::new(remote_id, PeerRole::Secondary);
        let (second, _r2) = Remote::new(remote_id, PeerRole::Secondary);
        let a = manager.connection_accepted(first).unwrap();
        let b = manager.connection_accepted(second).unwrap();
        let ta = std::thread::spawn(move || a.perform());
        let tb = std::thread::spawn(move || b.perform());
        let outcomes = [ta.join().unwrap(), tb.join().unwrap()];
        let results: Vec<_> = outcomes
            .into_iter()
            .map(|o| manager.complete_handshake(o))
            .collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.observer().established, vec![remote_id]);
    }

    #[test]
    fn role_not_accepted() {
        let mut manager = primary();
        let (streams, remote) = Remote::new(PeerId::generate(), PeerRole::Primary);
        let err = manager.establish_connection(streams, None).unwrap_err();
        assert!(matches!(err, Rejection::RoleNotAccepted { role: PeerRole::Primary, .. }));
        assert_eq!(manager.connection_count(), 0);
        assert!(remote.to_local.reader_closed());
        assert!(manager.observer().established.is_empty());
    }

    #[test]
    fn invalid_role_byte_rejected() {
        let mut manager = primary();
        let record = HandshakeRecord::new(PeerId::generate(), PeerRole::Secondary);
        let (streams, _remote) = Remote::with_record_bytes(record, |mut b| {
            b[16] = 0x07;
            b
        });
        let err = manager.establish_connection(streams, None).unwrap_err();
        assert!(matches!(err, Rejection::Handshake(HandshakeError::InvalidRole(0x07))));
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn short_handshake_read_rejected() {
        let mut manager = primary();
        let (local, _remote_pair, _from_local, to_local) = duplex();
        to_local.inject(&[0u8; 9]);
        to_local.close_writer();
        let err = manager.establish_connection(local, None).unwrap_err();
        assert!(matches!(err, Rejection::Handshake(HandshakeError::Read(_))));
    }

    #[test]
    fn handshake_with_ourselves_rejected() {
        let mut manager = primary();
        let (streams, _remote) = Remote::new(manager.peer_id(), PeerRole::Secondary);
        let err = manager.establish_connection(streams, None).unwrap_err();
        assert!(matches!(err, Rejection::SelfConnection));
    }

    #[test]
    fn declined_connection_is_closed_and_removed() {
        let mut manager = primary();
        manager.observer_mut().decline = true;
        let remote_id = PeerId::generate();
        let (streams, remote) = Remote::new(remote_id, PeerRole::Secondary);
        manager.establish_connection(streams, None).unwrap();
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.observer().closed, vec![remote_id]);
        assert!(remote.to_local.reader_closed());
    }

    #[test]
    fn closed_connection_is_removed_once() {
        let mut manager = primary();
        let remote_id = PeerId::generate();
        let (streams, remote) = Remote::new(remote_id, PeerRole::Secondary);
        manager.establish_connection(streams, None).unwrap();
        remote.connected();
        remote.to_local.close_writer();
        manager.handle_stream_event(remote_id, StreamSource::Input, StreamEvent::HasBytesAvailable);
        manager.handle_stream_event(remote_id, StreamSource::Input, StreamEvent::EndEncountered);
        assert!(!manager.close(remote_id));
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.observer().closed, vec![remote_id]);
    }

    #[test]
    fn stop_closes_every_connection() {
        let mut manager = primary();
        let ids: Vec<PeerId> = (0..3).map(|_| PeerId::generate()).collect();
        let mut remotes = Vec::new();
        for id in &ids {
            let (streams, remote) = Remote::new(*id, PeerRole::Secondary);
            manager.establish_connection(streams, None).unwrap();
            remotes.push(remote);
        }
        manager.stop();
        assert_eq!(manager.connection_count(), 0);
        let mut closed = manager.observer().closed.clone();
        closed.sort_by_key(|p| *p.as_bytes());
        let mut expected = ids.clone();
        expected.sort_by_key(|p| *p.as_bytes());
        assert_eq!(closed, expected);
        assert!(remotes.iter().all(|r| r.to_local.reader_closed()));
    }

    #[test]
    fn broadcast_survives_a_failing_connection() {
        let mut manager = primary();
        let good_id = PeerId::generate();
        let bad_id = PeerId::generate();
        let (good_streams, good) = Remote::new(good_id, PeerRole::Secondary);
        let (bad_streams, bad) = Remote::new(bad_id, PeerRole::Secondary);
        manager.establish_connection(good_streams, None).unwrap();
        manager.establish_connection(bad_streams, None).unwrap();
        good.connected();
        bad.connected();
        bad.from_local.fail_writes(io::ErrorKind::ConnectionReset);

        manager.broadcast(Message::Round { round: 4 });
        assert_eq!(good.received(), vec![Message::Round { round: 4 }]);
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.observer().closed, vec![bad_id]);
    }

    #[test]
    fn advertise_failure_retried_exactly_once() {
        let mut manager = PeerManager::new(
            PeerConfig::new("Initiative Order (tv)", PeerRole::Secondary),
            MockDiscovery {
                advertise_failures: 5,
                ..Default::default()
            },
            Table::default(),
        );
        manager.start();
        assert!(manager.has_deferred_work());
        assert_eq!(manager.discovery().advertised.len(), 1);

        manager.run_deferred();
        assert_eq!(manager.discovery().advertised.len(), 2);
        assert!(!manager.has_deferred_work());

        manager.advertise_failed(DiscoveryError::Advertise("late".into()));
        manager.run_deferred();
        assert_eq!(manager.discovery().advertised.len(), 2);
        assert_eq!(manager.discovery().browsed, 1);
    }

    #[test]
    fn browse_retry_recovers() {
        let mut manager = PeerManager::new(
            PeerConfig::new("Initiative Order (tv)", PeerRole::Secondary),
            MockDiscovery {
                browse_failures: 1,
                ..Default::default()
            },
            Table::default(),
        );
        manager.start();
        manager.browse_failed(DiscoveryError::Browse("again".into()));
        assert!(manager.has_deferred_work());
        manager.run_deferred();
        assert_eq!(manager.discovery().browsed, 2);
        assert_eq!(manager.discovery().stopped_browsing, 1);
        assert!(!manager.has_deferred_work());
    }

    #[test]
    fn restart_resets_retry_budget() {
        let mut manager = PeerManager::new(
            PeerConfig::new("Initiative Order (tv)", PeerRole::Secondary),
            MockDiscovery {
                advertise_failures: 2,
                ..Default::default()
            },
            Table::default(),
        );
        manager.start();
        manager.run_deferred();
        manager.stop();
        manager.start();
        assert!(!manager.has_deferred_work());
        assert_eq!(manager.discovery().advertised.len(), 3);
    }

    #[test]
    fn own_service_ignored_and_found_service_dialed() {
        let mut manager = primary();
        assert!(manager.service_found(service("Dungeon Master (table)")).is_none());
        assert!(manager.discovery().dialed.is_empty());

        let remote_id = PeerId::generate();
        let (streams, _remote) = Remote::new(remote_id, PeerRole::Secondary);
        manager.discovery_mut().dialable.push_back(streams);
        let pending = manager.service_found(service("Initiative Order (tv)")).unwrap();
        assert_eq!(pending.service().unwrap().name, "Initiative Order (tv)");
        manager.complete_handshake(pending.perform()).unwrap();
        assert_eq!(
            manager.connection(remote_id).unwrap().service().unwrap().name,
            "Initiative Order (tv)"
        );

        assert!(manager.service_found(service("Unreachable")).is_none());
    }

    #[test]
    fn service_lost_keeps_connection() {
        let mut manager = primary();
        let remote_id = PeerId::generate();
        let (streams, _remote) = Remote::new(remote_id, PeerRole::Secondary);
        let svc = service("Initiative Order (tv)");
        manager.establish_connection(streams, Some(svc.clone())).unwrap();
        manager.service_lost(&svc);
        let connection = manager.connection(remote_id).unwrap();
        assert!(connection.is_open());
        assert!(connection.service().is_none());
    }

    #[test]
    fn stopped_manager_refuses_streams() {
        let mut manager = primary();
        let pending = {
            let (streams, _remote) = Remote::new(PeerId::generate(), PeerRole::Secondary);
            manager.connection_accepted(streams).unwrap()
        };
        manager.stop();
        let err = manager.complete_handshake(pending.perform()).unwrap_err();
        assert!(matches!(err, Rejection::NotRunning));

        let (streams, remote) = Remote::new(PeerId::generate(), PeerRole::Secondary);
        assert!(manager.connection_accepted(streams).is_none());
        assert!(remote.to_local.reader_closed());
    }
}
