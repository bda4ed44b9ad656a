//! The daemon's event loop: one task owns the peer manager and applies every event to it
//! in arrival order. Handshakes run on the blocking pool; discovery and socket watchers
//! run as their own tasks and report here.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::ops::ControlFlow;
use std::time::Duration;

use dnet_core::{
    DiscoveryError, HandshakeOutcome, PeerConfig, PeerId, PeerManager, PeerRole,
    PendingHandshake, ServiceRecord, StreamEvent, StreamSource,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::discovery::BeaconDiscovery;
use crate::session::{Command, Session};
use crate::tcp::{self, TcpHandle, Watch};

/// Everything the loop reacts to.
pub enum LoopEvent {
    ServiceFound(ServiceRecord),
    ServiceLost(ServiceRecord),
    Accepted(std::net::TcpStream),
    AdvertiseFailed(DiscoveryError),
    BrowseFailed(DiscoveryError),
    Handshaken {
        outcome: HandshakeOutcome,
        handle: TcpHandle,
    },
    Ready {
        peer: PeerId,
        readable: bool,
        writable: bool,
    },
    StreamError {
        peer: PeerId,
        error: io::Error,
    },
    Command(Command),
}

struct EventLoop {
    manager: PeerManager<BeaconDiscovery, Session>,
    watches: HashMap<PeerId, Watch>,
    events: mpsc::UnboundedSender<LoopEvent>,
    handshake_timeout: Duration,
    ack: Option<PeerId>,
}

/// Run as `role` until `shutdown` resolves or a `quit` command arrives.
pub async fn run(
    config: Config,
    role: PeerRole,
    shutdown: impl Future<Output = io::Result<()>>,
) -> anyhow::Result<()> {
    let (events, mut rx) = mpsc::unbounded_channel();
    let mut event_loop = EventLoop::new(&config, role, events.clone())?;
    info!(
        service = event_loop.manager.service_name(),
        %role,
        "dungeonnet starting"
    );

    tokio::spawn(read_commands(BufReader::new(tokio::io::stdin()), events));
    event_loop.manager.start();

    tokio::pin!(shutdown);
    loop {
        if event_loop.manager.has_deferred_work() {
            tokio::task::yield_now().await;
            event_loop.manager.run_deferred();
        }
        let event = tokio::select! {
            signal = &mut shutdown => {
                signal?;
                info!("shutdown signal received");
                break;
            }
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if event_loop.step(event).is_break() {
            break;
        }
    }

    event_loop.manager.stop();
    event_loop.flush();
    Ok(())
}

impl EventLoop {
    fn new(
        config: &Config,
        role: PeerRole,
        events: mpsc::UnboundedSender<LoopEvent>,
    ) -> anyhow::Result<Self> {
        let instance = PeerId::generate();
        let session = match role {
            PeerRole::Primary => Session::primary(config.build_encounter()?),
            PeerRole::Secondary => Session::secondary(),
        };
        let discovery = BeaconDiscovery::new(instance, config, events.clone());
        let manager = PeerManager::with_identity(
            instance,
            PeerConfig::new(config.service_name(role), role),
            discovery,
            session,
        );
        Ok(Self {
            manager,
            watches: HashMap::new(),
            events,
            handshake_timeout: config.handshake_timeout(),
            ack: None,
        })
    }

    /// Apply one event, then flush what it produced.
    fn step(&mut self, event: LoopEvent) -> ControlFlow<()> {
        let flow = self.handle(event);
        self.flush();
        flow
    }

    fn handle(&mut self, event: LoopEvent) -> ControlFlow<()> {
        match event {
            LoopEvent::ServiceFound(service) => self.service_found(service),
            LoopEvent::ServiceLost(service) => self.manager.service_lost(&service),
            LoopEvent::Accepted(socket) => match tcp::stream_pair(socket, self.handshake_timeout) {
                Ok((streams, handle)) => {
                    if let Some(pending) = self.manager.connection_accepted(streams) {
                        self.spawn_handshake(pending, handle);
                    }
                }
                Err(e) => warn!(error = %e, "failed to prepare accepted socket"),
            },
            LoopEvent::AdvertiseFailed(e) => self.manager.advertise_failed(e),
            LoopEvent::BrowseFailed(e) => self.manager.browse_failed(e),
            LoopEvent::Handshaken { outcome, handle } => self.handshaken(outcome, handle),
            LoopEvent::Ready {
                peer,
                readable,
                writable,
            } => {
                if readable {
                    self.manager.handle_stream_event(
                        peer,
                        StreamSource::Input,
                        StreamEvent::HasBytesAvailable,
                    );
                }
                if writable {
                    self.manager.handle_stream_event(
                        peer,
                        StreamSource::Output,
                        StreamEvent::HasSpaceAvailable,
                    );
                }
                self.ack = Some(peer);
            }
            LoopEvent::StreamError { peer, error } => self.manager.handle_stream_event(
                peer,
                StreamSource::Input,
                StreamEvent::ErrorOccurred(error),
            ),
            LoopEvent::Command(Command::Quit) => return ControlFlow::Break(()),
            LoopEvent::Command(command) => self.manager.observer_mut().execute(command),
        }
        ControlFlow::Continue(())
    }

    fn service_found(&mut self, service: ServiceRecord) {
        let addr = service.addr;
        let Some(pending) = self.manager.service_found(service.clone()) else {
            self.manager.discovery_mut().forget(&service);
            return;
        };
        match self.manager.discovery_mut().take_socket(addr) {
            Some(handle) => self.spawn_handshake(pending, handle),
            None => warn!(service = %service.name, "no socket for dialled service"),
        }
    }

    fn spawn_handshake(&self, pending: PendingHandshake, handle: TcpHandle) {
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = pending.perform();
            let _ = events.send(LoopEvent::Handshaken { outcome, handle });
        });
    }

    fn handshaken(&mut self, outcome: HandshakeOutcome, handle: TcpHandle) {
        let service = outcome.service().cloned();
        if outcome.remote().is_none() {
            if let Err(rejection) = self.manager.complete_handshake(outcome) {
                debug!(%rejection, "handshake failed");
            }
            if let Some(service) = service {
                self.manager.discovery_mut().forget(&service);
            }
            return;
        }
        // Streams go non-blocking before the observer can queue its first messages.
        let stream = match handle.activate() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to register socket");
                if let Some(service) = service {
                    self.manager.discovery_mut().forget(&service);
                }
                return;
            }
        };
        match self.manager.complete_handshake(outcome) {
            Ok(peer) if self.manager.connection(peer).is_some() => {
                self.watches
                    .insert(peer, tcp::watch(peer, stream, self.events.clone()));
            }
            Ok(_) => {}
            Err(rejection) => debug!(%rejection, "connection not admitted"),
        }
    }

    /// Broadcast what the session queued, retire watchers of closed connections, and
    /// update write interest.
    fn flush(&mut self) {
        loop {
            let outbox = self.manager.observer_mut().take_outbox();
            if outbox.is_empty() {
                break;
            }
            for message in outbox {
                self.manager.broadcast(message);
            }
        }
        for service in self.manager.observer_mut().take_closed_services() {
            self.manager.discovery_mut().forget(&service);
        }

        let manager = &self.manager;
        self.watches.retain(|peer, watch| match manager.connection(*peer) {
            Some(connection) => {
                watch.set_want_write(connection.has_pending_output());
                true
            }
            None => false,
        });
        if let Some(peer) = self.ack.take() {
            if let Some(watch) = self.watches.get(&peer) {
                watch.ack();
            }
        }
    }
}

/// Forward operator commands, one per line. Ends quietly at end of input.
async fn read_commands(
    input: impl AsyncBufRead + Unpin,
    events: mpsc::UnboundedSender<LoopEvent>,
) {
    let mut lines = input.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match line.parse::<Command>() {
                Ok(command) => {
                    if events.send(LoopEvent::Command(command)).is_err() {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "bad command"),
            },
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                return;
            }
        }
    }
}
