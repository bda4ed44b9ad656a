//! One established channel to one remote peer: framing, buffering, send queue, lifecycle.

use std::collections::VecDeque;
use std::io;

use tracing::{debug, trace, warn};

use crate::discovery::ServiceRecord;
use crate::identity::{PeerId, PeerRole};
use crate::protocol::Message;
use crate::stream::{InputStream, OutputStream, StreamEvent, StreamPair, StreamSource};
use crate::wire::{self, FrameDecodeError};

/// Bytes pulled from the input stream per read call.
const READ_CHUNK: usize = 1024;

/// Receives decoded messages and the close notification of a connection.
pub trait ConnectionObserver {
    /// A complete message arrived. The observer may send on or close the connection here.
    fn on_message(&mut self, connection: &mut Connection, message: Message);

    /// The connection closed. Delivered exactly once.
    fn on_closed(&mut self, connection: &Connection);
}

/// A live, message-oriented channel to one remote peer.
///
/// Created by the peer manager after a successful handshake. Events from the host's event
/// loop drive the read and write loops; `send` never blocks, the queue absorbs backpressure.
pub struct Connection {
    peer_id: PeerId,
    role: PeerRole,
    input: Box<dyn InputStream>,
    output: Box<dyn OutputStream>,
    service: Option<ServiceRecord>,
    outgoing: VecDeque<Message>,
    /// Frame currently being written and how much of it has gone out.
    in_flight: Vec<u8>,
    in_flight_written: usize,
    input_buffer: Vec<u8>,
    writable: bool,
    open: bool,
    close_reported: bool,
}

impl Connection {
    pub fn new(
        peer_id: PeerId,
        role: PeerRole,
        streams: StreamPair,
        service: Option<ServiceRecord>,
    ) -> Self {
        Self {
            peer_id,
            role,
            input: streams.input,
            output: streams.output,
            service,
            outgoing: VecDeque::new(),
            in_flight: Vec::new(),
            in_flight_written: 0,
            input_buffer: Vec::new(),
            writable: true,
            open: true,
            close_reported: false,
        }
    }

    /// Identity of the remote peer.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Role the remote peer announced.
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// The advertised service this connection was opened to, if we dialled it.
    pub fn service(&self) -> Option<&ServiceRecord> {
        self.service.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Messages waiting behind the frame currently being written.
    pub fn queued(&self) -> usize {
        self.outgoing.len()
    }

    /// Whether anything is waiting for write capacity.
    pub fn has_pending_output(&self) -> bool {
        self.open && (!self.outgoing.is_empty() || self.in_flight_written < self.in_flight.len())
    }

    /// Queue a message; written immediately if the output stream has room.
    pub fn send(&mut self, message: Message) {
        if !self.open {
            debug!(peer = %self.peer_id, ?message, "dropping message for closed connection");
            return;
        }
        trace!(peer = %self.peer_id, ?message, "queued message");
        self.outgoing.push_back(message);
        if self.writable {
            self.write_outgoing();
        }
    }

    /// Close both streams. Idempotent; the observer hears about it once via `report_closed`
    /// (or at the end of the event that caused it).
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        debug!(peer = %self.peer_id, "closing connection");
        self.open = false;
        self.outgoing.clear();
        self.in_flight.clear();
        self.in_flight_written = 0;
        self.input.close();
        self.output.close();
    }

    /// Deliver `on_closed` if the connection has closed and the observer has not been told yet.
    pub fn report_closed(&mut self, observer: &mut dyn ConnectionObserver) {
        if !self.open && !self.close_reported {
            self.close_reported = true;
            observer.on_closed(self);
        }
    }

    /// The advertisement that led here went away. Informational; the connection stays up.
    pub(crate) fn service_lost(&mut self, service: &ServiceRecord) -> bool {
        if self.service.as_ref() == Some(service) {
            self.service = None;
            return true;
        }
        false
    }

    /// Handle one readiness event from the host's event loop.
    pub fn handle_event(
        &mut self,
        source: StreamSource,
        event: StreamEvent,
        observer: &mut dyn ConnectionObserver,
    ) {
        if self.open {
            match event {
                StreamEvent::OpenCompleted => {
                    trace!(peer = %self.peer_id, ?source, "open completed");
                }
                StreamEvent::HasBytesAvailable => self.read_incoming(observer),
                StreamEvent::HasSpaceAvailable => {
                    self.writable = true;
                    self.write_outgoing();
                }
                StreamEvent::ErrorOccurred(e) => {
                    warn!(peer = %self.peer_id, ?source, error = %e, "stream error");
                    self.close();
                }
                StreamEvent::EndEncountered => {
                    debug!(peer = %self.peer_id, ?source, "end of stream encountered");
                    self.close();
                }
            }
        }
        self.report_closed(observer);
    }

    /// Drain the input stream, then dispatch every complete frame in the buffer.
    fn read_incoming(&mut self, observer: &mut dyn ConnectionObserver) {
        let mut chunk = [0u8; READ_CHUNK];
        let mut end_of_stream = false;
        loop {
            match self.input.read(&mut chunk) {
                Ok(0) => {
                    end_of_stream = true;
                    break;
                }
                Ok(n) => self.input_buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(peer = %self.peer_id, error = %e, "error in input stream");
                    self.close();
                    return;
                }
            }
        }

        self.dispatch_frames(observer);

        if end_of_stream && self.open {
            debug!(peer = %self.peer_id, "end of stream encountered");
            self.close();
        }
    }

    fn dispatch_frames(&mut self, observer: &mut dyn ConnectionObserver) {
        let mut consumed = 0;
        while self.open {
            match wire::decode_frame(&self.input_buffer[consumed..]) {
                Ok((message, n)) => {
                    consumed += n;
                    debug!(peer = %self.peer_id, ?message, "received message");
                    observer.on_message(self, message);
                }
                Err(FrameDecodeError::NeedMore) => break,
                Err(e) => {
                    warn!(peer = %self.peer_id, error = %e, "received unparseable message, closing connection");
                    self.close();
                }
            }
        }
        self.input_buffer.drain(..consumed);
    }

    /// Write queued frames while the stream takes them. A short write keeps the remainder
    /// in flight and resumes on the next `HasSpaceAvailable`.
    fn write_outgoing(&mut self) {
        while self.open && self.writable {
            if self.in_flight_written >= self.in_flight.len() {
                let Some(message) = self.outgoing.pop_front() else {
                    break;
                };
                match wire::encode_frame(&message) {
                    Ok(frame) => {
                        debug!(peer = %self.peer_id, ?message, "sending message");
                        self.in_flight = frame;
                        self.in_flight_written = 0;
                    }
                    Err(e) => {
                        warn!(peer = %self.peer_id, error = %e, "dropping unsendable message");
                        continue;
                    }
                }
            }
            match self.output.write(&self.in_flight[self.in_flight_written..]) {
                Ok(0) => {
                    warn!(peer = %self.peer_id, "output stream accepted no bytes, closing connection");
                    self.close();
                }
                Ok(n) => {
                    self.in_flight_written += n;
                    if self.in_flight_written < self.in_flight.len() {
                        trace!(peer = %self.peer_id, written = n, "short write, resuming later");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.writable = false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(peer = %self.peer_id, error = %e, "error in output stream");
                    self.close();
                }
            }
        }
        if self.in_flight_written >= self.in_flight.len() {
            self.in_flight.clear();
            self.in_flight_written = 0;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("open", &self.open)
            .field("queued", &self.outgoing.len())
            .finish()
    }
}
