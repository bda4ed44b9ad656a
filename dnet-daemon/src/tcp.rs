//! TCP stream adapters: blocking std sockets for the handshake, then the same socket
//! registered with tokio for readiness, plus the per-connection watcher task.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dnet_core::{InputStream, OutputStream, PeerId, StreamPair};
use tokio::io::Interest;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::node::LoopEvent;

/// Socket state shared by both halves and the daemon's handle.
struct Shared {
    dial: Option<Dial>,
    timeout: Duration,
    socket: OnceLock<TcpStream>,
    registered: OnceLock<Arc<tokio::net::TcpStream>>,
}

/// Where an outgoing socket connects once its streams are opened.
struct Dial {
    addr: SocketAddr,
    runtime: Handle,
}

impl Shared {
    fn socket(&self) -> io::Result<&TcpStream> {
        self.socket
            .get()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    /// Connect a dialled socket. Blocks the calling thread, so it runs with the handshake.
    fn open(&self) -> io::Result<()> {
        if self.socket.get().is_some() {
            return Ok(());
        }
        let Some(dial) = &self.dial else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let socket = dial.connect(self.timeout)?;
        configure(&socket, self.timeout)?;
        let _ = self.socket.set(socket);
        Ok(())
    }
}

impl Dial {
    /// Must not run on a runtime worker thread.
    fn connect(&self, timeout: Duration) -> io::Result<TcpStream> {
        let addr = self.addr;
        let connected = self.runtime.block_on(async move {
            tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await
        });
        match connected {
            Ok(stream) => stream?.into_std(),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connecting to {addr} timed out"),
            )),
        }
    }
}

fn configure(socket: &TcpStream, timeout: Duration) -> io::Result<()> {
    socket.set_nonblocking(false)?;
    socket.set_nodelay(true)?;
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))
}

/// Read half. Blocking std reads until activated, then tokio `try_read`.
pub struct TcpInput(Arc<Shared>);

/// Write half. Blocking std writes until activated, then tokio `try_write`.
pub struct TcpOutput(Arc<Shared>);

/// Daemon-side handle on a socket whose streams are owned by the peer manager.
pub struct TcpHandle(Arc<Shared>);

fn split(shared: Shared) -> (StreamPair, TcpHandle) {
    let shared = Arc::new(shared);
    let streams = StreamPair::new(TcpInput(shared.clone()), TcpOutput(shared.clone()));
    (streams, TcpHandle(shared))
}

/// Split an accepted `socket` into a stream pair for the handshake. Reads and writes block
/// for at most `timeout` until the handle is activated.
pub fn stream_pair(socket: TcpStream, timeout: Duration) -> io::Result<(StreamPair, TcpHandle)> {
    configure(&socket, timeout)?;
    Ok(split(Shared {
        dial: None,
        timeout,
        socket: OnceLock::from(socket),
        registered: OnceLock::new(),
    }))
}

/// Stream pair to `addr` that connects when opened, giving up after `timeout`. The connect
/// is driven on `runtime` from whichever blocking thread opens the streams.
pub fn dial(addr: SocketAddr, timeout: Duration, runtime: Handle) -> (StreamPair, TcpHandle) {
    split(Shared {
        dial: Some(Dial { addr, runtime }),
        timeout,
        socket: OnceLock::new(),
        registered: OnceLock::new(),
    })
}

impl TcpHandle {
    /// Switch the socket to non-blocking and register it with the runtime. Must run inside
    /// a tokio runtime.
    pub fn activate(&self) -> io::Result<Arc<tokio::net::TcpStream>> {
        if let Some(stream) = self.0.registered.get() {
            return Ok(stream.clone());
        }
        let socket = self.0.socket()?;
        socket.set_read_timeout(None)?;
        socket.set_write_timeout(None)?;
        socket.set_nonblocking(true)?;
        let stream = Arc::new(tokio::net::TcpStream::from_std(socket.try_clone()?)?);
        Ok(self.0.registered.get_or_init(|| stream).clone())
    }
}

impl Read for TcpInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.registered.get() {
            Some(stream) => stream.try_read(buf),
            None => self.0.socket()?.read(buf),
        }
    }
}

impl InputStream for TcpInput {
    fn open(&mut self) -> io::Result<()> {
        self.0.open()
    }

    fn close(&mut self) {
        if let Some(socket) = self.0.socket.get() {
            let _ = socket.shutdown(Shutdown::Read);
        }
    }
}

impl Write for TcpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.registered.get() {
            Some(stream) => stream.try_write(buf),
            None => self.0.socket()?.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl OutputStream for TcpOutput {
    fn open(&mut self) -> io::Result<()> {
        self.0.open()
    }

    fn close(&mut self) {
        if let Some(socket) = self.0.socket.get() {
            let _ = socket.shutdown(Shutdown::Write);
        }
    }
}

/// Readiness watcher of one connection. Aborted on drop.
pub struct Watch {
    want_write: Arc<AtomicBool>,
    wake: Arc<Notify>,
    ack: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Watch {
    /// Also wait for write capacity while the connection has output queued.
    pub fn set_want_write(&self, want: bool) {
        if self.want_write.swap(want, Ordering::AcqRel) != want {
            self.wake.notify_one();
        }
    }

    /// The loop has handled the last readiness report.
    pub fn ack(&self) {
        self.ack.notify_one();
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Report readiness of `stream` as `LoopEvent::Ready`, one report in flight at a time.
pub fn watch(
    peer: PeerId,
    stream: Arc<tokio::net::TcpStream>,
    events: mpsc::UnboundedSender<LoopEvent>,
) -> Watch {
    let want_write = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    let ack = Arc::new(Notify::new());
    let task = tokio::spawn(watch_loop(
        peer,
        stream,
        events,
        want_write.clone(),
        wake.clone(),
        ack.clone(),
    ));
    Watch {
        want_write,
        wake,
        ack,
        task,
    }
}

async fn watch_loop(
    peer: PeerId,
    stream: Arc<tokio::net::TcpStream>,
    events: mpsc::UnboundedSender<LoopEvent>,
    want_write: Arc<AtomicBool>,
    wake: Arc<Notify>,
    ack: Arc<Notify>,
) {
    loop {
        let interest = if want_write.load(Ordering::Acquire) {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let ready = tokio::select! {
            ready = stream.ready(interest) => ready,
            _ = wake.notified() => continue,
        };
        let event = match ready {
            Ok(ready) => LoopEvent::Ready {
                peer,
                readable: ready.is_readable() || ready.is_read_closed(),
                writable: ready.is_writable() || ready.is_write_closed(),
            },
            Err(error) => LoopEvent::StreamError { peer, error },
        };
        let failed = matches!(event, LoopEvent::StreamError { .. });
        if events.send(event).is_err() || failed {
            debug!(%peer, "watcher exiting");
            return;
        }
        ack.notified().await;
    }
}
