//! Byte streams a connection runs over, and the readiness events that drive it.
//!
//! The host owns the actual sockets. It hands the core a `StreamPair` and later reports
//! readiness with `StreamEvent`s. Streams must be blocking while the handshake runs and
//! non-blocking (`WouldBlock` when drained or full) once wrapped in a `Connection`.

use std::io;

/// Readable half of a peer channel.
pub trait InputStream: io::Read + Send {
    /// Prepare the stream for reading. Called once before the handshake.
    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Stop reading; the remote sees end-of-stream once both halves are closed.
    fn close(&mut self);
}

/// Writable half of a peer channel.
pub trait OutputStream: io::Write + Send {
    fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self);
}

/// Input and output stream of one raw channel, before or after the handshake.
pub struct StreamPair {
    pub input: Box<dyn InputStream>,
    pub output: Box<dyn OutputStream>,
}

impl StreamPair {
    pub fn new(input: impl InputStream + 'static, output: impl OutputStream + 'static) -> Self {
        Self {
            input: Box::new(input),
            output: Box::new(output),
        }
    }

    pub fn close(&mut self) {
        self.input.close();
        self.output.close();
    }
}

impl std::fmt::Debug for StreamPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StreamPair")
    }
}

/// Which half of the pair an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Input,
    Output,
}

/// Readiness event reported by the host's event loop.
#[derive(Debug)]
pub enum StreamEvent {
    OpenCompleted,
    HasBytesAvailable,
    HasSpaceAvailable,
    ErrorOccurred(io::Error),
    EndEncountered,
}

/// In-memory pipes, for loopback peers and tests.
pub mod memory {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Condvar, Mutex, MutexGuard};

    use super::{InputStream, OutputStream, StreamPair};

    #[derive(Default)]
    struct PipeState {
        buf: VecDeque<u8>,
        capacity: Option<usize>,
        blocking: bool,
        reader_closed: bool,
        writer_closed: bool,
        fail_reads: Option<io::ErrorKind>,
        fail_writes: Option<io::ErrorKind>,
    }

    #[derive(Default)]
    struct Shared {
        state: Mutex<PipeState>,
        changed: Condvar,
    }

    impl Shared {
        fn lock(&self) -> MutexGuard<'_, PipeState> {
            // A panicking test thread must not hide the state from the rest of the test.
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    /// Read end of a pipe.
    pub struct PipeReader(Arc<Shared>);

    /// Write end of a pipe.
    pub struct PipeWriter(Arc<Shared>);

    /// Test-side handle for inspecting and steering a pipe.
    #[derive(Clone)]
    pub struct PipeControl(Arc<Shared>);

    /// A unidirectional, non-blocking, unbounded pipe.
    pub fn pipe() -> (PipeWriter, PipeReader) {
        let shared = Arc::new(Shared::default());
        (PipeWriter(shared.clone()), PipeReader(shared))
    }

    /// Two connected stream pairs: what `a` writes, `b` reads, and the other way round.
    /// Both directions start blocking so a handshake can run on them from two threads.
    pub fn duplex() -> (StreamPair, StreamPair, PipeControl, PipeControl) {
        let (a_out, b_in) = pipe();
        let (b_out, a_in) = pipe();
        let a_to_b = a_out.control();
        let b_to_a = b_out.control();
        a_to_b.set_blocking(true);
        b_to_a.set_blocking(true);
        (
            StreamPair::new(a_in, a_out),
            StreamPair::new(b_in, b_out),
            a_to_b,
            b_to_a,
        )
    }

    impl PipeReader {
        pub fn control(&self) -> PipeControl {
            PipeControl(self.0.clone())
        }
    }

    impl PipeWriter {
        pub fn control(&self) -> PipeControl {
            PipeControl(self.0.clone())
        }
    }

    impl PipeControl {
        pub fn set_blocking(&self, blocking: bool) {
            self.0.lock().blocking = blocking;
            self.0.changed.notify_all();
        }

        /// Limit the bytes the pipe holds; writes beyond it are short or `WouldBlock`.
        pub fn set_capacity(&self, capacity: Option<usize>) {
            self.0.lock().capacity = capacity;
            self.0.changed.notify_all();
        }

        pub fn fail_reads(&self, kind: io::ErrorKind) {
            self.0.lock().fail_reads = Some(kind);
        }

        pub fn fail_writes(&self, kind: io::ErrorKind) {
            self.0.lock().fail_writes = Some(kind);
        }

        /// Append bytes as if the writer had sent them, ignoring capacity.
        pub fn inject(&self, bytes: &[u8]) {
            self.0.lock().buf.extend(bytes.iter().copied());
            self.0.changed.notify_all();
        }

        /// Remove and return everything buffered.
        pub fn drain(&self) -> Vec<u8> {
            let bytes = self.0.lock().buf.drain(..).collect();
            self.0.changed.notify_all();
            bytes
        }

        pub fn len(&self) -> usize {
            self.0.lock().buf.len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        pub fn close_writer(&self) {
            self.0.lock().writer_closed = true;
            self.0.changed.notify_all();
        }

        pub fn reader_closed(&self) -> bool {
            self.0.lock().reader_closed
        }

        pub fn writer_closed(&self) -> bool {
            self.0.lock().writer_closed
        }
    }

    impl io::Read for PipeReader {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            let mut state = self.0.lock();
            loop {
                if let Some(kind) = state.fail_reads {
                    return Err(kind.into());
                }
                if state.reader_closed {
                    return Err(io::ErrorKind::NotConnected.into());
                }
                if !state.buf.is_empty() || out.is_empty() {
                    break;
                }
                if state.writer_closed {
                    return Ok(0);
                }
                if !state.blocking {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                state = self
                    .0
                    .changed
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
            let n = out.len().min(state.buf.len());
            for (slot, byte) in out.iter_mut().zip(state.buf.drain(..n)) {
                *slot = byte;
            }
            drop(state);
            self.0.changed.notify_all();
            Ok(n)
        }
    }

    impl InputStream for PipeReader {
        fn close(&mut self) {
            self.0.lock().reader_closed = true;
            self.0.changed.notify_all();
        }
    }

    impl io::Write for PipeWriter {
        fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
            let mut state = self.0.lock();
            loop {
                if let Some(kind) = state.fail_writes {
                    return Err(kind.into());
                }
                if state.writer_closed || state.reader_closed {
                    return Err(io::ErrorKind::BrokenPipe.into());
                }
                let room = state
                    .capacity
                    .map_or(bytes.len(), |cap| cap.saturating_sub(state.buf.len()));
                if room > 0 || bytes.is_empty() {
                    let n = room.min(bytes.len());
                    state.buf.extend(bytes[..n].iter().copied());
                    drop(state);
                    self.0.changed.notify_all();
                    return Ok(n);
                }
                if !state.blocking {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                state = self
                    .0
                    .changed
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl OutputStream for PipeWriter {
        fn close(&mut self) {
            self.0.lock().writer_closed = true;
            self.0.changed.notify_all();
        }
    }
}
