//! The 'streamio' module bridges the discrete frames of the streaming channel and the byte-pipe
//! contract the child process expects.  `StdinPipe` collects incoming stdin chunks and hands out
//! a blocking reader for the thread that feeds the child's stdin; `StreamWriter` turns writes of
//! child output into server frames.

use agent_model::{IoChunk, ServerFrame};
use snafu::ensure;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

/// How the stream writers hand frames to the transport.  The session actor's address implements
/// this for real sessions; tests substitute a channel-backed sink.
pub(crate) trait FrameSink: Send {
    /// Delivers one frame to the client, blocking if the transport needs time.  Fails only once
    /// the session is gone.
    fn send_frame(&self, frame: ServerFrame) -> Result<()>;

    /// Tears the session down without a result frame; used when the child can't be supervised to
    /// a trustworthy exit code.
    fn abort(&self, reason: String);
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// StdinPipe buffers stdin chunks received from the client until the thread feeding the child's
/// stdin consumes them.  The receiving side pushes under a mutex and signals a condvar; the
/// reader blocks on the condvar until data arrives or the stream ends, so the child never
/// observes a premature end-of-input when it outpaces the network.
#[derive(Debug, Clone)]
pub(crate) struct StdinPipe {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

#[derive(Debug, Default)]
struct State {
    buffer: VecDeque<u8>,
    closed: bool,
    /// A receive failure on the channel, surfaced to the reader as a terminal error.
    failure: Option<String>,
}

impl StdinPipe {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                available: Condvar::new(),
            }),
        }
    }

    /// Appends one received chunk.  Data arriving after the stream was closed is dropped; the
    /// client isn't supposed to send any.
    pub(crate) fn push_chunk(&self, chunk: IoChunk) {
        let mut state = match self.shared.state.lock() {
            Ok(state) => state,
            // The reading thread panicked; the session is coming down anyway.
            Err(_) => return,
        };
        if state.closed {
            return;
        }
        state.buffer.extend(chunk.data);
        if chunk.close {
            state.closed = true;
        }
        self.shared.available.notify_all();
    }

    /// Latches a channel receive failure; the next read reports it instead of data or EOF.
    pub(crate) fn fail(&self, reason: String) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.failure = Some(reason);
            self.shared.available.notify_all();
        }
    }

    /// Marks end-of-input.  Closing twice is a caller bug and reported as such.
    pub(crate) fn close(&self) -> Result<()> {
        if let Ok(mut state) = self.shared.state.lock() {
            ensure!(!state.closed, error::AlreadyClosedSnafu);
            state.closed = true;
            self.shared.available.notify_all();
        }
        Ok(())
    }

    /// Returns the reading half, handed to the thread that feeds the child's stdin.
    pub(crate) fn reader(&self) -> StdinReader {
        StdinReader {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// The reading half of a `StdinPipe`; a plain blocking byte source.
#[derive(Debug)]
pub(crate) struct StdinReader {
    shared: Arc<Shared>,
}

impl Read for StdinReader {
    /// Blocks until input is available, the stream is closed, or the channel failed.
    /// End-of-file is reported only once the stream is closed and drained.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "stdin buffer lock poisoned"))?;
        loop {
            if let Some(reason) = &state.failure {
                return Err(io::Error::new(io::ErrorKind::Other, reason.clone()));
            }
            if !state.buffer.is_empty() {
                let count = buf.len().min(state.buffer.len());
                for (slot, byte) in buf.iter_mut().zip(state.buffer.drain(..count)) {
                    *slot = byte;
                }
                return Ok(count);
            }
            if state.closed {
                return Ok(0);
            }
            state = self
                .shared
                .available
                .wait(state)
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "stdin buffer lock poisoned"))?;
        }
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// StreamWriter turns writes of child output into server frames, discriminated into the stdout
/// or stderr slot.  Only one thread writes to each stream, so the writer itself needs no
/// locking; ordering on the wire comes from the sink.
#[derive(Debug)]
pub(crate) struct StreamWriter<S> {
    sink: S,
    stderr: bool,
    closed: bool,
}

impl<S: FrameSink> StreamWriter<S> {
    /// A writer that delivers frames into the stdout slot.
    pub(crate) fn stdout(sink: S) -> Self {
        Self {
            sink,
            stderr: false,
            closed: false,
        }
    }

    /// A writer that delivers frames into the stderr slot.
    pub(crate) fn stderr(sink: S) -> Self {
        Self {
            sink,
            stderr: true,
            closed: false,
        }
    }

    fn frame(&self, chunk: IoChunk) -> ServerFrame {
        if self.stderr {
            ServerFrame::stderr(chunk)
        } else {
            ServerFrame::stdout(chunk)
        }
    }

    /// Sends the end-of-stream marker.  Closing twice is a caller bug and reported as such.
    pub(crate) fn close(&mut self) -> Result<()> {
        ensure!(!self.closed, error::AlreadyClosedSnafu);
        self.closed = true;
        self.sink.send_frame(self.frame(IoChunk::closed()))
    }
}

impl<S: FrameSink> Write for StreamWriter<S> {
    /// Wraps the bytes in a single chunk frame.  The writer does not split large buffers;
    /// callers copy output in bounded slices.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sink
            .send_frame(self.frame(IoChunk::data(buf)))
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("Already closed"))]
        AlreadyClosed,

        #[snafu(display("Session is gone, cannot deliver frames"))]
        SessionGone,
    }
}
pub(crate) use error::Error;
pub(crate) type Result<T> = std::result::Result<T, error::Error>;
