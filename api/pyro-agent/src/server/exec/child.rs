//! The 'child' module owns the child process for an execution session, wiring the stream
//! adapters to its standard descriptors and supervising its lifetime.
//!
//! The requested command is spawned with its environment replaced by the one the client sent.
//! Process output is delivered as server frames through the session's sink, and process input is
//! consumed from the session's stdin pipe.

// Implementation note: the main job of this module is communicating with the child process.  We
// use simple blocking calls for communication, so we organize the module with threads and
// channels.  A thread is started to manage each direction: writing input, reading each output
// stream, and waiting for exit.  The wait thread emits the terminal frame, and only after both
// output threads confirm they have drained and flushed their stream.

use super::streamio::{FrameSink, StdinPipe, StdinReader, StreamWriter};
use agent_model::{ExitResult, Prepare, ServerFrame};
use log::{debug, error};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use snafu::{OptionExt, ResultExt};
use std::io::{self, Read, Write};
use std::process::{ChildStdin, Command, Stdio};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;

/// Output is copied in bounded slices; one slice becomes at most one frame on the wire.
const STREAM_BUFFER_SIZE: usize = 2048;

/// ChildHandles represents a spawned child process and contains the handles necessary to
/// interact with it.
#[derive(Debug)]
pub(crate) struct ChildHandles {
    /// The process ID, for signaling the process directly.
    pub(crate) pid: Pid,

    /// Stdin chunks received from the client are pushed here; a dedicated thread drains the pipe
    /// into the child's stdin.
    pub(crate) stdin: StdinPipe,
}

impl ChildHandles {
    /// Spawns the prepared command and starts the supervision threads.
    ///
    /// Parameters:
    /// * prepare: The command tokens and environment requested by the client; the command must
    ///   be non-empty, which the session validates before calling.
    ///
    /// * sink: Where output frames and the exit result are delivered.
    pub(crate) fn new<S>(prepare: Prepare, sink: S) -> Result<Self>
    where
        S: FrameSink + Clone + 'static,
    {
        let mut command = Command::new(&prepare.command[0]);
        command.args(&prepare.command[1..]);

        // The caller controls the child's environment completely; nothing leaks from the agent's
        // own environment.
        command.env_clear();
        command.envs(&prepare.environment);

        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        debug!("Spawning command for exec request: {:?}", command);
        let mut child = command.spawn().context(error::SpawnSnafu {
            program: prepare.command[0].as_str(),
        })?;

        // `Command` returns pid as u32, but we want i32 to deal with nix.
        let pid_raw = i32::try_from(child.id())
            .ok()
            .context(error::InvalidPidSnafu { given: child.id() })?;
        let pid = Pid::from_raw(pid_raw);
        debug!("Spawned child has pid {}", pid);

        // At this point we've spawned a child process but still have some wiring to do.  If any
        // of it fails, we want to return failure, but we also have to kill the child or it would
        // stick around forever.  Perform the rest of the setup in a closure so any error path
        // can kill the child in one place.
        (move || {
            let stdin = child.stdin.take().context(error::NoStdinSnafu)?;
            let stdout = child.stdout.take().context(error::NoStdoutSnafu)?;
            let stderr = child.stderr.take().context(error::NoStderrSnafu)?;

            // Input: the session pushes chunks into the pipe, the writer thread drains it.
            let stdin_pipe = StdinPipe::new();
            WriteToChild::new(stdin_pipe.reader(), stdin);

            // Output: one reader per stream, each signaling on its channel when fully drained.
            let read_stdout = ReadFromChild::new(stdout, StreamWriter::stdout(sink.clone()));
            let read_stderr = ReadFromChild::new(stderr, StreamWriter::stderr(sink.clone()));

            // Exit: reap the child and emit the terminal frame after both readers are done.
            WaitForChild::new(
                pid,
                sink,
                stdin_pipe.clone(),
                read_stdout.complete_rx,
                read_stderr.complete_rx,
            );

            Ok(Self {
                pid,
                stdin: stdin_pipe,
            })
        })()
        .map_err(|e: error::Error| {
            Self::stop_impl(pid);
            e
        })
    }

    /// Terminates the child process.  Used when the session is cancelled or torn down.
    pub(crate) fn stop(&self) {
        Self::stop_impl(self.pid)
    }

    // Internal helper for stopping the child by PID, for when we don't have a &self yet.
    fn stop_impl(pid: Pid) {
        // If the signal can't be delivered, the process is already gone and there's nothing left
        // to stop.
        let _ = kill(pid, Signal::SIGTERM);
    }
}

/// WriteToChild drains the session's stdin pipe into the child's stdin, closing it when the
/// client ends the stream so the child sees end-of-input.
struct WriteToChild {}

impl WriteToChild {
    /// Parameters:
    /// * reader: The blocking half of the session's stdin pipe.
    ///
    /// * stdin: The child's stdin handle; dropped (closed) when the reader reports EOF.
    fn new(reader: StdinReader, stdin: ChildStdin) -> Self {
        debug!("Spawning thread to write to child");
        thread::spawn(move || Self::write_to_child(reader, stdin));

        Self {}
    }

    fn write_to_child(mut reader: StdinReader, mut stdin: ChildStdin) {
        let mut buffer = vec![0; STREAM_BUFFER_SIZE];
        loop {
            let count = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => count,
                Err(e) => {
                    error!("Failed reading session stdin: {}", e);
                    break;
                }
            };
            if let Err(e) = stdin.write_all(&buffer[..count]) {
                // The child closed its stdin or exited; there's nowhere left to write.
                debug!("Failed to write to child stdin: {}", e);
                break;
            }
        }
        // Dropping the handle closes the child's stdin.
    }
}

/// ReadFromChild copies one of the child's output streams to the client through a stream writer,
/// marking the stream's end on the wire at end-of-file and then signaling completion.
struct ReadFromChild {
    /// Receives one message when the stream is fully drained and flushed.
    complete_rx: Receiver<()>,
}

impl ReadFromChild {
    /// Parameters:
    /// * output: The child's stdout or stderr handle.
    ///
    /// * writer: The stream writer matching that handle.
    fn new<R, S>(output: R, writer: StreamWriter<S>) -> Self
    where
        R: Read + Send + 'static,
        S: FrameSink + 'static,
    {
        let (complete_tx, complete_rx) = sync_channel(1);

        debug!("Spawning thread to read from child");
        thread::spawn(move || Self::read_from_child(output, writer, complete_tx));

        Self { complete_rx }
    }

    fn read_from_child<R, S>(mut output: R, mut writer: StreamWriter<S>, complete_tx: SyncSender<()>)
    where
        R: Read,
        S: FrameSink,
    {
        let mut buffer = vec![0; STREAM_BUFFER_SIZE];
        loop {
            match output.read(&mut buffer) {
                Ok(0) => {
                    debug!("Finished reading from child");
                    if let Err(e) = writer.close() {
                        debug!("Output stream already closed: {}", e);
                    }
                    break;
                }
                Ok(count) => {
                    if let Err(e) = writer.write_all(&buffer[..count]) {
                        // The session is gone; no client is left to read the output.
                        error!("Failed to send child output: {}", e);
                        break;
                    }
                }
                // Retry if the read is interrupted.
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Failed reading from child: {}", e);
                    break;
                }
            }
        }
        // Completion gates the terminal frame; see WaitForChild.
        let _ = complete_tx.try_send(());
    }
}

/// WaitForChild reaps the child process and reports the exit result.  The terminal frame must be
/// the last frame of the session, so it waits for both output readers to finish flushing first.
struct WaitForChild {}

impl WaitForChild {
    /// Parameters:
    /// * pid: The child process ID to reap.
    ///
    /// * sink: Where the terminal frame is delivered.
    ///
    /// * stdin: The session's stdin pipe, closed once the child is gone.
    ///
    /// * stdout_done / stderr_done: Signaled by the output readers when their stream is drained.
    fn new<S>(
        pid: Pid,
        sink: S,
        stdin: StdinPipe,
        stdout_done: Receiver<()>,
        stderr_done: Receiver<()>,
    ) -> Self
    where
        S: FrameSink + 'static,
    {
        debug!("Spawning thread to wait for child exit");
        thread::spawn(move || Self::wait_for_child(pid, sink, stdin, stdout_done, stderr_done));

        Self {}
    }

    fn wait_for_child<S: FrameSink>(
        pid: Pid,
        sink: S,
        stdin: StdinPipe,
        stdout_done: Receiver<()>,
        stderr_done: Receiver<()>,
    ) {
        // Drain both output streams first.  A pipe delivers everything the child wrote before
        // exiting, so once the readers are done, every output frame is ahead of us in the
        // session's mailbox and the terminal frame cannot overtake it.
        let _ = stdout_done.recv();
        let _ = stderr_done.recv();

        let res = loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                other => break other,
            }
        };
        debug!("Child process exited");

        let exit_code = match res {
            // If it exited with a code, use that.
            Ok(WaitStatus::Exited(_pid, code)) => code,

            // Use shell-style return codes for signals.
            Ok(WaitStatus::Signaled(_pid, signal, _core)) => 128 + signal as i32,

            // waitpid() shouldn't complete with anything else for a plain wait; if it does, we
            // don't know what happened and have no useful code to send.
            Ok(_) => 0,

            Err(e) => {
                error!("Failed waiting for child: {}", e);
                sink.abort(format!("error waiting for child: {}", e));
                return;
            }
        };

        // The client may still be typing; end the input stream now that there's no consumer.
        if let Err(e) = stdin.close() {
            debug!("Session stdin already closed: {}", e);
        }

        let result = ExitResult {
            exited: true,
            exit_code,
        };
        if sink.send_frame(ServerFrame::result(result)).is_err() {
            debug!("Session gone before exit result could be sent");
        }
    }
}

mod error {
    use snafu::Snafu;
    use std::io;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("Child had invalid PID '{}', should never happen", given))]
        InvalidPid { given: u32 },

        #[snafu(display("Child has no stdin, should never happen"))]
        NoStdin,

        #[snafu(display("Child has no stdout, should never happen"))]
        NoStdout,

        #[snafu(display("Child has no stderr, should never happen"))]
        NoStderr,

        #[snafu(display("Failed to spawn '{}': {}", program, source))]
        Spawn { program: String, source: io::Error },
    }
}
pub(crate) use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod tests {
    use super::super::streamio;
    use super::*;
    use agent_model::IoChunk;
    use std::collections::HashMap;
    use std::sync::mpsc;
    use std::time::Duration;

    const RESULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Frames land on a plain channel so tests can assert on exactly what a client would see.
    #[derive(Clone)]
    struct TestSink {
        frames: mpsc::Sender<ServerFrame>,
    }

    impl TestSink {
        fn new() -> (Self, mpsc::Receiver<ServerFrame>) {
            let (frames, rx) = mpsc::channel();
            (Self { frames }, rx)
        }
    }

    impl FrameSink for TestSink {
        fn send_frame(&self, frame: ServerFrame) -> streamio::Result<()> {
            self.frames.send(frame).map_err(|_| streamio::Error::SessionGone)
        }

        fn abort(&self, reason: String) {
            panic!("session aborted: {}", reason);
        }
    }

    fn prepare(command: &[&str]) -> Prepare {
        Prepare {
            command: command.iter().map(|s| s.to_string()).collect(),
            environment: HashMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
        }
    }

    /// Collects frames until the terminal result, verifying along the way that per-stream order
    /// is preserved and that nothing follows the result.
    fn collect_session(rx: &mpsc::Receiver<ServerFrame>) -> (Vec<u8>, Vec<u8>, ExitResult) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            let frame = rx
                .recv_timeout(RESULT_TIMEOUT)
                .expect("no result frame within timeout");
            if let Some(chunk) = frame.stdout {
                stdout.extend(chunk.data);
            }
            if let Some(chunk) = frame.stderr {
                stderr.extend(chunk.data);
            }
            if let Some(result) = frame.result {
                // The result frame is terminal.
                assert!(
                    rx.recv_timeout(Duration::from_millis(200)).is_err(),
                    "a frame followed the result"
                );
                return (stdout, stderr, result);
            }
        }
    }

    #[test]
    fn output_and_exit_code_are_reported() {
        let (sink, rx) = TestSink::new();
        let handles = ChildHandles::new(prepare(&["/bin/echo", "hello world"]), sink).unwrap();
        handles.stdin.push_chunk(IoChunk::closed());

        let (stdout, stderr, result) = collect_session(&rx);
        assert_eq!(stdout, b"hello world\n");
        assert!(stderr.is_empty());
        assert!(result.exited);
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn nonzero_exit_code_is_reported() {
        let (sink, rx) = TestSink::new();
        let handles = ChildHandles::new(prepare(&["/bin/sh", "-c", "exit 7"]), sink).unwrap();
        handles.stdin.push_chunk(IoChunk::closed());

        let (_, _, result) = collect_session(&rx);
        assert_eq!(result.exit_code, 7);
    }

    #[test]
    fn streams_are_split_and_ordered() {
        let (sink, rx) = TestSink::new();
        let handles = ChildHandles::new(
            prepare(&["/bin/sh", "-c", "echo out; echo err 1>&2; exit 3"]),
            sink,
        )
        .unwrap();
        handles.stdin.push_chunk(IoChunk::closed());

        let (stdout, stderr, result) = collect_session(&rx);
        assert_eq!(stdout, b"out\n");
        assert_eq!(stderr, b"err\n");
        assert_eq!(result.exit_code, 3);
    }

    #[test]
    fn stdin_bytes_reach_the_child_exactly() {
        let (sink, rx) = TestSink::new();
        let handles = ChildHandles::new(prepare(&["/bin/cat"]), sink).unwrap();

        handles.stdin.push_chunk(IoChunk::data(&b"abc"[..]));
        // An empty chunk with no close flag is a legal no-op.
        handles.stdin.push_chunk(IoChunk::default());
        handles.stdin.push_chunk(IoChunk {
            close: true,
            data: b"def".to_vec(),
        });

        let (stdout, stderr, result) = collect_session(&rx);
        assert_eq!(stdout, b"abcdef");
        assert!(stderr.is_empty());
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn spawn_failure_is_distinguishable_and_names_the_program() {
        let (sink, _rx) = TestSink::new();
        let err = ChildHandles::new(prepare(&["/no/such/binary"]), sink).unwrap_err();
        match &err {
            Error::Spawn { program, .. } => assert_eq!(program, "/no/such/binary"),
            other => panic!("expected Spawn error, got {:?}", other),
        }
        assert!(err.to_string().contains("/no/such/binary"));
    }

    #[test]
    fn stop_terminates_a_running_child() {
        let (sink, rx) = TestSink::new();
        let handles = ChildHandles::new(prepare(&["/bin/sleep", "30"]), sink).unwrap();

        // Give the child a moment to be fully up, then cancel the session.
        std::thread::sleep(Duration::from_millis(100));
        handles.stop();

        let (_, _, result) = collect_session(&rx);
        assert_eq!(result.exit_code, 128 + Signal::SIGTERM as i32);
    }

    #[test]
    fn output_close_markers_precede_the_result() {
        let (sink, rx) = TestSink::new();
        let handles = ChildHandles::new(prepare(&["/bin/echo", "done"]), sink).unwrap();
        handles.stdin.push_chunk(IoChunk::closed());

        let mut stdout_closed = false;
        let mut stderr_closed = false;
        loop {
            let frame = rx.recv_timeout(RESULT_TIMEOUT).expect("missing frames");
            if let Some(chunk) = &frame.stdout {
                if chunk.close {
                    stdout_closed = true;
                }
            }
            if let Some(chunk) = &frame.stderr {
                if chunk.close {
                    stderr_closed = true;
                }
            }
            if frame.result.is_some() {
                break;
            }
        }
        assert!(stdout_closed, "stdout was not closed before the result");
        assert!(stderr_closed, "stderr was not closed before the result");
    }
}
