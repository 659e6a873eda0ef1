//! The 'exec' module runs a command on a remote pyro agent.  The one-shot path does a single
//! HTTP round trip and copies the captured output to local sinks.  The interactive path opens a
//! WebSocket, streams local input to the remote process, and streams its output and exit result
//! back while it runs.

// Implementation note: the main job of this module is managing communication to and from the
// agent through a WebSocket.  This is accomplished mainly with threads and channels - a thread
// is started to manage each particular resource, like input, signals, heartbeat.  If it needs to
// send frames to the agent, it's given a channel to the agent.  If the driver needs to hear back
// from the thread, it's given back a channel.

use agent_model::{
    wire, ClientFrame, ExecuteCommandRequest, ExecuteCommandResponse, ExitResult, IoChunk,
    Prepare, ServerFrame,
};
use futures::{Future, FutureExt, Stream, StreamExt};
use futures_channel::{mpsc, oneshot};
use log::{debug, trace};
use signal_hook::{consts::signal, iterator::Signals};
use snafu::{ensure, ResultExt};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::thread::{self, sleep};
use std::time::{Duration, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Input is read and sent in bounded slices; one slice becomes one stdin frame.
const INPUT_BUFFER_SIZE: usize = 2048;

/// To guard against stale connections, we send ping messages through the channel regularly as a
/// 'heartbeat'; this is how often we send them.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
/// If we haven't heard from the agent in this much time, we consider it gone and we stop.
const AGENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a command on the agent to completion, copying its captured output to the given sinks.
/// Returns the remote exit code.  Any transport or local I/O failure is an error, which callers
/// conventionally surface as the reserved `-2` exit code.
pub async fn execute<W1, W2>(
    address: &str,
    command: Vec<String>,
    environment: HashMap<String, String>,
    outw: &mut W1,
    errw: &mut W2,
) -> Result<i32>
where
    W1: Write,
    W2: Write,
{
    let request = ExecuteCommandRequest {
        command,
        environment,
    };

    let uri = format!("http://{}/exec", address);
    debug!("Sending execute request to {}", uri);
    let response = reqwest::Client::new()
        .post(&uri)
        .json(&request)
        .send()
        .await
        .context(error::RequestSendSnafu)?;

    ensure!(
        response.status().is_success(),
        error::ResponseStatusSnafu {
            code: response.status(),
        }
    );

    let response: ExecuteCommandResponse =
        response.json().await.context(error::ResponseBodySnafu)?;

    outw.write_all(&response.stdout.data)
        .context(error::WriteOutputSnafu)?;
    outw.flush().context(error::WriteOutputSnafu)?;
    errw.write_all(&response.stderr.data)
        .context(error::WriteOutputSnafu)?;
    errw.flush().context(error::WriteOutputSnafu)?;

    Ok(response.exit_code)
}

/// Runs a command on the agent interactively: bytes read from `input` are streamed to the remote
/// process's stdin, its stdout and stderr are streamed into the given sinks as they arrive, and
/// its exit code is returned once every emitted byte has been delivered.
pub async fn execute_interactively<R, W1, W2>(
    address: &str,
    command: Vec<String>,
    environment: HashMap<String, String>,
    input: R,
    outw: W1,
    errw: W2,
) -> Result<i32>
where
    R: Read + Send + 'static,
    W1: Write + 'static,
    W2: Write + 'static,
{
    let uri = format!("ws://{}/exec/stream", address);
    debug!("Connecting to {}", uri);
    let (ws_stream, _response) = connect_async(uri).await.context(error::ConnectSnafu)?;

    // We split the stream into write and read halves so each can be managed separately; the
    // blocking readers live on their own threads and only ever see a channel.
    let (write, read) = ws_stream.split();

    // We make a multi-producer channel that forwards anything it receives to the WebSocket; we
    // can share the transmission end with any thread that needs to send frames to the agent.
    let (ws_tx, ws_rx) = mpsc::unbounded();
    let forward_to_ws = ws_rx.map(Ok).forward(write);
    debug!("Spawning task to write to WebSocket");
    tokio::spawn(forward_to_ws);

    // The preparation frame must reach the agent before any stdin frame, so it goes into the
    // channel before the input pump starts; the channel preserves order.
    debug!("Sending prepare frame for command: {:?}", command);
    let prepare = ClientFrame::Prepare(Prepare {
        command,
        environment,
    });
    send_frame(&ws_tx, &prepare, "prepare")?;

    // A heartbeat type that regularly pings the agent and keeps track of responses.
    let mut heartbeat = Heartbeat::new(ws_tx.clone());
    // A type that watches for terminal signals so we can stop cleanly; dropping the connection
    // makes the agent kill the remote process.
    let mut signal_handler = HandleSignals::new()?;

    // Start a thread that reads local input and sends it across the WebSocket.
    let mut read_from_user = ReadFromUser::new(input, ws_tx.clone());
    // Start a future that reads the stream of frames from the agent; it resolves with the exit
    // code carried by the terminal frame.
    let mut read_from_server = ReadFromServer::new(read, outw, errw, heartbeat.setter.clone());

    // We're all set up!  Wait for something that indicates we're done.
    debug!("Waiting for completion: result, input error, signal, or dead heartbeat");
    tokio::select! {
        // This is the normal case; the agent finishes running the program and reports its exit.
        res = &mut read_from_server.future => res,

        // Stop if we fail to read input.
        // Match against Ok(err) because the Err case just means the input thread finished and
        // dropped its channel; our input being done doesn't mean the process is done.
        Ok(err) = &mut read_from_user.error_rx => Err(err),

        // Stop if we receive a terminal signal; the caller reports this as a local failure.
        signal = &mut signal_handler.signal_rx => {
            error::ReceivedSignalSnafu { signal: signal.unwrap_or(0) }.fail()
        }

        // Stop if the agent's heartbeat dies.
        _ = &mut heartbeat.finished_rx => error::HeartbeatDiedSnafu.fail(),
    }
}

/// Encodes one frame and queues it for transmission to the agent.
fn send_frame(
    tx: &mpsc::UnboundedSender<Message>,
    frame: &ClientFrame,
    kind: &'static str,
) -> Result<()> {
    let bytes = wire::encode(frame).context(error::EncodeSnafu)?;
    tx.unbounded_send(Message::Binary(bytes))
        .context(error::SendFrameSnafu { kind })?;
    Ok(())
}

/// ReadFromServer is responsible for handling the stream of frames from the agent: output goes
/// into the local sinks as it arrives, and the terminal frame yields the exit code.
struct ReadFromServer {
    /// The task handling the stream of server frames; resolves when the terminal frame arrives,
    /// the agent closes the connection, or we hit an error.
    future: Pin<Box<dyn Future<Output = Result<i32>>>>,
}

impl ReadFromServer {
    /// Parameters:
    /// * read: The stream of messages from the agent.
    ///
    /// * outw / errw: The local sinks for the remote process's stdout and stderr.
    ///
    /// * heartbeat_setter: An atomic handle to a timestamp, updated whenever we receive a ping
    ///   or pong from the agent so we can make sure the connection isn't stale.
    fn new<S, W1, W2>(read: S, outw: W1, errw: W2, heartbeat_setter: Arc<Mutex<Instant>>) -> Self
    where
        S: Stream<Item = std::result::Result<Message, WsError>> + Unpin + 'static,
        W1: Write + 'static,
        W2: Write + 'static,
    {
        let future = Self::read_from_server(read, outw, errw, heartbeat_setter).boxed_local();
        Self { future }
    }

    async fn read_from_server<S, W1, W2>(
        mut read: S,
        mut outw: W1,
        mut errw: W2,
        heartbeat_setter: Arc<Mutex<Instant>>,
    ) -> Result<i32>
    where
        S: Stream<Item = std::result::Result<Message, WsError>> + Unpin,
        W1: Write,
        W2: Write,
    {
        while let Some(ws_msg) = read.next().await {
            let ws_msg = ws_msg.context(error::ReadWebSocketSnafu)?;
            match ws_msg {
                // Binary messages each carry one encoded server frame.
                Message::Binary(data) => {
                    let frame: ServerFrame = wire::decode(&data).context(error::DecodeSnafu)?;
                    if let Some(exit_code) = Self::handle_frame(frame, &mut outw, &mut errw)? {
                        return Ok(exit_code);
                    }
                }

                // tokio-tungstenite replies to ping with pong; we just update our heartbeat.
                Message::Ping(_) | Message::Pong(_) => {
                    // If we fail to get the mutex, the heartbeat thread has panicked, which
                    // means the dead-heartbeat path will stop us shortly; keep processing in the
                    // meantime.
                    if let Ok(mut hb) = heartbeat_setter.lock() {
                        trace!("Got ping/pong from agent, updating heartbeat");
                        *hb = Instant::now();
                    }
                }

                // The agent closed the channel.  Normally the terminal frame arrives first and
                // we return before seeing this; a close without a result means the command never
                // finished, and the reason says why.
                Message::Close(reason) => {
                    return error::ClosedWithoutResultSnafu {
                        reason: reason
                            .map(|r| r.reason.into_owned())
                            .unwrap_or_default(),
                    }
                    .fail();
                }

                Message::Text(_) | Message::Frame(_) => {
                    trace!("Ignoring unexpected message type");
                }
            }
        }

        error::ClosedWithoutResultSnafu {
            reason: String::new(),
        }
        .fail()
    }

    /// Applies one frame: output data goes to the matching sink, close markers flush it, and a
    /// result yields the exit code.
    fn handle_frame<W1, W2>(frame: ServerFrame, outw: &mut W1, errw: &mut W2) -> Result<Option<i32>>
    where
        W1: Write,
        W2: Write,
    {
        if let Some(chunk) = frame.stdout {
            write_chunk(chunk, outw)?;
        }
        if let Some(chunk) = frame.stderr {
            write_chunk(chunk, errw)?;
        }
        if let Some(ExitResult {
            exited: true,
            exit_code,
        }) = frame.result
        {
            return Ok(Some(exit_code));
        }
        Ok(None)
    }
}

/// Writes one received chunk to a local sink.
fn write_chunk<W: Write>(chunk: IoChunk, sink: &mut W) -> Result<()> {
    if !chunk.data.is_empty() {
        sink.write_all(&chunk.data).context(error::WriteOutputSnafu)?;
        // May not be a full line of output, so flush what we got.  Failure here isn't worth
        // stopping the whole execution.
        let _ = sink.flush();
    }
    if chunk.close {
        let _ = sink.flush();
    }
    Ok(())
}

/// ReadFromUser is responsible for reading local input and sending it to the given channel so it
/// can be forwarded to the agent.
struct ReadFromUser {
    /// If we fail to read input, we'll return the error on this channel so the driver can stop.
    error_rx: oneshot::Receiver<Error>,
}

impl ReadFromUser {
    /// Parameters:
    /// * input: The local byte source, typically the process's own stdin.
    ///
    /// * stdin_tx: The channel to which we should send frames containing input.
    fn new<R>(input: R, stdin_tx: mpsc::UnboundedSender<Message>) -> Self
    where
        R: Read + Send + 'static,
    {
        let (error_tx, error_rx) = oneshot::channel();

        debug!("Spawning thread to read local input");
        thread::spawn(move || {
            if let Err(e) = Self::read_input(input, stdin_tx) {
                let _ = error_tx.send(e);
            }
        });

        Self { error_rx }
    }

    /// Read input in bulk, forwarding each batch, and end with a closing stdin frame at
    /// end-of-input so the remote process sees EOF.
    fn read_input<R: Read>(mut input: R, tx: mpsc::UnboundedSender<Message>) -> Result<()> {
        let mut buf = [0; INPUT_BUFFER_SIZE];
        loop {
            let count = match input.read(&mut buf) {
                Ok(count) => count,
                // Reads cut short by signal delivery are retried.
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context(error::ReadInputSnafu),
            };

            // A read of 0 indicates EOF, so we're done.
            if count == 0 {
                break;
            }

            trace!("Read {} bytes of input", count);
            let frame = ClientFrame::Stdin(IoChunk::data(&buf[..count]));
            send_frame(&tx, &frame, "stdin")?;
        }
        debug!("Finished reading input");

        // Tell the agent input is done so it can close the remote process's stdin; programs
        // reading until EOF won't finish without this.
        send_frame(&tx, &ClientFrame::Stdin(IoChunk::closed()), "stdin close")?;

        Ok(())
    }
}

/// Heartbeat is responsible for confirming our connection to the agent isn't stale.  We ping the
/// agent regularly so it knows we're alive, and we confirm that the agent has pinged us recently
/// so we know it's alive.
struct Heartbeat {
    /// An atomic handle to a timestamp; this should be updated whenever we receive a ping or
    /// pong from the agent so we can make sure the connection isn't stale.
    setter: Arc<Mutex<Instant>>,
    /// If the heartbeat dies, we get a message on this channel so the driver can stop.
    finished_rx: oneshot::Receiver<()>,
}

impl Heartbeat {
    /// Parameters:
    /// * ping_tx: The channel to which we should send ping messages.
    fn new(ping_tx: mpsc::UnboundedSender<Message>) -> Self {
        // Create the Instant we use to track when we last heard from the agent.
        let getter = Arc::new(Mutex::new(Instant::now()));
        // Create another handle to the Instant that the caller uses to update it.
        let setter = getter.clone();
        // Create a channel we use to tell the caller when the heartbeat dies.
        let (finished_tx, finished_rx) = oneshot::channel();

        debug!("Spawning heartbeat thread");
        thread::spawn(move || Self::heartbeat(ping_tx, getter, finished_tx));

        Self {
            setter,
            finished_rx,
        }
    }

    fn heartbeat(
        ping_tx: mpsc::UnboundedSender<Message>,
        heartbeat_getter: Arc<Mutex<Instant>>,
        finished_tx: oneshot::Sender<()>,
    ) {
        // Runs until we don't hear from the agent for longer than AGENT_TIMEOUT, the thread that
        // updates the heartbeat dies, or the connection is torn down under us.
        loop {
            sleep(HEARTBEAT_INTERVAL);

            match heartbeat_getter.lock() {
                Ok(hb) => {
                    if Instant::now().duration_since(*hb) > AGENT_TIMEOUT {
                        break;
                    }
                }
                Err(_) => {
                    // If we fail to get the mutex, the task reading from the WebSocket has
                    // panicked, so there's no more need for a heartbeat; we're dead.
                    break;
                }
            }

            // A failed send means the connection is gone and the driver is already returning.
            if ping_tx.unbounded_send(Message::Ping(vec![])).is_err() {
                return;
            }
        }

        // Tell the caller the heartbeat died.
        let _ = finished_tx.send(());
    }
}

/// HandleSignals watches for terminal signals and alerts the driver so it can stop cleanly; the
/// agent kills the remote process when our connection drops.
struct HandleSignals {
    /// If a terminal signal is received, its value is sent over this channel.
    signal_rx: oneshot::Receiver<i32>,
}

impl HandleSignals {
    fn new() -> Result<Self> {
        // Create a channel we use to tell the caller when we receive a terminal signal.
        let (signal_tx, signal_rx) = oneshot::channel();

        // Set up the signal handler; do this before starting a thread so we can die quickly on
        // failure.
        use signal::*;
        let signals =
            Signals::new([SIGTERM, SIGINT, SIGQUIT]).context(error::HandleSignalsSnafu)?;

        debug!("Spawning thread to manage signals");
        thread::spawn(move || Self::handle_signals(signals, signal_tx));

        Ok(Self { signal_rx })
    }

    fn handle_signals(mut signals: Signals, signal_tx: oneshot::Sender<i32>) {
        loop {
            // Block until our process receives a signal.
            for signal in signals.wait() {
                // Everything we registered is terminal; notify the driver and exit.
                let _ = signal_tx.send(signal);
                return;
            }
        }
    }
}

mod error {
    use futures_channel::mpsc;
    use snafu::Snafu;
    use tokio_tungstenite::tungstenite::Message;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Connection closed before a result arrived: {}", reason))]
        ClosedWithoutResult { reason: String },

        #[snafu(display("Failed to connect to agent: {}", source))]
        Connect {
            source: tokio_tungstenite::tungstenite::Error,
        },

        #[snafu(display("Failed to decode frame from agent: {}", source))]
        Decode { source: agent_model::wire::Error },

        #[snafu(display("Failed to encode frame: {}", source))]
        Encode { source: agent_model::wire::Error },

        #[snafu(display("Failed to set up signal handler: {}", source))]
        HandleSignals { source: std::io::Error },

        #[snafu(display("Lost contact with the agent"))]
        HeartbeatDied,

        #[snafu(display("Failed to read input: {}", source))]
        ReadInput { source: std::io::Error },

        #[snafu(display("Failed to read from WebSocket: {}", source))]
        ReadWebSocket {
            source: tokio_tungstenite::tungstenite::Error,
        },

        #[snafu(display("Received signal {}", signal))]
        ReceivedSignal { signal: i32 },

        #[snafu(display("Failed to send request: {}", source))]
        RequestSend { source: reqwest::Error },

        #[snafu(display("Failed to read response body: {}", source))]
        ResponseBody { source: reqwest::Error },

        #[snafu(display("Agent returned status {}", code))]
        ResponseStatus { code: reqwest::StatusCode },

        #[snafu(display("Failed to send {} frame to agent: {}", kind, source))]
        SendFrame {
            kind: String,
            source: mpsc::TrySendError<Message>,
        },

        #[snafu(display("Failed to write output: {}", source))]
        WriteOutput { source: std::io::Error },
    }
}
pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn input_pump_preserves_bytes_and_closes() {
        let (tx, mut rx) = mpsc::unbounded();
        ReadFromUser::read_input(Cursor::new(b"abcdef".to_vec()), tx).unwrap();

        let mut chunks = Vec::new();
        while let Ok(Some(msg)) = rx.try_next() {
            match msg {
                Message::Binary(bytes) => match wire::decode::<ClientFrame>(&bytes).unwrap() {
                    ClientFrame::Stdin(chunk) => chunks.push(chunk),
                    other => panic!("unexpected frame: {:?}", other),
                },
                other => panic!("unexpected message: {:?}", other),
            }
        }

        let total: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(total, b"abcdef");
        assert!(chunks.last().unwrap().close, "missing closing stdin chunk");
        assert!(
            !chunks[..chunks.len() - 1].iter().any(|c| c.close),
            "stream closed before end of input"
        );
    }

    #[tokio::test]
    async fn output_pump_routes_streams_and_returns_exit_code() {
        let frames = vec![
            ServerFrame::stdout(IoChunk::data(&b"out1"[..])),
            ServerFrame::stderr(IoChunk::data(&b"err1"[..])),
            ServerFrame::stdout(IoChunk {
                close: true,
                data: b"out2".to_vec(),
            }),
            ServerFrame::stderr(IoChunk::closed()),
            ServerFrame::result(ExitResult {
                exited: true,
                exit_code: 3,
            }),
        ];
        let read = futures::stream::iter(
            frames
                .into_iter()
                .map(|f| Ok::<_, WsError>(Message::Binary(wire::encode(&f).unwrap()))),
        );

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let heartbeat = Arc::new(Mutex::new(Instant::now()));
        let exit_code =
            ReadFromServer::read_from_server(read, &mut stdout, &mut stderr, heartbeat)
                .await
                .unwrap();

        assert_eq!(exit_code, 3);
        assert_eq!(stdout, b"out1out2");
        assert_eq!(stderr, b"err1");
    }

    #[tokio::test]
    async fn output_pump_stops_at_the_result() {
        // Anything sneaking in after the terminal frame must not reach the sinks.
        let frames = vec![
            ServerFrame::result(ExitResult {
                exited: true,
                exit_code: 0,
            }),
            ServerFrame::stdout(IoChunk::data(&b"late"[..])),
        ];
        let read = futures::stream::iter(
            frames
                .into_iter()
                .map(|f| Ok::<_, WsError>(Message::Binary(wire::encode(&f).unwrap()))),
        );

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let heartbeat = Arc::new(Mutex::new(Instant::now()));
        let exit_code =
            ReadFromServer::read_from_server(read, &mut stdout, &mut stderr, heartbeat)
                .await
                .unwrap();

        assert_eq!(exit_code, 0);
        assert!(stdout.is_empty());
    }

    #[tokio::test]
    async fn close_without_result_is_an_error() {
        let read = futures::stream::iter(vec![Ok::<_, WsError>(Message::Close(None))]);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let heartbeat = Arc::new(Mutex::new(Instant::now()));
        let err = ReadFromServer::read_from_server(read, &mut stdout, &mut stderr, heartbeat)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ClosedWithoutResult { .. }));
    }

    #[tokio::test]
    async fn spawn_failure_frame_carries_reason_and_code() {
        let frames = vec![ServerFrame::spawn_failure("Failed to spawn '/no/such/binary'")];
        let read = futures::stream::iter(
            frames
                .into_iter()
                .map(|f| Ok::<_, WsError>(Message::Binary(wire::encode(&f).unwrap()))),
        );

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let heartbeat = Arc::new(Mutex::new(Instant::now()));
        let exit_code =
            ReadFromServer::read_from_server(read, &mut stdout, &mut stderr, heartbeat)
                .await
                .unwrap();

        assert_eq!(exit_code, agent_model::SPAWN_FAILURE_EXIT_CODE);
        let stderr = String::from_utf8(stderr).unwrap();
        assert!(stderr.contains("/no/such/binary"));
    }
}
