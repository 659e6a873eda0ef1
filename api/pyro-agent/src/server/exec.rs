//! The 'exec' module is the streaming execution engine.  Each WebSocket session runs one
//! requested process: the first client frame carries the preparation (command and environment),
//! stdin chunks feed the child's input, and the child's output and exit result flow back as
//! server frames, with the result guaranteed to be the last frame on the wire.

// Implementation note: this module manages the WebSocket, which is created for us by Actix, and
// Actix works with 'actors' - individual entities that can send each other different message
// types and take action as desired.  Their message handlers aren't async, so you won't see
// async/await here.  The 'child' module manages the child process, and for simplicity of
// communication between the WebSocket actor and the child, it's not async either - it uses
// standard threads and channels.  The actor is the serialization point: every frame to the
// client passes through its mailbox in order.
//
// The frame rules themselves live in Session, which knows nothing about WebSockets; the actor
// decodes messages, feeds them to the session, and turns the outcome into channel actions.
// That split is what lets the protocol be exercised in tests without a live connection.

use actix::prelude::{Actor, ActorContext, Addr, AsyncContext, Handler, SendError, StreamHandler};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws::{self, Message};
use agent_model::{wire, ClientFrame, IoChunk, Prepare, ServerFrame};
use log::{debug, error, info};
use std::thread;
use std::time::{Duration, Instant};

mod child;
mod streamio;
use child::ChildHandles;
use streamio::FrameSink;

/// To guard against stale connections, we send ping and pong messages through the channel
/// regularly as a 'heartbeat'; this is how often we send them.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);
/// If we haven't heard from the client in this much time, we consider it gone and we stop.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Starts the WebSocket, handing control of the message stream to our WsExec actor.
pub(crate) async fn ws_exec_stream(
    r: HttpRequest,
    stream: web::Payload,
) -> Result<HttpResponse, Error> {
    info!(
        "Received exec stream request to {}:{}",
        r.connection_info().host(),
        r.path()
    );

    ws::start(WsExec::new(), &r, stream)
}

/// WsExec is an actor representing one execution session, from the accepted connection to the
/// terminal frame.  All frames to and from the client pass through it; the 'child' module holds
/// its address so process output and the exit result can be turned into WebSocket messages.
#[derive(Debug)]
pub(crate) struct WsExec {
    /// This tracks the last time we heard from the client; if it's been too long, we consider
    /// the connection stale and terminate it.
    heartbeat: Instant,

    /// The protocol state for this connection.
    session: Session,
}

impl WsExec {
    fn new() -> Self {
        Self {
            heartbeat: Instant::now(),
            session: Session::default(),
        }
    }

    /// This starts a task that's responsible for confirming that our connection to the client
    /// isn't stale.  We ping the client regularly so it knows we're alive, and we confirm that
    /// the client has pinged us recently so we know it's alive.
    fn heartbeat(&self, ctx: &mut <Self as Actor>::Context) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |actor, ctx| {
            // If we don't hear from the client in a while, consider it stale and terminate.
            if Instant::now().duration_since(actor.heartbeat) > CLIENT_TIMEOUT {
                info!("exec client heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }

            debug!("exec client heartbeat ok, sending ping");
            ctx.ping(b"");
        });
    }
}

impl Actor for WsExec {
    // This tells Actix to give us access to a WebsocketContext in every handler, and the
    // WebsocketContext lets us send messages or stop as needed.
    type Context = ws::WebsocketContext<Self>;

    /// When the actor is first started, set up the heartbeat.  The preparation frame is not
    /// acknowledged, so there's nothing to send until the child produces output.
    fn started(&mut self, ctx: &mut Self::Context) {
        debug!("Starting exec session heartbeat");
        self.heartbeat(ctx);
    }

    /// Runs on every termination path.  The session exclusively owns the child, so the child
    /// must not outlive it; for a child that already exited the signal has no target and the
    /// send fails quietly.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.session.shutdown();
    }
}

impl StreamHandler<Result<Message, ws::ProtocolError>> for WsExec {
    /// This handler is run every time we receive a message from the client.  Binary messages
    /// each carry one encoded client frame, which the session applies; everything else is
    /// connection management.
    fn handle(&mut self, msg: Result<Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            // Respond to Ping with Pong so the client knows we're alive, and record that we've
            // heard from them.
            Ok(Message::Ping(msg)) => {
                debug!("Received ping, updating heartbeat and responding");
                self.heartbeat = Instant::now();
                ctx.pong(&msg);
            }

            // When the client responds to our Ping with a Pong, record that we've heard from
            // them.
            Ok(Message::Pong(_)) => {
                debug!("Received pong, updating heartbeat");
                self.heartbeat = Instant::now();
            }

            Ok(Message::Binary(data)) => {
                let frame = match wire::decode::<ClientFrame>(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        stop(
                            ctx,
                            Some(format!("invalid frame from client: {}", e)),
                            ws::CloseCode::Invalid,
                        );
                        return;
                    }
                };

                match self.session.handle_frame(frame, WsSink::new(ctx.address())) {
                    FrameOutcome::Continue => {}

                    // The in-band failure report rides the mailbox like any output frame, and
                    // being terminal it closes the channel behind itself.
                    FrameOutcome::ReportSpawnFailure(frame) => {
                        ctx.notify(message::SendFrame(frame))
                    }

                    FrameOutcome::Violation(code, reason) => stop(ctx, Some(reason), code),
                }
            }

            // The protocol is binary-only; control information rides in the frames themselves.
            Ok(Message::Text(_)) => {
                stop(
                    ctx,
                    Some("text messages not supported".to_string()),
                    ws::CloseCode::Unsupported,
                );
            }

            // This means the client is done with us; stop the actor.
            Ok(Message::Close(reason)) => {
                info!("Client closed exec session with reason: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }

            // We don't use Continuation frames; it's easier to deal with individual Binary
            // messages.
            Ok(Message::Continuation(_)) => {
                stop(
                    ctx,
                    Some("continuation messages not supported".to_string()),
                    ws::CloseCode::Unsupported,
                );
            }

            // no-op
            Ok(Message::Nop) => {}

            Err(e) => {
                error!("Stopping after receiving error message: {}", e);
                // A receive failure is terminal for the session; latch it so the child's stdin
                // reader sees a failed read rather than a clean end-of-input.
                self.session.fail_input(format!("receive error: {}", e));
                ctx.stop();
            }
        }
    }

    /// We hit finished() as soon as the client closes the channel or drops; it's the session's
    /// cancellation signal.  Stopping the actor takes the child down with it (see stopped).
    fn finished(&mut self, ctx: &mut Self::Context) {
        info!("exec client disconnected");
        ctx.stop();
    }
}

/// Sends a Close with the given code and reason to the client and stops the session actor.
/// Used on protocol violations and transport failures, where no result frame is owed, and
/// behind the terminal frame, where the work is done and there's nothing to say.
fn stop(ctx: &mut ws::WebsocketContext<WsExec>, reason: Option<String>, code: ws::CloseCode) {
    match &reason {
        Some(reason) => info!("Closing exec session; reason: {}", reason),
        None => info!("Closing exec session"),
    }
    ctx.close(Some(ws::CloseReason {
        code,
        description: reason,
    }));
    ctx.stop();
}

/// Session holds the per-connection protocol state and applies the frame rules: exactly one
/// preparation per session, a non-empty command, no input before a consumer exists.  It knows
/// nothing about the transport; the actor maps each outcome onto the channel.
#[derive(Debug, Default)]
struct Session {
    /// The child process spawned for this session.  It's an Option because nothing is spawned
    /// until the client sends its preparation frame.
    child_handles: Option<ChildHandles>,

    /// Set when the requested process couldn't be started.  The session's one preparation is
    /// spent even though no child exists, and stdin frames the client pipelined behind it must
    /// not be treated as a protocol violation.
    spawn_failed: bool,
}

/// What the transport must do after the session handles a client frame.  Output and result
/// frames don't appear here; they travel through the session's sink.
#[derive(Debug)]
enum FrameOutcome {
    /// The frame was consumed; the session continues.
    Continue,

    /// The requested process could not be started: deliver this terminal frame so the reason
    /// and the reserved exit code reach the client in-band.
    ReportSpawnFailure(ServerFrame),

    /// Protocol violation: close the channel with this code and reason.  No server frame has
    /// been sent and none follows.
    Violation(ws::CloseCode, String),
}

impl Session {
    /// Applies one client frame: a preparation spawns the requested process, stdin chunks are
    /// routed to it.
    fn handle_frame<S>(&mut self, frame: ClientFrame, sink: S) -> FrameOutcome
    where
        S: FrameSink + Clone + 'static,
    {
        match frame {
            ClientFrame::Prepare(prepare) => self.prepare(prepare, sink),
            ClientFrame::Stdin(chunk) => self.stdin_chunk(chunk),
        }
    }

    /// Handles the preparation frame: validates it, spawns the requested process, and keeps the
    /// handles.  A process that can't be started is reported in-band with the reserved exit
    /// code so the exit surface stays uniform.
    fn prepare<S>(&mut self, prepare: Prepare, sink: S) -> FrameOutcome
    where
        S: FrameSink + Clone + 'static,
    {
        // One preparation per session.  A failed spawn spent it too: its terminal frame is
        // already on the way, and quietly spawning a second command behind that report would
        // run a process whose existence the client never learns of.
        if self.child_handles.is_some() || self.spawn_failed {
            return FrameOutcome::Violation(
                ws::CloseCode::Policy,
                "session is already prepared".to_string(),
            );
        }
        if prepare.command.is_empty() {
            return FrameOutcome::Violation(ws::CloseCode::Policy, "no command given".to_string());
        }

        debug!(
            "Client prepared command {:?} with {} environment entries",
            prepare.command,
            prepare.environment.len()
        );
        match ChildHandles::new(prepare, sink) {
            Ok(child_handles) => {
                self.child_handles = Some(child_handles);
                FrameOutcome::Continue
            }

            Err(e @ child::Error::Spawn { .. }) => {
                info!("Failed to spawn requested process: {}", e);
                self.spawn_failed = true;
                FrameOutcome::ReportSpawnFailure(ServerFrame::spawn_failure(&e.to_string()))
            }

            Err(e) => FrameOutcome::Violation(
                ws::CloseCode::Error,
                format!("failed to start process: {}", e),
            ),
        }
    }

    /// Routes one stdin chunk to the child's input pipe.
    fn stdin_chunk(&mut self, chunk: IoChunk) -> FrameOutcome {
        // Input pipelined behind a preparation whose spawn failed has nowhere to go; the
        // terminal failure frame is already on its way.
        if self.spawn_failed {
            return FrameOutcome::Continue;
        }

        match &self.child_handles {
            Some(child_handles) => {
                child_handles.stdin.push_chunk(chunk);
                FrameOutcome::Continue
            }
            None => FrameOutcome::Violation(
                ws::CloseCode::Policy,
                "process data sent before preparation".to_string(),
            ),
        }
    }

    /// Latches a transport receive failure into the stdin adapter so the child sees a failed
    /// read rather than a clean end-of-input.
    fn fail_input(&self, reason: String) {
        if let Some(child_handles) = &self.child_handles {
            child_handles.stdin.fail(reason);
        }
    }

    /// Releases the session's hold on the child: the process is signaled and the input stream
    /// closed so every supervision thread can finish.
    fn shutdown(&self) {
        if let Some(child_handles) = &self.child_handles {
            child_handles.stop();
            if let Err(e) = child_handles.stdin.close() {
                debug!("Session stdin already closed: {}", e);
            }
        }
    }
}

/// The 'message' module contains the non-WebSocket messages our actor can handle; they're how
/// the child's supervision threads talk to the session so frames can be sent to the client.
mod message {
    use agent_model::ServerFrame;

    /// One frame to deliver to the client.  A frame carrying a result is terminal: after
    /// sending it, the session closes the channel.
    #[derive(actix::Message)]
    #[rtype(result = "()")]
    pub(super) struct SendFrame(pub(super) ServerFrame);

    /// Tears the session down without a result frame.
    #[derive(actix::Message)]
    #[rtype(result = "()")]
    pub(super) struct Abort(pub(super) String);
}

impl Handler<message::SendFrame> for WsExec {
    type Result = ();

    /// Delivers one frame to the client.  Frames from the output readers and the wait thread
    /// arrive here in mailbox order, so the terminal frame is always the last one on the wire.
    fn handle(&mut self, msg: message::SendFrame, ctx: &mut Self::Context) -> Self::Result {
        if let Some(result) = &msg.0.result {
            info!("exec process returned {}", result.exit_code);
        }

        let terminal = msg.0.result.is_some();
        let bytes = match wire::encode(&msg.0) {
            Ok(bytes) => bytes,
            Err(e) => {
                stop(
                    ctx,
                    Some(format!("failed to encode frame: {}", e)),
                    ws::CloseCode::Error,
                );
                return;
            }
        };
        ctx.binary(bytes);

        if terminal {
            // Nothing follows the result; close normally behind it.
            stop(ctx, None, ws::CloseCode::Normal);
        }
    }
}

impl Handler<message::Abort> for WsExec {
    type Result = ();

    /// Ends the session without a result; the client reports the reason as a local failure.
    fn handle(&mut self, msg: message::Abort, ctx: &mut Self::Context) -> Self::Result {
        stop(ctx, Some(msg.0), ws::CloseCode::Error);
    }
}

/// WsSink lets the child's supervision threads deliver frames through the session actor.  Sends
/// go through the actor mailbox, which preserves order.  If the mailbox is full we wait and
/// retry; there's no backpressure to manage here because the child can't produce unbounded
/// output while we're not reading it.
#[derive(Clone)]
struct WsSink {
    addr: Addr<WsExec>,
}

impl WsSink {
    fn new(addr: Addr<WsExec>) -> Self {
        Self { addr }
    }
}

impl FrameSink for WsSink {
    fn send_frame(&self, frame: ServerFrame) -> streamio::Result<()> {
        let mut msg = message::SendFrame(frame);
        loop {
            match self.addr.try_send(msg) {
                Ok(()) => return Ok(()),

                // Mailbox full; wait a bit and try again.
                Err(SendError::Full(returned)) => {
                    msg = returned;
                    thread::sleep(Duration::from_millis(10));
                }

                // The actor stopped, so we're done; there is no more client.
                Err(SendError::Closed(_msg)) => return Err(streamio::Error::SessionGone),
            }
        }
    }

    fn abort(&self, reason: String) {
        self.addr.do_send(message::Abort(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_model::SPAWN_FAILURE_EXIT_CODE;
    use std::collections::HashMap;
    use std::sync::mpsc;

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

    fn prepare_frame(command: &[&str]) -> ClientFrame {
        ClientFrame::Prepare(Prepare {
            command: command.iter().map(|s| s.to_string()).collect(),
            environment: HashMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
        })
    }

    fn policy_violation(outcome: FrameOutcome) -> String {
        match outcome {
            FrameOutcome::Violation(ws::CloseCode::Policy, reason) => reason,
            other => panic!("expected a policy violation, got {:?}", other),
        }
    }

    #[test]
    fn stdin_before_preparation_is_rejected() {
        let (sink, rx) = TestSink::new();
        let mut session = Session::default();

        let outcome = session.handle_frame(ClientFrame::Stdin(IoChunk::data(&b"x"[..])), sink);

        let reason = policy_violation(outcome);
        assert!(reason.contains("before preparation"));
        // Nothing was spawned and no server frame went out.
        assert!(session.child_handles.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn empty_command_is_rejected_before_any_spawn() {
        let (sink, rx) = TestSink::new();
        let mut session = Session::default();

        let outcome = session.handle_frame(prepare_frame(&[]), sink);

        let reason = policy_violation(outcome);
        assert!(reason.contains("no command given"));
        assert!(session.child_handles.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn second_preparation_is_rejected() {
        let (sink, _rx) = TestSink::new();
        let mut session = Session::default();

        let outcome = session.handle_frame(prepare_frame(&["/bin/true"]), sink.clone());
        assert!(matches!(outcome, FrameOutcome::Continue));

        let outcome = session.handle_frame(prepare_frame(&["/bin/true"]), sink);
        let reason = policy_violation(outcome);
        assert!(reason.contains("already prepared"));

        session.shutdown();
    }

    #[test]
    fn spawn_failure_is_reported_in_band_with_a_terminal_frame() {
        let (sink, rx) = TestSink::new();
        let mut session = Session::default();

        let outcome = session.handle_frame(prepare_frame(&["/no/such/binary"]), sink);
        let frame = match outcome {
            FrameOutcome::ReportSpawnFailure(frame) => frame,
            other => panic!("expected a spawn failure report, got {:?}", other),
        };

        // The reason arrives as a closing stderr chunk...
        let stderr = frame.stderr.clone().unwrap();
        assert!(stderr.close);
        assert!(String::from_utf8(stderr.data).unwrap().contains("/no/such/binary"));

        // ...alongside the reserved exit code.  The result makes the frame terminal, which is
        // what drives the Normal close once it has been sent.
        let result = frame.result.unwrap();
        assert!(result.exited);
        assert_eq!(result.exit_code, SPAWN_FAILURE_EXIT_CODE);

        // The report is the outcome itself; nothing was smuggled through the sink.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn preparation_after_a_failed_spawn_is_rejected() {
        let (sink, rx) = TestSink::new();
        let mut session = Session::default();

        let outcome = session.handle_frame(prepare_frame(&["/no/such/binary"]), sink.clone());
        assert!(matches!(outcome, FrameOutcome::ReportSpawnFailure(_)));

        // The session's one preparation is spent; a second command must not quietly run behind
        // the failure report.
        let outcome = session.handle_frame(prepare_frame(&["/bin/true"]), sink);
        let reason = policy_violation(outcome);
        assert!(reason.contains("already prepared"));
        assert!(session.child_handles.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stdin_after_a_failed_spawn_is_swallowed() {
        let (sink, rx) = TestSink::new();
        let mut session = Session::default();

        let outcome = session.handle_frame(prepare_frame(&["/no/such/binary"]), sink.clone());
        assert!(matches!(outcome, FrameOutcome::ReportSpawnFailure(_)));

        // Chunks the client pipelined behind its preparation are not a violation; they're
        // simply dropped while the failure report makes its way out.
        let outcome =
            session.handle_frame(ClientFrame::Stdin(IoChunk::data(&b"late"[..])), sink.clone());
        assert!(matches!(outcome, FrameOutcome::Continue));

        let outcome = session.handle_frame(ClientFrame::Stdin(IoChunk::closed()), sink);
        assert!(matches!(outcome, FrameOutcome::Continue));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stdin_chunks_route_to_the_prepared_child() {
        let (sink, rx) = TestSink::new();
        let mut session = Session::default();

        let outcome = session.handle_frame(prepare_frame(&["/bin/cat"]), sink.clone());
        assert!(matches!(outcome, FrameOutcome::Continue));

        let outcome =
            session.handle_frame(ClientFrame::Stdin(IoChunk::data(&b"echoed"[..])), sink.clone());
        assert!(matches!(outcome, FrameOutcome::Continue));
        let outcome = session.handle_frame(ClientFrame::Stdin(IoChunk::closed()), sink);
        assert!(matches!(outcome, FrameOutcome::Continue));

        // The child sees the bytes and the session ends with a result frame, nothing after it.
        let mut stdout = Vec::new();
        loop {
            let frame = rx
                .recv_timeout(Duration::from_secs(10))
                .expect("no result frame within timeout");
            if let Some(chunk) = frame.stdout {
                stdout.extend(chunk.data);
            }
            if let Some(result) = frame.result {
                assert_eq!(result.exit_code, 0);
                break;
            }
        }
        assert_eq!(stdout, b"echoed");
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
