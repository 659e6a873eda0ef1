//! The agent-model crate holds the types that the pyro client and the pyro agent exchange for
//! remote command execution.
//!
//! The streaming path multiplexes three byte streams and the exit result over one WebSocket;
//! every Binary message on the socket carries exactly one frame, encoded through the `wire`
//! module.  The one-shot path reuses the same chunk type inside a JSON request/response pair.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The exit code reserved for "the process could not be started"; normal child exits carry the
/// child's actual status.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = -2;

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Client frames to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Must be the first frame of a session; tells the agent what to run.  It is not
    /// acknowledged; the next server frame is already output or a result.
    Prepare(Prepare),
    /// A segment of the caller's standard input.
    Stdin(IoChunk),
}

/// Tells the agent which command to execute and with what environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prepare {
    /// The program and its arguments; the first token is the program.  Must be non-empty.
    pub command: Vec<String>,
    /// The child process environment.  The agent replaces its own environment with this map
    /// rather than merging, so the caller controls exactly what the child sees.
    pub environment: HashMap<String, String>,
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Server frames to client.  Normally exactly one field is set per frame.  The exception is the
/// report for a child that could not be started, which carries the reason on `stderr` together
/// with the reserved `-2` exit code in `result` so both arrive before the channel closes.
///
/// A frame with `result` set is terminal: no server frame follows it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerFrame {
    pub stdout: Option<IoChunk>,
    pub stderr: Option<IoChunk>,
    pub result: Option<ExitResult>,
}

impl ServerFrame {
    /// A frame carrying a segment of the child's standard output.
    pub fn stdout(chunk: IoChunk) -> Self {
        Self {
            stdout: Some(chunk),
            ..Self::default()
        }
    }

    /// A frame carrying a segment of the child's standard error.
    pub fn stderr(chunk: IoChunk) -> Self {
        Self {
            stderr: Some(chunk),
            ..Self::default()
        }
    }

    /// The terminal frame, carrying the child's exit result.
    pub fn result(result: ExitResult) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    /// The in-band report for a child that could not be started: the reason as a closing stderr
    /// chunk, plus the reserved exit code.
    pub fn spawn_failure(reason: &str) -> Self {
        Self {
            stdout: None,
            stderr: Some(IoChunk {
                close: true,
                data: reason.as_bytes().to_vec(),
            }),
            result: Some(ExitResult {
                exited: true,
                exit_code: SPAWN_FAILURE_EXIT_CODE,
            }),
        }
    }
}

/// The child's exit result.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    pub exited: bool,
    pub exit_code: i32,
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// One segment of one stream.  `data` may be empty and `close` marks end-of-stream; a chunk with
/// neither is a legal no-op.  Receivers must not rely on chunk boundaries matching the sender's
/// write boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoChunk {
    pub close: bool,
    pub data: Vec<u8>,
}

impl IoChunk {
    /// A chunk carrying data, with the stream left open.
    pub fn data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            close: false,
            data: data.into(),
        }
    }

    /// The end-of-stream marker.
    pub fn closed() -> Self {
        Self {
            close: true,
            data: Vec::new(),
        }
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=
// One-shot execution path

/// Request to run a command to completion, without streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteCommandRequest {
    pub command: Vec<String>,
    pub environment: HashMap<String, String>,
}

/// Response for the one-shot path: the full captured output, both chunks closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteCommandResponse {
    pub stdout: IoChunk,
    pub stderr: IoChunk,
    pub exit_code: i32,
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

pub mod wire {
    //! The 'wire' module is the single encoding point for frames on the streaming channel.  The
    //! WebSocket layer provides message boundaries, so frames need no length prefix of their own.

    use serde::{de::DeserializeOwned, Serialize};
    use snafu::ResultExt;

    /// Encodes one frame for transmission as a single WebSocket Binary message.
    pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>> {
        bincode::serialize(frame).context(error::EncodeSnafu)
    }

    /// Decodes one received WebSocket Binary message into a frame.
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).context(error::DecodeSnafu)
    }

    mod error {
        use snafu::Snafu;

        #[derive(Debug, Snafu)]
        #[snafu(visibility(pub(super)))]
        pub enum Error {
            #[snafu(display("Failed to encode frame: {}", source))]
            Encode { source: bincode::Error },

            #[snafu(display("Failed to decode frame: {}", source))]
            Decode { source: bincode::Error },
        }
    }
    pub use error::Error;
    type Result<T> = std::result::Result<T, error::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_tag_survives_the_wire() {
        let prepare = ClientFrame::Prepare(Prepare {
            command: vec!["cat".to_string()],
            environment: HashMap::new(),
        });
        let bytes = wire::encode(&prepare).unwrap();
        match wire::decode(&bytes).unwrap() {
            ClientFrame::Prepare(p) => assert_eq!(p.command, vec!["cat".to_string()]),
            other => panic!("expected Prepare, got {:?}", other),
        }

        let stdin = ClientFrame::Stdin(IoChunk::data(&b"abc"[..]));
        let bytes = wire::encode(&stdin).unwrap();
        match wire::decode(&bytes).unwrap() {
            ClientFrame::Stdin(chunk) => {
                assert_eq!(chunk.data, b"abc");
                assert!(!chunk.close);
            }
            other => panic!("expected Stdin, got {:?}", other),
        }
    }

    #[test]
    fn server_frame_keeps_its_slot() {
        let frame = ServerFrame::stderr(IoChunk::data(&b"oops"[..]));
        let decoded: ServerFrame = wire::decode(&wire::encode(&frame).unwrap()).unwrap();
        assert!(decoded.stdout.is_none());
        assert!(decoded.result.is_none());
        assert_eq!(decoded.stderr.unwrap().data, b"oops");
    }

    #[test]
    fn spawn_failure_reports_reserved_code() {
        let frame = ServerFrame::spawn_failure("no such file or directory");
        let stderr = frame.stderr.unwrap();
        assert!(stderr.close);
        assert!(!stderr.data.is_empty());
        let result = frame.result.unwrap();
        assert!(result.exited);
        assert_eq!(result.exit_code, SPAWN_FAILURE_EXIT_CODE);
    }

    #[test]
    fn empty_chunk_is_representable() {
        let decoded: IoChunk = wire::decode(&wire::encode(&IoChunk::default()).unwrap()).unwrap();
        assert!(!decoded.close);
        assert!(decoded.data.is_empty());
    }
}
