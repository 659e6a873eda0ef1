#![deny(rust_2018_idioms)]

//! The pyro-agent library implements the agent service: an HTTP surface with a one-shot
//! command-execution handler and a WebSocket-based streaming execution engine.  The `pyro-agent`
//! binary wraps `serve` with argument parsing and logger setup.

pub mod server;

pub use crate::server::serve;
