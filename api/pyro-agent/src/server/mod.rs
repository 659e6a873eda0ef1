//! The server module owns the agent's API surface: the one-shot execution handler and the
//! WebSocket upgrade for streaming execution.

mod error;
mod exec;

pub use error::Error;

use actix_web::{web, App, HttpServer};
use agent_model::{ExecuteCommandRequest, ExecuteCommandResponse, IoChunk, SPAWN_FAILURE_EXIT_CODE};
use error::Result;
use log::{debug, info};
use snafu::{ensure, ResultExt};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use tokio::process::Command as AsyncCommand;

// Router

/// This is the primary interface of the module.  It defines the server and application that
/// actix spawns for requests.
pub async fn serve(bind_address: &str) -> Result<()> {
    let http_server = HttpServer::new(|| {
        App::new().service(
            web::scope("/exec")
                .route("", web::post().to(execute_command))
                .route("/stream", web::get().to(exec::ws_exec_stream)),
        )
    })
    .bind(bind_address)
    .context(error::BindAddressSnafu {
        address: bind_address,
    })?;

    info!("Started listening on {}", bind_address);

    // run() handles SIGINT and SIGTERM itself, draining in-flight calls before resolving.
    http_server.run().await.context(error::ServerStartSnafu)
}

// Handler methods called by the router

/// Runs a command to completion and returns its full captured output; the one-shot counterpart
/// of the streaming engine.  There is no input stream on this path, so the child's stdin is
/// attached to the null device and it sees end-of-input immediately.
async fn execute_command(
    request: web::Json<ExecuteCommandRequest>,
) -> Result<web::Json<ExecuteCommandResponse>> {
    let request = request.into_inner();
    debug!("Got execute command request for {:?}", request.command);

    ensure!(!request.command.is_empty(), error::NoCommandGivenSnafu);

    let mut command = AsyncCommand::new(&request.command[0]);
    command.args(&request.command[1..]);
    // The caller controls the child's environment completely; nothing leaks from the agent's
    // own environment.
    command.env_clear();
    command.envs(&request.environment);
    command.stdin(Stdio::null());

    let output = match command.output().await {
        Ok(output) => output,

        // A process that can't be started is reported in-band with the reserved exit code, like
        // the streaming path, so callers see one uniform exit surface.
        Err(e) => {
            info!("Failed to spawn requested process: {}", e);
            return Ok(web::Json(ExecuteCommandResponse {
                stdout: IoChunk::closed(),
                stderr: IoChunk {
                    close: true,
                    data: format!("Failed to spawn '{}': {}", request.command[0], e).into_bytes(),
                },
                exit_code: SPAWN_FAILURE_EXIT_CODE,
            }));
        }
    };

    let exit_code = match output.status.code() {
        Some(code) => code,
        // Use shell-style return codes for signals.
        None => 128 + output.status.signal().unwrap_or(1),
    };
    info!("exec process returned {}", exit_code);

    Ok(web::Json(ExecuteCommandResponse {
        stdout: IoChunk {
            close: true,
            data: output.stdout,
        },
        stderr: IoChunk {
            close: true,
            data: output.stderr,
        },
        exit_code,
    }))
}
