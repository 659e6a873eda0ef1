//! The pyro binary is the command-line client for pyro services.  The `agent` subcommand talks
//! to a pyro agent; its `exec` subcommand runs a command there, either to completion or
//! interactively with the local standard streams bridged to the remote process.

// This file contains the arg parsing and high-level behavior.  The library modules contain the
// code for talking to the agent, which is intended to be reusable by other crates.

#![deny(rust_2018_idioms)]

use pyro::exec;
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use snafu::ResultExt;
use std::collections::HashMap;
use std::env;
use std::io;
use std::process;
use std::str::FromStr;

const DEFAULT_AGENT_ADDRESS: &str = "127.0.0.1:3000";

/// The exit code used when the failure is local rather than the remote command's.
const EXIT_CODE_ERROR: i32 = -2;

/// Stores user-supplied global arguments.
#[derive(Debug)]
struct Args {
    log_level: LevelFilter,
}

/// Stores the usage mode specified by the user as a subcommand.
#[derive(Debug)]
enum Subcommand {
    Agent(AgentArgs),
}

/// Stores user-supplied arguments for the 'agent' subcommand.
#[derive(Debug)]
struct AgentArgs {
    address: String,
    subcommand: AgentSubcommand,
}

/// The available 'agent' subcommands.
#[derive(Debug)]
enum AgentSubcommand {
    Exec(ExecArgs),
}

/// Stores user-supplied arguments for the 'exec' subcommand.
#[derive(Debug)]
struct ExecArgs {
    interactive: bool,
    command: Vec<String>,
}

/// Informs the user about proper usage of the program and exits.
fn usage() -> ! {
    let program_name = env::args().next().unwrap_or_else(|| "program".to_string());
    eprintln!(
        r"Usage: {} [SUBCOMMAND] [OPTION]...

        Global options:
            --log-level                Desired amount of output; trace|debug|info|warn|error
            -h | --help                Show this help text

        Subcommands:
            agent                      Interact with a pyro agent

        agent options:
            -a | --addr ADDRESS        Address of the agent; default {}

        agent subcommands:
            exec [ -i | --interactive ] COMMAND...
                                       Execute a command on the agent.  --interactive bridges
                                       local standard input and output to the remote process
                                       while it runs; without it, output is delivered once the
                                       command finishes.

        The program exits with the remote command's exit code, or {} if execution failed
        locally.",
        program_name, DEFAULT_AGENT_ADDRESS, EXIT_CODE_ERROR
    );
    process::exit(2);
}

/// Prints a more specific message before exiting through usage().
fn usage_msg<S: AsRef<str>>(msg: S) -> ! {
    eprintln!("{}\n", msg.as_ref());
    usage();
}

/// Parses user arguments into an Args structure and a Subcommand.
fn parse_args(args: env::Args) -> (Args, Subcommand) {
    let mut log_level = None;
    let mut subcommand = None;
    let mut subcommand_args = Vec::new();

    let mut iter = args.skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_ref() {
            "-h" | "--help" => usage(),

            "--log-level" => {
                let log_level_str = iter
                    .next()
                    .unwrap_or_else(|| usage_msg("Did not give argument to --log-level"));
                log_level = Some(LevelFilter::from_str(&log_level_str).unwrap_or_else(|_| {
                    usage_msg(format!("Invalid log level '{}'", log_level_str))
                }));
            }

            // Subcommands take the rest of the arguments.
            "agent" if subcommand.is_none() => {
                subcommand = Some(arg);
                subcommand_args = iter.by_ref().collect();
            }

            x => usage_msg(format!("Unknown argument '{}'", x)),
        }
    }

    let args = Args {
        log_level: log_level.unwrap_or(LevelFilter::Info),
    };
    match subcommand.as_deref() {
        Some("agent") => (args, Subcommand::Agent(parse_agent_args(subcommand_args))),
        _ => usage_msg("Missing or unknown subcommand"),
    }
}

/// Parses arguments for the 'agent' subcommand.
fn parse_agent_args(args: Vec<String>) -> AgentArgs {
    let mut address = None;
    let mut subcommand = None;
    let mut subcommand_args = Vec::new();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_ref() {
            "-a" | "--addr" => {
                address = Some(
                    iter.next()
                        .unwrap_or_else(|| usage_msg("Did not give argument to -a | --addr")),
                );
            }

            "exec" if subcommand.is_none() => {
                subcommand = Some(arg);
                subcommand_args = iter.by_ref().collect();
            }

            x => usage_msg(format!("Unknown argument '{}'", x)),
        }
    }

    let subcommand = match subcommand.as_deref() {
        Some("exec") => AgentSubcommand::Exec(parse_exec_args(subcommand_args)),
        _ => usage_msg("Missing or unknown agent subcommand"),
    };

    AgentArgs {
        address: address.unwrap_or_else(|| DEFAULT_AGENT_ADDRESS.to_string()),
        subcommand,
    }
}

/// Parses arguments for the 'exec' subcommand.
fn parse_exec_args(args: Vec<String>) -> ExecArgs {
    let mut interactive = false;
    let mut command = Vec::new();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_ref() {
            "-i" | "--interactive" if command.is_empty() => interactive = true,

            // The first other token starts the remote command, and everything after it belongs
            // to the remote command, flags included.
            _ => {
                command.push(arg);
                command.extend(iter.by_ref());
            }
        }
    }

    if command.is_empty() {
        usage_msg("Must specify a command for 'exec' to run.");
    }

    ExecArgs {
        interactive,
        command,
    }
}

/// Runs the requested subcommand, returning the exit code to mirror locally.
async fn run() -> Result<i32> {
    let (args, subcommand) = parse_args(env::args());

    // TerminalMode::Mixed will send errors to stderr and anything less to stdout.
    TermLogger::init(
        args.log_level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context(error::LoggerSnafu)?;

    match subcommand {
        Subcommand::Agent(agent) => match agent.subcommand {
            AgentSubcommand::Exec(exec_args) => {
                // The remote environment is fully caller-controlled and we have nothing to
                // impose; the agent runs the command with an empty environment.
                let environment = HashMap::new();

                let exit_code = if exec_args.interactive {
                    exec::execute_interactively(
                        &agent.address,
                        exec_args.command,
                        environment,
                        io::stdin(),
                        io::stdout(),
                        io::stderr(),
                    )
                    .await
                    .context(error::ExecSnafu)?
                } else {
                    let mut stdout = io::stdout();
                    let mut stderr = io::stderr();
                    exec::execute(
                        &agent.address,
                        exec_args.command,
                        environment,
                        &mut stdout,
                        &mut stderr,
                    )
                    .await
                    .context(error::ExecSnafu)?
                };

                Ok(exit_code)
            }
        },
    }
}

#[tokio::main]
async fn main() {
    match run().await {
        // The local process mirrors the remote command's exit code.
        Ok(exit_code) => process::exit(exit_code),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(EXIT_CODE_ERROR);
        }
    }
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub(crate) enum Error {
        #[snafu(display("Failed to execute command: {}", source))]
        Exec { source: pyro::exec::Error },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },
    }
}
type Result<T> = std::result::Result<T, error::Error>;
