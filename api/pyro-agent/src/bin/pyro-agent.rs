//! This is the primary binary for the pyro agent: it parses arguments, sets up logging, and
//! serves execution requests until it receives a terminal signal.

#![deny(rust_2018_idioms)]

#[macro_use]
extern crate log;

use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use snafu::ResultExt;
use std::env;
use std::process;
use std::str::FromStr;

use pyro_agent::serve;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:3000";

type Result<T> = std::result::Result<T, error::Error>;

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display("{}", source))]
        Server { source: pyro_agent::server::Error },

        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },
    }
}

/// Stores user-supplied arguments.
struct Args {
    bind_address: String,
    log_level: LevelFilter,
}

/// Informs the user about proper usage of the program and exits.
fn usage() -> ! {
    let program_name = env::args().next().unwrap_or_else(|| "program".to_string());
    eprintln!(
        r"Usage: {}
            [ --bind ADDRESS ]
            [ --log-level trace|debug|info|warn|error ]

    Bind address defaults to {}",
        program_name, DEFAULT_BIND_ADDRESS
    );
    process::exit(2);
}

/// Prints a more specific message before exiting through usage().
fn usage_msg<S: AsRef<str>>(msg: S) -> ! {
    eprintln!("{}\n", msg.as_ref());
    usage();
}

/// Parses user arguments into an Args structure.
fn parse_args(args: env::Args) -> Args {
    let mut bind_address = None;
    let mut log_level = None;

    let mut iter = args.skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_ref() {
            "--bind" => {
                bind_address = Some(
                    iter.next()
                        .unwrap_or_else(|| usage_msg("Did not give argument to --bind")),
                )
            }

            "--log-level" => {
                let log_level_str = iter
                    .next()
                    .unwrap_or_else(|| usage_msg("Did not give argument to --log-level"));
                log_level = Some(LevelFilter::from_str(&log_level_str).unwrap_or_else(|_| {
                    usage_msg(format!("Invalid log level '{}'", log_level_str))
                }));
            }

            _ => usage(),
        }
    }

    Args {
        bind_address: bind_address.unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
        log_level: log_level.unwrap_or(LevelFilter::Info),
    }
}

/// Starts the web server that accepts execution requests.
async fn run() -> Result<()> {
    let args = parse_args(env::args());

    // TerminalMode::Mixed will send errors to stderr and anything less to stdout.
    TermLogger::init(
        args.log_level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .context(error::LoggerSnafu)?;

    info!("Starting pyro agent at {}", args.bind_address);

    serve(&args.bind_address).await.context(error::ServerSnafu)
}

// Returning a Result from main makes it print a Debug representation of the error, but with
// Snafu we have nice Display representations of the error, so we wrap "main" (run) and print any
// error.
#[actix_web::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}
