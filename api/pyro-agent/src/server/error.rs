use actix_web::error::ResponseError;
use actix_web::http::StatusCode;
use snafu::Snafu;
use std::io;

// Server (router/handler) errors live together so it's easy to define response codes for all the
// high-level types of errors that could happen during a request.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum Error {
    #[snafu(display("No command given"))]
    NoCommandGiven,

    #[snafu(display("Unable to bind to {}: {}", address, source))]
    BindAddress { address: String, source: io::Error },

    #[snafu(display("Unable to start server: {}", source))]
    ServerStart { source: io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;

impl ResponseError for Error {
    /// The default error_response renders the Display text; we only pick the status codes.  The
    /// agent is a trusted-network service, so error details are not scrubbed from responses.
    fn status_code(&self) -> StatusCode {
        match self {
            Error::NoCommandGiven => StatusCode::BAD_REQUEST,
            Error::BindAddress { .. } | Error::ServerStart { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}
