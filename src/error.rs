//! Error types for the driver.
//!
//! Errors are communicated as data: completion callbacks receive a `Results`
//! carrying an error flag and message, and typed getters return `Result`.
//! Nothing in this crate signals failure by panicking.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    /// An ErrorResponse from the backend, tied to a single request.
    #[error("{severity}: {message} ({code})")]
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    /// The connection was lost while the request was queued or in flight.
    #[error("Connection lost: {0}")]
    Driven(String),

    #[error("Pipeline aborted")]
    PipelineAborted,

    #[error("Cannot convert {from} to {to}")]
    Conversion { from: &'static str, to: &'static str },

    #[error("Row {row}, column {column} out of range ({rows}x{columns})")]
    OutOfRange {
        row: usize,
        column: usize,
        rows: usize,
        columns: usize,
    },
}

impl Error {
    /// Build a `Server` error from the tagged fields of an ErrorResponse.
    pub(crate) fn from_wire_fields(fields: &std::collections::HashMap<u8, String>) -> Self {
        Error::Server {
            severity: fields.get(&b'S').cloned().unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
