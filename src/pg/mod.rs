//! PostgreSQL backend.
//!
//! A single-connection, callback-driven client speaking the v3 wire protocol
//! with binary parameters and results:
//! - `protocol`: wire frame encoding/decoding
//! - `driver`: the non-blocking engine (queue, pipeline, notifications)
//! - `tcp`: tokio transport pump
//! - `types`: PostgreSQL type encoding/decoding
//! - `statement`: prepared statement handles and per-connection cache
//! - `result`: the typed result adaptor handed to callbacks
//! - `scram`: SCRAM-SHA-256 authentication

pub mod driver;
pub mod protocol;
mod queue;
pub mod result;
pub mod scram;
pub mod statement;
pub mod tcp;
pub mod types;


pub use driver::PgDriver;
pub use result::{Results, SharedColumns};
pub use statement::{PreparedCache, PreparedStatement};
pub use tcp::TcpLink;
pub use types::{Oid, Value};
