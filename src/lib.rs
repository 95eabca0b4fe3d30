//! dblane: a non-blocking PostgreSQL client driver.
//!
//! One connection, one state machine: requests are queued, dispatched in
//! submission order, and answered through callbacks. Pipeline mode lets the
//! queue fan out onto the wire; LISTEN/NOTIFY messages route to per-channel
//! subscriptions; prepared statements are cached per physical connection and
//! transparently re-prepared after a reconnect.
//!
//! ```no_run
//! use dblane::{Driver, PgDriver, ReceiverToken, TcpLink};
//!
//! # async fn demo() -> dblane::Result<()> {
//! let mut driver = PgDriver::from_uri("postgres:///?host=db&user=app&dbname=app")?;
//! let link = TcpLink::establish(&driver).await?;
//! driver.open(Box::new(|ok, status| println!("open: {} ({})", ok, status)));
//! driver.exec(
//!     "SELECT now()",
//!     &[],
//!     Some(Box::new(|results| println!("{} rows", results.size()))),
//!     ReceiverToken::always(),
//! );
//! link.run(&mut driver).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod driver;
mod error;
mod pg;

pub use config::{Config, SessionAttrs};
pub use driver::{
    ConnState, Driver, Notification, NotificationFn, OpenFn, PipelineStatus, Receiver,
    ReceiverToken, ResultFn, StateChangedFn,
};
pub use error::{Error, Result};
pub use pg::{Oid, PgDriver, PreparedStatement, Results, SharedColumns, TcpLink, Value};
