//! The backend-independent driver surface.
//!
//! `Driver` is the seam between the host application and a concrete backend.
//! Exactly one implementation is selected at construction time; there is no
//! deeper hierarchy. All operations are non-blocking: submission returns
//! immediately and results arrive through registered callbacks on later
//! event-loop turns.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::pg::result::Results;
use crate::pg::statement::PreparedStatement;
use crate::pg::types::Value;

/// Connection lifecycle states.
///
/// Handshake sub-phases (startup sent, authenticating) are internal to the
/// backend and never observable through this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Disconnected => write!(f, "disconnected"),
            ConnState::Connecting => write!(f, "connecting"),
            ConnState::Connected => write!(f, "connected"),
        }
    }
}

/// Pipeline controller status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineStatus {
    #[default]
    Off,
    On,
    Aborted,
}

/// An asynchronously delivered LISTEN/NOTIFY message.
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    /// Process id of the notifying backend.
    pub backend_pid: i32,
}

/// Completion callback for a queued request.
///
/// `FnMut` because single-row mode delivers one invocation per row before the
/// final one.
pub type ResultFn = Box<dyn FnMut(Results)>;

/// Callback for notification delivery.
pub type NotificationFn = Box<dyn FnMut(&Notification)>;

/// Callback observing every state transition.
pub type StateChangedFn = Box<dyn FnMut(ConnState, &str)>;

/// One-shot callback for `open`.
pub type OpenFn = Box<dyn FnOnce(bool, &str)>;

struct Liveness;

/// Caller-owned liveness marker for completion callbacks.
///
/// A request holds only a weak back-reference; dropping the `Receiver` before
/// the reply arrives makes the callback a silent no-op, while the request
/// still runs to completion on the wire and leaves the queue.
pub struct Receiver {
    alive: Arc<Liveness>,
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            alive: Arc::new(Liveness),
        }
    }

    /// A token to attach to a submitted request.
    pub fn token(&self) -> ReceiverToken {
        ReceiverToken(Some(Arc::downgrade(&self.alive)))
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

/// Weak liveness token carried by a request; checked only at
/// callback-invocation time.
#[derive(Clone, Default)]
pub struct ReceiverToken(Option<Weak<Liveness>>);

impl ReceiverToken {
    /// A token with no receiver: the callback always fires.
    pub fn always() -> Self {
        ReceiverToken(None)
    }

    pub(crate) fn is_live(&self) -> bool {
        match &self.0 {
            None => true,
            Some(weak) => weak.strong_count() > 0,
        }
    }
}

/// Driver operation surface consumed by the host application.
pub trait Driver {
    /// Initiate the handshake. `cb` fires exactly once with
    /// `(success, status text)` when the state first leaves `Connecting`.
    fn open(&mut self, cb: OpenFn);

    fn is_open(&self) -> bool;

    fn state(&self) -> ConnState;

    /// Hook invoked on every state transition with the new state and a
    /// human-readable status string.
    fn on_state_changed(&mut self, cb: StateChangedFn);

    /// Queue a text query. Dispatches immediately when capacity allows.
    fn exec(&mut self, query: &str, params: &[Value], cb: Option<ResultFn>, receiver: ReceiverToken);

    /// Queue execution of a prepared statement, preparing it first on this
    /// connection if needed.
    fn exec_prepared(
        &mut self,
        statement: &PreparedStatement,
        params: &[Value],
        cb: Option<ResultFn>,
        receiver: ReceiverToken,
    );

    fn begin(&mut self, cb: Option<ResultFn>, receiver: ReceiverToken);
    fn commit(&mut self, cb: Option<ResultFn>, receiver: ReceiverToken);
    fn rollback(&mut self, cb: Option<ResultFn>, receiver: ReceiverToken);

    /// Mark the most recently queued request for incremental, one-row-per-
    /// callback delivery.
    fn set_last_query_single_row_mode(&mut self);

    /// Allow submissions to hit the wire without waiting for earlier
    /// completions. `auto_sync` bounds how long dispatched-but-unsynced work
    /// may sit before an implicit sync is forced.
    fn enter_pipeline_mode(&mut self, auto_sync: Option<Duration>) -> bool;

    /// Leave pipeline mode. Only legal once every emitted sync point has been
    /// acknowledged; returns `false` otherwise.
    fn exit_pipeline_mode(&mut self) -> bool;

    fn pipeline_status(&self) -> PipelineStatus;

    /// Emit a sync point and flush the wire buffer.
    fn pipeline_sync(&mut self) -> bool;

    fn subscribe_to_notification(
        &mut self,
        channel: &str,
        cb: NotificationFn,
        receiver: ReceiverToken,
    );
    fn unsubscribe_from_notification(&mut self, channel: &str);
    fn subscribed_to_notifications(&self) -> Vec<String>;

    /// Drop the physical connection. Queued work drains with an error.
    fn close(&mut self);
}
