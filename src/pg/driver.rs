//! The PostgreSQL driver engine.
//!
//! `PgDriver` is a single-connection state machine that owns the query queue,
//! the pipeline controller, the prepared cache and the notification router.
//! It performs no I/O itself: the host pump feeds received bytes through
//! [`PgDriver::wire_input`], flushes [`PgDriver::take_wire_output`] to the
//! socket, and arms a timer from [`PgDriver::timer_deadline`]. Every callback
//! fires synchronously from inside those calls, on the pump's thread.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};

use crate::config::Config;
use crate::driver::{
    ConnState, Driver, Notification, NotificationFn, OpenFn, PipelineStatus, ReceiverToken,
    ResultFn, StateChangedFn,
};
use crate::error::{Error, Result};
use crate::pg::protocol::{self, BackendMessage};
use crate::pg::queue::{Params, QueryQueue, QueryRequest, RequestKind};
use crate::pg::result::Results;
use crate::pg::scram::ScramFlow;
use crate::pg::statement::{PreparedCache, PreparedStatement};
use crate::pg::types::{Oid, Value};

/// Handshake progress while the observable state is `Connecting`.
enum HandshakePhase {
    AwaitingAuth,
    Sasl(ScramFlow),
    AwaitingReady,
}

struct Subscription {
    cb: NotificationFn,
    receiver: ReceiverToken,
}

pub struct PgDriver {
    config: Config,
    state: ConnState,
    handshake: Option<HandshakePhase>,
    open_cb: Option<OpenFn>,
    state_cb: Option<StateChangedFn>,

    queue: QueryQueue,
    cache: PreparedCache,
    subscriptions: HashMap<String, Subscription>,

    pipeline: PipelineStatus,
    outstanding_syncs: u32,
    /// Work hit the wire since the last sync point.
    unsynced_dispatches: bool,
    auto_sync: Option<Duration>,
    last_dispatch_at: Option<Instant>,

    backend_pid: i32,
    parameters: HashMap<String, String>,

    in_buf: BytesMut,
    out_buf: BytesMut,
}

impl PgDriver {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: ConnState::Disconnected,
            handshake: None,
            open_cb: None,
            state_cb: None,
            queue: QueryQueue::default(),
            cache: PreparedCache::new(),
            subscriptions: HashMap::new(),
            pipeline: PipelineStatus::Off,
            outstanding_syncs: 0,
            unsynced_dispatches: false,
            auto_sync: None,
            last_dispatch_at: None,
            backend_pid: 0,
            parameters: HashMap::new(),
            in_buf: BytesMut::new(),
            out_buf: BytesMut::new(),
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self> {
        Ok(Self::new(Config::parse(uri)?))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process id of the server backend, once the handshake delivered it.
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// A run-time parameter reported by the server (`server_version`, ...).
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    // ------------------------------------------------------------------
    // Pump surface
    // ------------------------------------------------------------------

    /// Feed bytes received from the socket. Decodes and handles every
    /// complete frame; a partial trailing frame waits for more input.
    pub fn wire_input(&mut self, data: &[u8]) {
        self.in_buf.extend_from_slice(data);
        loop {
            if self.state == ConnState::Disconnected {
                self.in_buf.clear();
                return;
            }
            match BackendMessage::decode_next(&mut self.in_buf) {
                Ok(Some(message)) => self.on_backend_message(message),
                Ok(None) => return,
                Err(error) => {
                    warn!("wire protocol error: {}", error);
                    self.lose_connection("protocol error");
                    return;
                }
            }
        }
    }

    /// Bytes waiting to be written to the socket, if any.
    pub fn take_wire_output(&mut self) -> Option<Bytes> {
        if self.out_buf.is_empty() {
            None
        } else {
            Some(self.out_buf.split().freeze())
        }
    }

    pub fn has_wire_output(&self) -> bool {
        !self.out_buf.is_empty()
    }

    /// The socket was closed or failed. Drains everything with an error.
    pub fn wire_closed(&mut self, reason: &str) {
        if self.state != ConnState::Disconnected {
            self.lose_connection(reason);
        }
    }

    /// When the pump must call [`PgDriver::fire_timer`], if ever.
    pub fn timer_deadline(&self) -> Option<Instant> {
        let interval = self.auto_sync?;
        if self.pipeline != PipelineStatus::On || !self.unsynced_dispatches {
            return None;
        }
        self.last_dispatch_at.map(|at| at + interval)
    }

    /// The auto-sync deadline elapsed: emit an implicit sync point so
    /// pipelined work is not stranded waiting for an explicit one.
    pub fn fire_timer(&mut self) {
        if self.pipeline == PipelineStatus::On && self.unsynced_dispatches {
            debug!("auto-sync: flushing pipeline sync point");
            protocol::write_sync(&mut self.out_buf);
            self.outstanding_syncs += 1;
            self.unsynced_dispatches = false;
            self.last_dispatch_at = None;
        }
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    fn set_state(&mut self, state: ConnState, status: &str) {
        if self.state == state {
            return;
        }
        debug!("connection state: {} ({})", state, status);
        self.state = state;
        if let Some(cb) = self.state_cb.as_mut() {
            cb(state, status);
        }
    }

    /// Any transition into `Disconnected` funnels through here: queued work
    /// drains with an error, the prepared cache and subscriptions are
    /// forgotten, pipeline state resets.
    fn lose_connection(&mut self, status: &str) {
        self.handshake = None;
        self.in_buf.clear();
        self.cache.clear();
        self.subscriptions.clear();
        self.pipeline = PipelineStatus::Off;
        self.outstanding_syncs = 0;
        self.unsynced_dispatches = false;
        self.auto_sync = None;
        self.last_dispatch_at = None;
        self.backend_pid = 0;
        self.parameters.clear();

        let error = Error::Driven(status.to_string());
        for mut request in self.queue.take_all() {
            let results = Results::from_error(request.query_text().to_string(), &error);
            request.deliver(results);
        }
        if let Some(cb) = self.open_cb.take() {
            cb(false, status);
        }
        self.set_state(ConnState::Disconnected, status);
    }

    fn on_backend_message(&mut self, message: BackendMessage) {
        match self.state {
            ConnState::Connecting => self.handshake_message(message),
            ConnState::Connected => self.traffic_message(message),
            ConnState::Disconnected => {}
        }
    }

    fn handshake_message(&mut self, message: BackendMessage) {
        match message {
            BackendMessage::AuthenticationCleartextPassword => {
                match self.config.password.clone() {
                    Some(password) => protocol::write_password(&mut self.out_buf, &password),
                    None => self.lose_connection("password required but not configured"),
                }
            }
            BackendMessage::AuthenticationMd5Password { salt } => {
                match self.config.password.clone() {
                    Some(password) => {
                        let hashed = md5_password(&self.config.user, &password, salt);
                        protocol::write_password(&mut self.out_buf, &hashed);
                    }
                    None => self.lose_connection("password required but not configured"),
                }
            }
            BackendMessage::AuthenticationSasl { mechanisms } => {
                if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                    self.lose_connection("no supported SASL mechanism offered");
                    return;
                }
                let password = match self.config.password.clone() {
                    Some(password) => password,
                    None => {
                        self.lose_connection("password required but not configured");
                        return;
                    }
                };
                let mut flow = ScramFlow::new(&self.config.user, &password);
                let first = flow.client_first();
                protocol::write_sasl_initial(&mut self.out_buf, "SCRAM-SHA-256", &first);
                self.handshake = Some(HandshakePhase::Sasl(flow));
            }
            BackendMessage::AuthenticationSaslContinue { data } => {
                let response = match self.handshake.as_mut() {
                    Some(HandshakePhase::Sasl(flow)) => flow.client_final(&data),
                    _ => Err(Error::Auth("unexpected SASL challenge".to_string())),
                };
                match response {
                    Ok(payload) => protocol::write_sasl_response(&mut self.out_buf, &payload),
                    Err(error) => self.lose_connection(&error.to_string()),
                }
            }
            BackendMessage::AuthenticationSaslFinal { data } => {
                let verified = match self.handshake.as_mut() {
                    Some(HandshakePhase::Sasl(flow)) => flow.verify_server(&data),
                    _ => Err(Error::Auth("unexpected SASL signature".to_string())),
                };
                if let Err(error) = verified {
                    self.lose_connection(&error.to_string());
                }
            }
            BackendMessage::AuthenticationOk => {
                self.handshake = Some(HandshakePhase::AwaitingReady);
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            }
            BackendMessage::BackendKeyData { process_id, .. } => {
                self.backend_pid = process_id;
            }
            BackendMessage::ReadyForQuery { .. } => {
                self.handshake = None;
                self.set_state(ConnState::Connected, "connection established");
                if let Some(cb) = self.open_cb.take() {
                    cb(true, "connection established");
                }
                self.dispatch_ready();
            }
            BackendMessage::ErrorResponse { fields } => {
                let error = Error::from_wire_fields(&fields);
                self.lose_connection(&error.to_string());
            }
            BackendMessage::NoticeResponse { fields } => log_notice(&fields),
            other => trace!("ignoring handshake frame: {:?}", other),
        }
    }

    fn traffic_message(&mut self, message: BackendMessage) {
        match message {
            BackendMessage::RowDescription { fields } => {
                if let Some(head) = self.queue.head_mut() {
                    head.builder.set_columns(fields);
                } else {
                    warn!("row description with no request in flight");
                }
            }
            BackendMessage::DataRow { values } => self.on_data_row(values),
            BackendMessage::CommandComplete { tag } => self.on_command_complete(tag),
            BackendMessage::EmptyQueryResponse => self.on_command_complete(String::new()),
            BackendMessage::ReadyForQuery { .. } => self.on_ready_for_query(),
            BackendMessage::ErrorResponse { fields } => {
                self.on_server_error(Error::from_wire_fields(&fields));
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => self.route_notification(process_id, channel, payload),
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            }
            BackendMessage::NoticeResponse { fields } => log_notice(&fields),
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::PortalSuspended
            | BackendMessage::ParameterDescription { .. } => {}
            other => trace!("ignoring frame: {:?}", other),
        }
    }

    fn on_data_row(&mut self, values: Vec<Option<Bytes>>) {
        let head = match self.queue.head_mut() {
            Some(head) => head,
            None => {
                warn!("data row with no request in flight");
                return;
            }
        };
        if head.failed.is_some() {
            return;
        }
        if let Err(error) = head.builder.push_row(values) {
            head.failed = Some(error);
            return;
        }
        if head.single_row {
            let query = head.query_text().to_string();
            let results = head.builder.finish(&query, false);
            head.deliver(results);
        }
    }

    fn on_command_complete(&mut self, tag: String) {
        if self.pipeline != PipelineStatus::Off {
            // Pipelined requests complete here; the sync point is shared.
            let mut request = match self.queue.pop_head() {
                Some(request) => request,
                None => return,
            };
            request.builder.set_command_tag(tag);
            let query = request.query_text().to_string();
            let results = request.builder.finish(&query, true);
            request.deliver(results);
            return;
        }

        let head = match self.queue.head_mut() {
            Some(head) => head,
            None => return,
        };
        head.builder.set_command_tag(tag);
        // A stashed set is now known not to be the last of its request.
        if let Some(previous) = head.pending_set.take() {
            head.deliver(previous);
        }
        let query = head.query_text().to_string();
        let set = head.builder.finish(&query, false);
        head.pending_set = Some(set);
    }

    fn on_server_error(&mut self, error: Error) {
        warn!("server error: {}", error);
        match self.pipeline {
            PipelineStatus::On => self.abort_pipeline(error),
            // Further errors in an already-aborted section carry no news.
            PipelineStatus::Aborted => {}
            PipelineStatus::Off => {
                if let Some(head) = self.queue.head_mut() {
                    head.failed = Some(error);
                }
            }
        }
    }

    /// A server error in pipeline mode fails everything dispatched since the
    /// last acknowledged sync point. The causing request carries the server
    /// error; the rest fail as aborted. Undispatched backlog is kept.
    fn abort_pipeline(&mut self, error: Error) {
        self.pipeline = PipelineStatus::Aborted;
        let mut cause = Some(error);
        for mut request in self.queue.take_dispatched() {
            let query = request.query_text().to_string();
            let results = match cause.take() {
                Some(error) => Results::from_error(query, &error),
                None => Results::from_error(query, &Error::PipelineAborted),
            };
            request.deliver(results);
        }
    }

    fn on_ready_for_query(&mut self) {
        match self.pipeline {
            PipelineStatus::On => {
                self.outstanding_syncs = self.outstanding_syncs.saturating_sub(1);
            }
            PipelineStatus::Aborted => {
                // Sync points still drain while aborted; recovery itself is
                // the caller's exit-and-reenter.
                self.outstanding_syncs = self.outstanding_syncs.saturating_sub(1);
            }
            PipelineStatus::Off => {
                self.complete_head();
                self.dispatch_ready();
            }
        }
    }

    /// Non-pipeline sync point: either the prepare step of the head was
    /// acknowledged and its execute round goes out now, or the head is done.
    fn complete_head(&mut self) {
        let prepare_acked = self
            .queue
            .head_mut()
            .map(|h| h.preparing && h.failed.is_none())
            .unwrap_or(false);
        if prepare_acked {
            let out = &mut self.out_buf;
            let head = self.queue.head_mut().expect("head checked above");
            head.preparing = false;
            if let RequestKind::Prepared { name, query } = &head.kind {
                self.cache.insert(query.clone(), name.clone());
                protocol::write_bind(out, name, &head.params);
                protocol::write_describe_portal(out);
                protocol::write_execute(out);
                protocol::write_sync(out);
            }
            return;
        }

        let mut request = match self.queue.pop_head() {
            Some(request) => request,
            None => return,
        };
        let query = request.query_text().to_string();
        let results = if let Some(error) = request.failed.take() {
            request.builder.finish_error(&query, &error)
        } else if let Some(mut pending) = request.pending_set.take() {
            pending.mark_last_result_set();
            pending
        } else {
            request.builder.finish(&query, true)
        };
        request.deliver(results);
    }

    fn route_notification(&mut self, backend_pid: i32, channel: String, payload: String) {
        let sub = match self.subscriptions.get_mut(&channel) {
            Some(sub) => sub,
            None => {
                trace!("notification for unsubscribed channel {:?}", channel);
                return;
            }
        };
        if !sub.receiver.is_live() {
            trace!("dropping notification for dead receiver on {:?}", channel);
            return;
        }
        let notification = Notification {
            channel,
            payload,
            backend_pid,
        };
        (sub.cb)(&notification);
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn submit(&mut self, request: QueryRequest) {
        self.queue.push(request);
        self.dispatch_ready();
    }

    /// Serialize as many backlog entries to the wire as the current mode
    /// allows: one at a time normally, everything in pipeline mode.
    fn dispatch_ready(&mut self) {
        loop {
            if self.state != ConnState::Connected {
                return;
            }
            let capacity = match self.pipeline {
                PipelineStatus::Off => self.queue.dispatched() == 0,
                PipelineStatus::On => true,
                PipelineStatus::Aborted => false,
            };
            if !capacity || !self.queue.has_undispatched() {
                return;
            }

            let pipelined = self.pipeline == PipelineStatus::On;
            let out = &mut self.out_buf;
            let request = self
                .queue
                .next_undispatched_mut()
                .expect("undispatched entry checked above");

            match &request.kind {
                RequestKind::Text { query } => {
                    // The simple protocol carries an implicit sync, so it is
                    // only usable outside pipeline mode.
                    if request.params.is_empty() && !pipelined {
                        protocol::write_query(out, query);
                    } else {
                        let oids: Vec<Oid> =
                            request.params.iter().map(Value::type_oid).collect();
                        protocol::write_parse(out, "", query, &oids);
                        protocol::write_bind(out, "", &request.params);
                        protocol::write_describe_portal(out);
                        protocol::write_execute(out);
                        if !pipelined {
                            protocol::write_sync(out);
                        }
                    }
                }
                RequestKind::Prepared { name, query } => {
                    match self.cache.lookup(query) {
                        Some(server_name) => {
                            protocol::write_bind(out, server_name, &request.params);
                            protocol::write_describe_portal(out);
                            protocol::write_execute(out);
                            if !pipelined {
                                protocol::write_sync(out);
                            }
                        }
                        None if pipelined => {
                            // Prepare and execute ride the same batch; the
                            // server sees Parse before Bind regardless.
                            let oids: Vec<Oid> =
                                request.params.iter().map(Value::type_oid).collect();
                            protocol::write_parse(out, name, query, &oids);
                            protocol::write_bind(out, name, &request.params);
                            protocol::write_describe_portal(out);
                            protocol::write_execute(out);
                            self.cache.insert(query.clone(), name.clone());
                        }
                        None => {
                            // Prepare first; the execute round waits for the
                            // server's acknowledgement.
                            let oids: Vec<Oid> =
                                request.params.iter().map(Value::type_oid).collect();
                            protocol::write_parse(out, name, query, &oids);
                            protocol::write_sync(out);
                            request.preparing = true;
                        }
                    }
                }
            }

            self.queue.mark_dispatched();
            if pipelined {
                // Flush so replies stream back before the sync point.
                protocol::write_flush(&mut self.out_buf);
                self.unsynced_dispatches = true;
                self.last_dispatch_at = Some(Instant::now());
            }
        }
    }
}

impl Driver for PgDriver {
    fn open(&mut self, cb: OpenFn) {
        if self.state != ConnState::Disconnected {
            cb(false, "driver is already open");
            return;
        }
        self.open_cb = Some(cb);
        self.handshake = Some(HandshakePhase::AwaitingAuth);
        protocol::write_startup(&mut self.out_buf, &self.config.startup_params());
        self.set_state(ConnState::Connecting, "startup sent");
    }

    fn is_open(&self) -> bool {
        self.state == ConnState::Connected
    }

    fn state(&self) -> ConnState {
        self.state
    }

    fn on_state_changed(&mut self, cb: StateChangedFn) {
        self.state_cb = Some(cb);
    }

    fn exec(
        &mut self,
        query: &str,
        params: &[Value],
        cb: Option<ResultFn>,
        receiver: ReceiverToken,
    ) {
        let request = QueryRequest::text(
            query.to_string(),
            params.iter().cloned().collect(),
            cb,
            receiver,
        );
        self.submit(request);
    }

    fn exec_prepared(
        &mut self,
        statement: &PreparedStatement,
        params: &[Value],
        cb: Option<ResultFn>,
        receiver: ReceiverToken,
    ) {
        let request = QueryRequest::prepared(
            statement.identification().to_string(),
            statement.query().to_string(),
            params.iter().cloned().collect(),
            cb,
            receiver,
        );
        self.submit(request);
    }

    fn begin(&mut self, cb: Option<ResultFn>, receiver: ReceiverToken) {
        self.exec("BEGIN", &[], cb, receiver);
    }

    fn commit(&mut self, cb: Option<ResultFn>, receiver: ReceiverToken) {
        self.exec("COMMIT", &[], cb, receiver);
    }

    fn rollback(&mut self, cb: Option<ResultFn>, receiver: ReceiverToken) {
        self.exec("ROLLBACK", &[], cb, receiver);
    }

    fn set_last_query_single_row_mode(&mut self) {
        if let Some(last) = self.queue.last_mut() {
            last.single_row = true;
        }
    }

    fn enter_pipeline_mode(&mut self, auto_sync: Option<Duration>) -> bool {
        if self.state != ConnState::Connected
            || self.pipeline != PipelineStatus::Off
            || self.queue.dispatched() > 0
        {
            return false;
        }
        self.pipeline = PipelineStatus::On;
        self.auto_sync = auto_sync;
        self.unsynced_dispatches = false;
        self.dispatch_ready();
        true
    }

    fn exit_pipeline_mode(&mut self) -> bool {
        if self.pipeline == PipelineStatus::Off {
            return false;
        }
        // Only legal once every sync point is acknowledged and nothing is
        // still on the wire.
        if self.outstanding_syncs > 0 || self.queue.dispatched() > 0 || self.unsynced_dispatches {
            return false;
        }
        self.pipeline = PipelineStatus::Off;
        self.auto_sync = None;
        self.last_dispatch_at = None;
        self.dispatch_ready();
        true
    }

    fn pipeline_status(&self) -> PipelineStatus {
        self.pipeline
    }

    fn pipeline_sync(&mut self) -> bool {
        if self.pipeline == PipelineStatus::Off || self.state != ConnState::Connected {
            return false;
        }
        protocol::write_sync(&mut self.out_buf);
        self.outstanding_syncs += 1;
        self.unsynced_dispatches = false;
        self.last_dispatch_at = None;
        true
    }

    fn subscribe_to_notification(
        &mut self,
        channel: &str,
        cb: NotificationFn,
        receiver: ReceiverToken,
    ) {
        let is_new = !self.subscriptions.contains_key(channel);
        self.subscriptions
            .insert(channel.to_string(), Subscription { cb, receiver });
        if is_new {
            let query = format!("LISTEN {}", quote_identifier(channel));
            self.submit(QueryRequest::text(
                query.clone(),
                Params::new(),
                Some(admin_result_logger(query)),
                ReceiverToken::always(),
            ));
        }
    }

    fn unsubscribe_from_notification(&mut self, channel: &str) {
        if self.subscriptions.remove(channel).is_none() {
            return;
        }
        if self.state == ConnState::Disconnected {
            return;
        }
        let query = format!("UNLISTEN {}", quote_identifier(channel));
        self.submit(QueryRequest::text(
            query.clone(),
            Params::new(),
            Some(admin_result_logger(query)),
            ReceiverToken::always(),
        ));
    }

    fn subscribed_to_notifications(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    fn close(&mut self) {
        if self.state == ConnState::Disconnected {
            return;
        }
        if self.state == ConnState::Connected {
            // Stays in the output buffer for the pump to flush before it
            // drops the socket.
            protocol::write_terminate(&mut self.out_buf);
        }
        self.lose_connection("connection closed");
    }
}

/// `md5` + hex(md5(hex(md5(password + user)) + salt)), per the v3 protocol.
fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let mut salted = format!("{:x}", inner).into_bytes();
    salted.extend_from_slice(&salt);
    format!("md5{:x}", md5::compute(&salted))
}

fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Completion logger for internally submitted LISTEN/UNLISTEN requests.
fn admin_result_logger(query: String) -> ResultFn {
    Box::new(move |results: Results| {
        if results.is_error() {
            warn!("{} failed: {}", query, results.error_string());
        }
    })
}

fn log_notice(fields: &HashMap<u8, String>) {
    let severity = fields.get(&b'S').map(String::as_str).unwrap_or("NOTICE");
    let message = fields.get(&b'M').map(String::as_str).unwrap_or("");
    debug!("server {}: {}", severity, message);
}
