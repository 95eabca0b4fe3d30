//! The ordered backlog of submitted requests.
//!
//! Requests live in one owned, indexable collection from submission until
//! their callback has fired or been skipped; completion always removes the
//! record, so "queue empty" is unambiguous. The dispatched prefix counts
//! entries already serialized to the wire and awaiting replies; the head of
//! that prefix is where incoming reply frames accumulate.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::driver::{ReceiverToken, ResultFn};
use crate::error::Error;
use crate::pg::result::{Results, ResultsBuilder};
use crate::pg::types::Value;

/// Inline storage for typical parameter counts.
pub(crate) type Params = SmallVec<[Value; 4]>;

#[derive(Debug)]
pub(crate) enum RequestKind {
    /// Raw query text; dispatched via the simple protocol when parameterless,
    /// otherwise as an unnamed parse/bind/execute.
    Text { query: String },
    /// Named server-side statement; may need a prepare step first.
    Prepared { name: String, query: String },
}

/// One submitted unit of work.
pub(crate) struct QueryRequest {
    pub kind: RequestKind,
    pub params: Params,
    pub cb: Option<ResultFn>,
    pub receiver: ReceiverToken,
    pub single_row: bool,
    /// A prepare step is on the wire; the execute step waits for its ack.
    pub preparing: bool,
    pub builder: ResultsBuilder,
    /// Completed result set held until the simple protocol reveals whether
    /// another statement's set follows it.
    pub pending_set: Option<Results>,
    /// Server error attributed to this request, delivered at its sync point.
    pub failed: Option<Error>,
}

impl QueryRequest {
    pub fn text(query: String, params: Params, cb: Option<ResultFn>, receiver: ReceiverToken) -> Self {
        Self {
            kind: RequestKind::Text { query },
            params,
            cb,
            receiver,
            single_row: false,
            preparing: false,
            builder: ResultsBuilder::default(),
            pending_set: None,
            failed: None,
        }
    }

    pub fn prepared(
        name: String,
        query: String,
        params: Params,
        cb: Option<ResultFn>,
        receiver: ReceiverToken,
    ) -> Self {
        Self {
            kind: RequestKind::Prepared { name, query },
            params,
            cb,
            receiver,
            single_row: false,
            preparing: false,
            builder: ResultsBuilder::default(),
            pending_set: None,
            failed: None,
        }
    }

    pub fn query_text(&self) -> &str {
        match &self.kind {
            RequestKind::Text { query } => query,
            RequestKind::Prepared { query, .. } => query,
        }
    }

    /// Invoke the completion callback, honoring receiver liveness. The
    /// request record itself is removed by the queue regardless.
    pub fn deliver(&mut self, results: Results) {
        if let Some(cb) = self.cb.as_mut() {
            if self.receiver.is_live() {
                cb(results);
            } else {
                log::trace!("dropping reply for dead receiver: {}", self.query_text());
            }
        }
    }
}

impl std::fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRequest")
            .field("kind", &self.kind)
            .field("params", &self.params.len())
            .field("single_row", &self.single_row)
            .field("preparing", &self.preparing)
            .finish()
    }
}

/// Submission-ordered backlog with a dispatched prefix.
#[derive(Debug, Default)]
pub(crate) struct QueryQueue {
    entries: VecDeque<QueryRequest>,
    dispatched: usize,
}

impl QueryQueue {
    pub fn push(&mut self, request: QueryRequest) {
        self.entries.push_back(request);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries on the wire awaiting replies.
    pub fn dispatched(&self) -> usize {
        self.dispatched
    }

    pub fn has_undispatched(&self) -> bool {
        self.dispatched < self.entries.len()
    }

    /// The earliest dispatched entry (where reply frames accumulate).
    pub fn head_mut(&mut self) -> Option<&mut QueryRequest> {
        if self.dispatched == 0 {
            None
        } else {
            self.entries.front_mut()
        }
    }

    /// The earliest entry not yet on the wire.
    pub fn next_undispatched_mut(&mut self) -> Option<&mut QueryRequest> {
        self.entries.get_mut(self.dispatched)
    }

    /// Move the dispatch boundary forward by one entry.
    pub fn mark_dispatched(&mut self) {
        debug_assert!(self.dispatched < self.entries.len());
        self.dispatched += 1;
    }

    /// The most recently submitted entry (for single-row marking).
    pub fn last_mut(&mut self) -> Option<&mut QueryRequest> {
        self.entries.back_mut()
    }

    /// Complete the head: remove it unconditionally.
    pub fn pop_head(&mut self) -> Option<QueryRequest> {
        if self.dispatched == 0 {
            return None;
        }
        self.dispatched -= 1;
        self.entries.pop_front()
    }

    /// Remove every dispatched entry, e.g. on pipeline abort.
    pub fn take_dispatched(&mut self) -> Vec<QueryRequest> {
        let count = self.dispatched;
        self.dispatched = 0;
        self.entries.drain(..count).collect()
    }

    /// Remove everything, dispatched or not, e.g. on connection loss.
    pub fn take_all(&mut self) -> Vec<QueryRequest> {
        self.dispatched = 0;
        self.entries.drain(..).collect()
    }
}
