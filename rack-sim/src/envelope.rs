// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The message envelope and the uniform response shape
//!
//! Every message routed through a rack is wrapped in an [`Envelope`]. The
//! envelope carries the target, the guard tick the submitter based its
//! decision on, trace linkage, and an optional completion channel. Whoever
//! finally handles the message writes exactly one [`Response`] to that
//! channel. Messages without a channel (cascaded side effects, timer
//! expiries) are fire-and-forget.

use crate::clock::Tick;
use crate::errors::SimError;
use crate::fsm;
use crate::messages::{MessageTag, Payload, Status};
use crate::target::MessageTarget;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Sending half of a message's completion channel
pub type ResponseTx = oneshot::Sender<Response>;

/// The result of handling one message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Logical time at which the handler completed
    pub at: Tick,
    pub result: Result<Option<Status>, SimError>,
}

impl Response {
    pub fn ok(at: Tick) -> Response {
        Response { at, result: Ok(None) }
    }

    pub fn status(at: Tick, status: Status) -> Response {
        Response { at, result: Ok(Some(status)) }
    }

    pub fn failed(at: Tick, err: SimError) -> Response {
        Response { at, result: Err(err) }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Returns the error carried by this response, if any
    pub fn err(&self) -> Option<&SimError> {
        self.result.as_ref().err()
    }
}

/// Linkage between a message and the message that caused it
///
/// Captured once when an envelope is built. A forwarded or cascaded message
/// gets a new span within the same trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TraceLink {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
}

impl TraceLink {
    /// Start a new trace
    pub fn root() -> TraceLink {
        TraceLink {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
        }
    }

    /// A new span within this trace, caused by this one
    pub fn child(&self) -> TraceLink {
        TraceLink {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(self.span_id),
        }
    }
}

impl slog::KV for TraceLink {
    fn serialize(
        &self,
        _record: &slog::Record<'_>,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(
            "trace_id".into(),
            &format_args!("{}", self.trace_id),
        )?;
        serializer.emit_arguments(
            "span_id".into(),
            &format_args!("{}", self.span_id),
        )?;
        if let Some(parent) = &self.parent_span_id {
            serializer.emit_arguments(
                "parent_span_id".into(),
                &format_args!("{}", parent),
            )?;
        }
        Ok(())
    }
}

/// A message addressed to a simulated element
#[derive(Debug)]
pub struct Envelope {
    pub target: MessageTarget,
    /// The latest logical time whose state the submitter had observed
    pub guard: Tick,
    pub payload: Payload,
    link: TraceLink,
    reply: Option<ResponseTx>,
}

impl Envelope {
    /// Build a message that starts a new trace
    ///
    /// `reply` may be `None` for fire-and-forget submissions.
    pub fn new(
        target: MessageTarget,
        guard: Tick,
        payload: Payload,
        reply: Option<ResponseTx>,
    ) -> Envelope {
        Envelope { target, guard, payload, link: TraceLink::root(), reply }
    }

    /// Build a message within the caller's existing trace
    pub fn with_link(
        parent: &TraceLink,
        target: MessageTarget,
        guard: Tick,
        payload: Payload,
        reply: Option<ResponseTx>,
    ) -> Envelope {
        Envelope { target, guard, payload, link: parent.child(), reply }
    }

    /// Build a message together with the receiving end of its completion
    /// channel
    pub fn request(
        target: MessageTarget,
        guard: Tick,
        payload: Payload,
    ) -> (Envelope, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (Envelope::new(target, guard, payload, Some(tx)), rx)
    }

    /// Build a fire-and-forget message originating inside the simulation
    pub fn internal(
        target: MessageTarget,
        guard: Tick,
        payload: Payload,
    ) -> Envelope {
        Envelope::new(target, guard, payload, None)
    }

    /// Build a fire-and-forget side effect of this message
    pub fn cascade(
        &self,
        target: MessageTarget,
        guard: Tick,
        payload: Payload,
    ) -> Envelope {
        Envelope::with_link(&self.link, target, guard, payload, None)
    }

    pub fn tag(&self) -> MessageTag {
        self.payload.tag()
    }

    pub fn link(&self) -> &TraceLink {
        &self.link
    }

    /// Whether anyone is waiting for a response to this message
    pub fn expects_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Complete this message
    ///
    /// A missing completion channel, or one whose receiver has gone away,
    /// is not an error.
    pub fn respond(self, response: Response) {
        if let Some(tx) = self.reply {
            let _ = tx.send(response);
        }
    }

    /// Complete this message and keep going with it
    ///
    /// The returned envelope has no completion channel and a new span. It is
    /// used to pass an already acknowledged command on to the element that
    /// carries it out.
    pub fn acknowledge(mut self, response: Response) -> Envelope {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(response);
        }
        self.link = self.link.child();
        self
    }

    /// Pass this message on to another element, keeping its completion
    /// channel
    pub fn forward(mut self) -> Envelope {
        self.link = self.link.child();
        self
    }
}

impl fsm::Message for Envelope {
    type Tag = MessageTag;

    fn tag(&self) -> MessageTag {
        self.payload.tag()
    }

    fn guard(&self) -> Tick {
        self.guard
    }

    fn respond(self, response: Response) {
        Envelope::respond(self, response)
    }
}
