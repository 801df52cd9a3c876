// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test builders and mocks for exercising the fork engine.
//!
//! Provides minimal request/response construction plus a recording
//! transaction layer so scenario tests can observe exactly what the proxy
//! sent on each branch and what it replied upstream.
//!
//! # Example
//! ```
//! use prong_testkit::build_invite;
//! let invite = build_invite("sip:bob@example.com", "z9hG4bKtest", "call-1");
//! assert_eq!(invite.start.method.as_str(), "INVITE");
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use prong_core::{Headers, Method, Request, RequestLine, Response, SipUri};
use prong_fork::{
    ContextId, ForkContext, ForkListener, IncomingTransaction, OutgoingTransaction,
    TransactionKey, TransactionLayer, TransportError,
};
use tokio::sync::mpsc;

fn base_headers(method: &Method, branch: &str, call_id: &str) -> Headers {
    let mut headers = Headers::new();
    headers.push(
        "Via",
        format!("SIP/2.0/UDP client.example.com:5060;branch={}", branch),
    );
    headers.push("From", "<sip:alice@example.com>;tag=1234");
    headers.push("To", "<sip:bob@example.com>");
    headers.push("Call-ID", call_id);
    headers.push("CSeq", format!("1 {}", method.as_str()));
    headers.push("Max-Forwards", "70");
    headers.push("Contact", "<sip:alice@client.example.com:5060>");
    headers.push("Content-Length", "0");
    headers
}

/// Constructs a minimal INVITE request for the provided URI string.
pub fn build_invite(uri: &str, branch: &str, call_id: &str) -> Request {
    Request::new(
        RequestLine::new(Method::Invite, SipUri::parse(uri).unwrap()),
        base_headers(&Method::Invite, branch, call_id),
        Bytes::new(),
    )
}

/// Constructs a minimal MESSAGE request with a small text body.
pub fn build_message(uri: &str, branch: &str, call_id: &str) -> Request {
    let mut headers = base_headers(&Method::Message, branch, call_id);
    headers.set_or_push("Content-Type", "text/plain");
    Request::new(
        RequestLine::new(Method::Message, SipUri::parse(uri).unwrap()),
        headers,
        Bytes::from_static(b"hello"),
    )
}

/// Constructs a response to `request` with the canonical reason phrase.
pub fn build_response(request: &Request, code: u16) -> Response {
    Response::for_request(request, code).unwrap()
}

/// Server-transaction mock: records every upstream reply.
pub struct MockIncoming {
    key: TransactionKey,
    replies: Mutex<Vec<Response>>,
}

impl MockIncoming {
    /// Builds a mock keyed on the request's top Via branch.
    pub fn for_request(request: &Request) -> Arc<Self> {
        let key = TransactionKey::from_request(request, true)
            .expect("request must carry a Via branch");
        Arc::new(Self {
            key,
            replies: Mutex::new(Vec::new()),
        })
    }

    /// Every response replied so far.
    pub fn replies(&self) -> Vec<Response> {
        self.replies.lock().clone()
    }

    /// Status codes replied so far, in order.
    pub fn codes(&self) -> Vec<u16> {
        self.replies.lock().iter().map(Response::code).collect()
    }
}

impl IncomingTransaction for MockIncoming {
    fn key(&self) -> &TransactionKey {
        &self.key
    }

    fn reply(&self, response: &Response) -> Result<(), TransportError> {
        self.replies.lock().push(response.clone());
        Ok(())
    }
}

/// Client-transaction mock: records sends and CANCELs.
pub struct MockOutgoing {
    key: TransactionKey,
    fail_send: bool,
    sent: Mutex<Vec<Request>>,
    cancelled: AtomicUsize,
}

impl MockOutgoing {
    /// Requests handed to the transport on this transaction.
    pub fn sent(&self) -> Vec<Request> {
        self.sent.lock().clone()
    }

    /// How many times CANCEL was issued.
    pub fn cancel_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl OutgoingTransaction for MockOutgoing {
    fn key(&self) -> &TransactionKey {
        &self.key
    }

    fn send(&self, request: &Request) -> Result<(), TransportError> {
        if self.fail_send {
            return Err(TransportError::Send("peer unreachable".into()));
        }
        self.sent.lock().push(request.clone());
        Ok(())
    }

    fn cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

/// Recording transaction layer: every created client transaction is kept for
/// later inspection.
#[derive(Default)]
pub struct MockStack {
    fail_sends: AtomicBool,
    created: Mutex<Vec<Arc<MockOutgoing>>>,
}

impl MockStack {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every subsequently created transaction fail its send.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// All client transactions created so far, in creation order.
    pub fn created(&self) -> Vec<Arc<MockOutgoing>> {
        self.created.lock().clone()
    }

    /// Finds the transaction sent toward the given host.
    pub fn outgoing_to(&self, host: &str) -> Option<Arc<MockOutgoing>> {
        self.created
            .lock()
            .iter()
            .find(|tx| {
                tx.sent
                    .lock()
                    .first()
                    .map(|req| req.start.uri.host() == host)
                    .unwrap_or(false)
            })
            .cloned()
    }
}

impl TransactionLayer for MockStack {
    fn create_outgoing(
        &self,
        request: &Request,
    ) -> Result<Arc<dyn OutgoingTransaction>, TransportError> {
        let key = TransactionKey::from_request(request, false).unwrap_or_else(|| {
            TransactionKey::client(prong_fork::generate_branch_id(), request.start.method.clone())
        });
        let tx = Arc::new(MockOutgoing {
            key,
            fail_send: self.fail_sends.load(Ordering::SeqCst),
            sent: Mutex::new(Vec::new()),
            cancelled: AtomicUsize::new(0),
        });
        self.created.lock().push(Arc::clone(&tx));
        Ok(tx)
    }
}

/// Listener that records finished contexts and optionally signals a channel,
/// so async driver tests can await completion.
#[derive(Default)]
pub struct RecordingListener {
    finished: Mutex<Vec<ContextId>>,
    notify: Mutex<Option<mpsc::UnboundedSender<ContextId>>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a receiver signalled once per finished context.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ContextId> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.notify.lock() = Some(tx);
        rx
    }

    pub fn finished(&self) -> Vec<ContextId> {
        self.finished.lock().clone()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.lock().len()
    }
}

impl ForkListener for RecordingListener {
    fn on_fork_finished(&self, ctx: &ForkContext) {
        self.finished.lock().push(ctx.id());
        if let Some(notify) = &*self.notify.lock() {
            let _ = notify.send(ctx.id());
        }
    }
}
