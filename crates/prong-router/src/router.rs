// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The router: one fork context per forkable incoming request.
//!
//! The router resolves the target address-of-record against the location
//! service, creates a fork context with the variant matching the method,
//! clones and retargets the request per contact, and afterwards dispatches
//! responses, cancels, late registrations and timer expiries to the owning
//! context. Contexts are found through the incoming/outgoing transaction
//! indexes; no ambient global state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use prong_core::{Header, Headers, Method, Request, Response, SipUri};
use prong_fork::{
    generate_branch_id, BasicFork, CallFork, ContextId, ForkConfig, ForkContext, ForkListener,
    ForkScheduler, ForkState, ForkVariant, IncomingTransaction, MessageFork, TimerEvent,
    TimerKind, TransactionKey, TransactionLayer,
};
use prong_registrar::{normalize_aor, ContactBinding, LocationService, RegistrationEvent};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::RouterEvent;

/// Stateful fork router.
pub struct Router {
    cfg: Arc<ForkConfig>,
    scheduler: Arc<ForkScheduler>,
    location: Arc<dyn LocationService>,
    transactions: Arc<dyn TransactionLayer>,
    listener: Arc<dyn ForkListener>,
    via_host: SmolStr,
    contexts: HashMap<ContextId, ForkContext>,
    by_incoming: HashMap<TransactionKey, ContextId>,
    by_outgoing: HashMap<TransactionKey, ContextId>,
    by_call_id: HashMap<SmolStr, Vec<ContextId>>,
    by_aor: HashMap<SmolStr, Vec<ContextId>>,
    next_id: u64,
}

impl Router {
    pub fn new(
        cfg: ForkConfig,
        via_host: impl Into<SmolStr>,
        location: Arc<dyn LocationService>,
        transactions: Arc<dyn TransactionLayer>,
        listener: Arc<dyn ForkListener>,
    ) -> Self {
        Self {
            cfg: Arc::new(cfg),
            scheduler: Arc::new(ForkScheduler::new()),
            location,
            transactions,
            listener,
            via_host: via_host.into(),
            contexts: HashMap::new(),
            by_incoming: HashMap::new(),
            by_outgoing: HashMap::new(),
            by_call_id: HashMap::new(),
            by_aor: HashMap::new(),
            next_id: 0,
        }
    }

    /// Finds the context replying on the given incoming transaction.
    pub fn find_context_by_incoming(&self, key: &TransactionKey) -> Option<&ForkContext> {
        self.by_incoming
            .get(key)
            .and_then(|id| self.contexts.get(id))
    }

    /// Finds the context owning the given outgoing transaction.
    pub fn find_context_by_outgoing(&self, key: &TransactionKey) -> Option<&ForkContext> {
        self.by_outgoing
            .get(key)
            .and_then(|id| self.contexts.get(id))
    }

    /// Finds every live context created for the given Call-ID.
    pub fn find_contexts_by_call_id(&self, call_id: &str) -> Vec<&ForkContext> {
        self.by_call_id
            .get(call_id)
            .map(|ids| ids.iter().filter_map(|id| self.contexts.get(id)).collect())
            .unwrap_or_default()
    }

    /// The timer wheel shared with every context; the driver polls it.
    pub fn scheduler(&self) -> Arc<ForkScheduler> {
        Arc::clone(&self.scheduler)
    }

    /// Number of live fork contexts.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    /// Dispatches one event on the serialized loop.
    pub fn dispatch(&mut self, event: RouterEvent) {
        match event {
            RouterEvent::Request { request, incoming } => {
                self.handle_request(request, incoming);
            }
            RouterEvent::Response { key, response } => self.handle_response(&key, response),
            RouterEvent::Cancel { key } => self.handle_cancel(&key),
            RouterEvent::Registration(event) => self.handle_registration(event),
            RouterEvent::PushSent { key, uid } => self.handle_push_sent(&key, &uid),
        }
    }

    /// Creates a fork context for an incoming request and branches it to
    /// every registered contact of the target address-of-record.
    pub fn handle_request(
        &mut self,
        request: Request,
        incoming: Arc<dyn IncomingTransaction>,
    ) -> Option<ContextId> {
        let Some(variant) = variant_for(&request.start.method) else {
            debug!(method = %request.start.method, "method is not forkable, ignoring");
            return None;
        };

        let aor = normalize_aor(&request.start.uri);
        let id = ContextId(self.next_id);
        self.next_id += 1;

        info!(ctx = %id, %aor, method = %request.start.method, "routing request");
        let mut ctx = ForkContext::new(
            id,
            request,
            incoming,
            Arc::clone(&self.cfg),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.listener),
            variant,
        );
        self.by_incoming.insert(ctx.incoming_key().clone(), id);
        self.by_aor.entry(aor.clone()).or_default().push(id);
        if let Some(call_id) = ctx.core().request().call_id() {
            self.by_call_id.entry(call_id.clone()).or_default().push(id);
        }

        let contacts = self.location.lookup(&aor);
        for contact in contacts {
            self.branch_to(&mut ctx, &contact);
        }

        if ctx.core().branches().is_empty() && !self.cfg.fork_late {
            debug!(ctx = %id, %aor, "no registered contact, rejecting");
            ctx.reject(480);
        }

        self.contexts.insert(id, ctx);
        Some(id)
    }

    /// Routes a response from an outgoing transaction to its fork context.
    pub fn handle_response(&mut self, key: &TransactionKey, response: Response) {
        let Some(id) = self.by_outgoing.get(key).copied() else {
            debug!(branch = %key.branch, "response does not match any fork");
            return;
        };
        if let Some(ctx) = self.contexts.get_mut(&id) {
            ctx.on_response(key, response);
        }
    }

    /// Routes a CANCEL from the caller to the fork owning the incoming
    /// transaction.
    pub fn handle_cancel(&mut self, key: &TransactionKey) {
        let Some(id) = self.by_incoming.get(key).copied() else {
            debug!(branch = %key.branch, "cancel does not match any fork");
            return;
        };
        if let Some(ctx) = self.contexts.get_mut(&id) {
            ctx.cancel();
        }
    }

    /// Offers a newly-registered contact to every fork targeting its
    /// address-of-record.
    pub fn handle_registration(&mut self, event: RegistrationEvent) {
        let Some(ids) = self.by_aor.get(&event.aor) else {
            return;
        };
        let ids: Vec<ContextId> = ids.clone();
        for id in ids {
            let Some(mut ctx) = self.contexts.remove(&id) else {
                continue;
            };
            if ctx.on_new_register(&event.binding.uri, &event.binding.uid) {
                debug!(ctx = %id, uid = %event.binding.uid, "late fork to new contact");
                self.branch_to(&mut ctx, &event.binding);
            }
            self.contexts.insert(id, ctx);
        }
    }

    /// Arms the push-response deadline for a branch of the fork owning the
    /// incoming transaction `key`.
    pub fn handle_push_sent(&mut self, key: &TransactionKey, uid: &str) {
        if let Some(id) = self.by_incoming.get(key).copied() {
            if let Some(ctx) = self.contexts.get_mut(&id) {
                ctx.on_push_sent(uid);
            }
        }
    }

    /// Feeds a timer expiry to its context; a finish tick additionally runs
    /// the destruction path and drops every index entry.
    pub fn handle_timer(&mut self, event: TimerEvent) {
        let Some(ctx) = self.contexts.get_mut(&event.context) else {
            return;
        };
        if event.kind != TimerKind::Finish {
            ctx.on_timer(event.kind);
            return;
        }

        let incoming_key = ctx.incoming_key().clone();
        let outgoing_keys = ctx.outgoing_keys();
        ctx.on_timer(TimerKind::Finish);
        if ctx.state() != ForkState::Finished {
            return;
        }

        let aor = normalize_aor(&ctx.core().request().start.uri);
        let call_id = ctx.core().request().call_id().cloned();
        self.contexts.remove(&event.context);
        self.by_incoming.remove(&incoming_key);
        for key in outgoing_keys {
            self.by_outgoing.remove(&key);
        }
        if let Some(ids) = self.by_aor.get_mut(&aor) {
            ids.retain(|id| *id != event.context);
            if ids.is_empty() {
                self.by_aor.remove(&aor);
            }
        }
        if let Some(call_id) = call_id {
            if let Some(ids) = self.by_call_id.get_mut(&call_id) {
                ids.retain(|id| *id != event.context);
                if ids.is_empty() {
                    self.by_call_id.remove(&call_id);
                }
            }
        }
        debug!(ctx = %event.context, "fork context released");
    }

    /// Fires every timer due at `now`.
    pub fn fire_due_timers(&mut self, now: Instant) {
        for event in self.scheduler.pop_due(now) {
            self.handle_timer(event);
        }
    }

    /// Serialized event loop: processes router events and timer expiries
    /// until the event channel closes.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<RouterEvent>) {
        loop {
            let deadline = self.scheduler.next_deadline();
            let timer = async {
                match deadline {
                    Some(at) => {
                        tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await
                    }
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
                _ = timer => self.fire_due_timers(Instant::now()),
            }
        }
    }

    fn branch_to(&mut self, ctx: &mut ForkContext, contact: &ContactBinding) {
        let request = prepare_branch_request(
            ctx.core().request(),
            &contact.uri,
            &self.via_host,
        );
        match ctx.add_branch(request, &contact.uid, self.transactions.as_ref()) {
            Ok(added) => {
                if let Some(old) = added.superseded {
                    self.by_outgoing.remove(&old);
                }
                self.by_outgoing.insert(added.key, ctx.id());
            }
            Err(err) => {
                warn!(ctx = %ctx.id(), uid = %contact.uid, %err, "could not branch to contact");
            }
        }
    }
}

/// Picks the fork policy for a request method; `None` for methods the fork
/// engine never owns.
fn variant_for(method: &Method) -> Option<Box<dyn ForkVariant>> {
    match method {
        Method::Invite => Some(Box::new(CallFork::new())),
        Method::Message => Some(Box::new(MessageFork::new())),
        Method::Ack | Method::Cancel | Method::Bye | Method::Register => None,
        _ => Some(Box::new(BasicFork::new())),
    }
}

/// Clones the original request toward one contact: Request-URI retargeted,
/// Max-Forwards decremented, a fresh Via branch on top.
fn prepare_branch_request(original: &Request, contact: &SipUri, via_host: &str) -> Request {
    let mut request = original.clone();
    request.start.uri = contact.clone();

    if let Some(value) = request.headers.get("Max-Forwards") {
        if let Ok(hops) = value.parse::<u32>() {
            request
                .headers
                .set_or_push("Max-Forwards", hops.saturating_sub(1).to_string());
        }
    }

    let branch = generate_branch_id();
    let via = format!("SIP/2.0/UDP {};branch={}", via_host, branch);
    let mut headers = vec![Header {
        name: SmolStr::new("Via"),
        value: SmolStr::new(via),
    }];
    headers.extend(request.headers.into_inner());
    request.headers = Headers::from_vec(headers);
    request
}
