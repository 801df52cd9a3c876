// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The fork state machine.
//!
//! [`ForkCore`] owns the branches, the upstream reply path and the fork
//! timers; [`ForkVariant`] supplies the per-method policy hooks (call,
//! message, basic); [`ForkContext`] pairs the two and dispatches every event
//! a router can deliver. All methods run on the single serialized event
//! loop; nothing here blocks or locks around dispatch.

use std::sync::Arc;

use prong_core::{remove_to_tag, Request, Response, SipUri};
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::{
    branch::BranchInfo,
    config::ForkConfig,
    error::ForkError,
    timer::{ForkScheduler, TimerHandle, TimerKind},
    transaction::{IncomingTransaction, TransactionKey, TransactionLayer},
};

/// Identifier of a fork context within its router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fork-{}", self.0)
    }
}

/// Lifecycle of a fork context.
///
/// `Active` accepts every event; `set_finished` moves to `Finishing` and arms
/// the zero-delay finish timer; the finish tick runs `on_finished` exactly
/// once and lands in `Finished`, after which the router drops the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkState {
    Active,
    Finishing,
    Finished,
}

/// Upcall fired exactly once per context, after `on_finished` ran.
pub trait ForkListener: Send + Sync {
    fn on_fork_finished(&self, ctx: &ForkContext);
}

/// Response codes worth forwarding upstream before every branch answered.
pub const URGENT_CODES: &[u16] = &[401, 407, 415, 420, 423, 480, 486, 487, 489, 493];

/// Urgency policy used during best-branch selection.
#[derive(Debug, Clone, Copy)]
pub struct Urgency {
    codes: &'static [u16],
    all: bool,
    decline: bool,
}

impl Urgency {
    /// The standard urgent set, with 603 folded in when the config says so.
    pub fn standard(cfg: &ForkConfig) -> Self {
        Self {
            codes: URGENT_CODES,
            all: false,
            decline: cfg.fork_no_global_decline && cfg.treat_decline_as_urgent,
        }
    }

    /// Every final response is urgent.
    pub fn all() -> Self {
        Self {
            codes: &[],
            all: true,
            decline: false,
        }
    }

    /// Nothing is urgent.
    pub fn none() -> Self {
        Self {
            codes: &[],
            all: false,
            decline: false,
        }
    }

    /// Returns `true` when `code` should be treated as urgent.
    pub fn contains(&self, code: u16) -> bool {
        if code < 200 {
            return false;
        }
        self.all || self.codes.contains(&code) || (self.decline && code == 603)
    }
}

/// Result of a successful `add_branch`, so the router can maintain its
/// outgoing-transaction index.
#[derive(Debug, Clone)]
pub struct AddedBranch {
    pub key: TransactionKey,
    /// Outgoing key of an older same-uid branch that was cancelled and
    /// removed in favor of the new one.
    pub superseded: Option<TransactionKey>,
}

/// Base state shared by every fork variant: branches, upstream reply path,
/// timers, completion latches.
pub struct ForkCore {
    id: ContextId,
    request: Request,
    incoming: Arc<dyn IncomingTransaction>,
    cfg: Arc<ForkConfig>,
    scheduler: Arc<ForkScheduler>,
    branches: Vec<BranchInfo>,
    last_response_sent: Option<Response>,
    forwarded_provisional: bool,
    forwarded_final: bool,
    state: ForkState,
    cancelled: bool,
    late_timer: Option<TimerHandle>,
    late_timer_expired: bool,
    urgent_timer: Option<TimerHandle>,
    push_timers: Vec<(SmolStr, TimerHandle)>,
    finish_timer: Option<TimerHandle>,
    finish_check: bool,
}

impl ForkCore {
    fn new(
        id: ContextId,
        request: Request,
        incoming: Arc<dyn IncomingTransaction>,
        cfg: Arc<ForkConfig>,
        scheduler: Arc<ForkScheduler>,
    ) -> Self {
        let late_timer = cfg
            .fork_late
            .then(|| scheduler.schedule(cfg.delivery_window(), id, TimerKind::Late));
        Self {
            id,
            request,
            incoming,
            cfg,
            scheduler,
            branches: Vec::new(),
            last_response_sent: None,
            forwarded_provisional: false,
            forwarded_final: false,
            state: ForkState::Active,
            cancelled: false,
            late_timer,
            late_timer_expired: false,
            urgent_timer: None,
            push_timers: Vec::new(),
            finish_timer: None,
            finish_check: false,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn state(&self) -> ForkState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ForkState::Active
    }

    pub fn config(&self) -> &ForkConfig {
        &self.cfg
    }

    /// The original request that triggered the fork.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn branches(&self) -> &[BranchInfo] {
        &self.branches
    }

    /// The most recent response already forwarded upstream.
    pub fn last_response_sent(&self) -> Option<&Response> {
        self.last_response_sent.as_ref()
    }

    /// Status of the last forwarded response, or 0.
    pub fn last_status(&self) -> u16 {
        self.last_response_sent
            .as_ref()
            .map(Response::code)
            .unwrap_or(0)
    }

    /// A final (>= 200) response was already forwarded upstream.
    pub fn forwarded_final(&self) -> bool {
        self.forwarded_final
    }

    /// The caller cancelled this fork.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// The late-forking window has closed.
    pub fn late_timer_expired(&self) -> bool {
        self.late_timer_expired
    }

    pub fn find_branch_by_uid(&self, uid: &str) -> Option<usize> {
        self.branches.iter().position(|b| b.uid == uid)
    }

    pub fn find_branch_by_dest(&self, dest: &SipUri) -> Option<usize> {
        self.branches
            .iter()
            .position(|b| b.destination().same_destination(dest))
    }

    pub(crate) fn find_branch_by_tx(&self, key: &TransactionKey) -> Option<usize> {
        self.branches.iter().position(|b| b.transaction.key() == key)
    }

    /// Every branch saw a final response. Vacuously true with no branches.
    pub fn all_branches_answered(&self) -> bool {
        self.branches.iter().all(BranchInfo::is_answered)
    }

    /// Selects the branch whose response best represents the fork outcome.
    ///
    /// Order of preference: first 2xx; else lowest 6xx when a global decline
    /// terminates the fork; else the first urgent response in insertion
    /// order; else the numerically-highest remaining final, first insertion
    /// winning ties. Branches without a final response never win.
    pub fn find_best_branch(&self, urgency: &Urgency) -> Option<usize> {
        let answered = || {
            self.branches
                .iter()
                .enumerate()
                .filter(|(_, b)| b.is_answered())
        };

        if let Some((i, _)) = answered().find(|(_, b)| (200..300).contains(&b.status())) {
            return Some(i);
        }

        if !self.cfg.fork_no_global_decline {
            let mut best: Option<(usize, u16)> = None;
            for (i, b) in answered().filter(|(_, b)| b.status() >= 600) {
                let code = b.status();
                if best.map_or(true, |(_, c)| code < c) {
                    best = Some((i, code));
                }
            }
            if let Some((i, _)) = best {
                return Some(i);
            }
        }

        if let Some((i, _)) = answered().find(|(_, b)| urgency.contains(b.status())) {
            return Some(i);
        }

        let mut best: Option<(usize, u16)> = None;
        for (i, b) in answered() {
            let code = b.status();
            if best.map_or(true, |(_, c)| code > c) {
                best = Some((i, code));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Forwards the last response of the given branch upstream.
    pub fn forward_response_from(&mut self, index: usize) -> Option<u16> {
        let Some(response) = self.branches.get(index).and_then(|b| b.last_response.clone())
        else {
            warn!(ctx = %self.id, index, "no response received on this branch");
            return None;
        };
        self.forward_response(response)
    }

    /// Forwards a response upstream, honoring `remove-to-tag` and
    /// `fork-one-response`, and records it as the last response sent.
    ///
    /// The upstream transaction answers exactly once: after the first final
    /// (>= 200) went out, every later forward is a no-op, as if the incoming
    /// transaction had been released.
    pub fn forward_response(&mut self, mut response: Response) -> Option<u16> {
        if self.state != ForkState::Active {
            debug!(ctx = %self.id, "response dropped: context is terminating");
            return None;
        }
        let code = response.code();
        let is_final = code >= 200;
        if is_final && self.forwarded_final {
            debug!(ctx = %self.id, code, "final already forwarded, dropping");
            return None;
        }
        if self.cfg.fork_one_response && !is_final && self.forwarded_provisional {
            debug!(ctx = %self.id, code, "provisional already forwarded, dropping");
            return None;
        }
        if self.cfg.remove_to_tag {
            remove_to_tag(&mut response);
        }
        if let Err(err) = self.incoming.reply(&response) {
            warn!(ctx = %self.id, code, %err, "upstream reply failed");
        }
        debug!(ctx = %self.id, code, "response forwarded upstream");
        self.last_response_sent = Some(response);
        if is_final {
            self.forwarded_final = true;
            self.finish_check = true;
        } else {
            self.forwarded_provisional = true;
        }
        Some(code)
    }

    /// Forwards the best available response, if any branch has answered.
    pub fn forward_best(&mut self, urgency: &Urgency) -> Option<u16> {
        let best = self.find_best_branch(urgency)?;
        self.forward_response_from(best)
    }

    /// Synthesizes and forwards a final response to the original request.
    pub fn forward_synthesized(&mut self, code: u16) -> Option<u16> {
        match Response::for_request(&self.request, code) {
            Ok(response) => self.forward_response(response),
            Err(err) => {
                warn!(ctx = %self.id, code, %err, "could not synthesize response");
                None
            }
        }
    }

    /// Sends a CANCEL on every branch still awaiting a final response,
    /// except `keep`.
    pub fn cancel_pending_branches_except(&mut self, keep: Option<usize>) {
        for (i, branch) in self.branches.iter_mut().enumerate() {
            if Some(i) == keep || branch.is_answered() || branch.cancelled {
                continue;
            }
            debug!(ctx = %self.id, uid = %branch.uid, "cancelling branch");
            branch.transaction.cancel();
            branch.cancelled = true;
        }
    }

    /// Marks the fork cancelled by the caller and tears down pending
    /// branches. Idempotent.
    pub(crate) fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.cancel_pending_branches_except(None);
    }

    /// Arms the urgent buffering timer unless it is already running.
    pub fn arm_urgent_timer(&mut self) {
        if self.urgent_timer.is_none() {
            let handle = self
                .scheduler
                .schedule(self.cfg.urgent_window(), self.id, TimerKind::Urgent);
            self.urgent_timer = Some(handle);
        }
    }

    pub(crate) fn clear_urgent_timer(&mut self) {
        if let Some(handle) = self.urgent_timer.take() {
            self.scheduler.cancel(&handle);
        }
    }

    pub(crate) fn arm_push_timer(&mut self, uid: &SmolStr) {
        if self.push_timers.iter().any(|(u, _)| u == uid) {
            return;
        }
        let handle = self.scheduler.schedule(
            self.cfg.push_window(),
            self.id,
            TimerKind::PushWait { uid: uid.clone() },
        );
        self.push_timers.push((uid.clone(), handle));
    }

    pub(crate) fn clear_push_timer(&mut self, uid: &str) {
        if let Some(pos) = self.push_timers.iter().position(|(u, _)| u == uid) {
            let (_, handle) = self.push_timers.swap_remove(pos);
            self.scheduler.cancel(&handle);
        }
    }

    /// Asks the owning context to re-evaluate `should_finish` after the
    /// current hook returns.
    pub fn request_finish_check(&mut self) {
        self.finish_check = true;
    }

    fn take_finish_check(&mut self) -> bool {
        std::mem::take(&mut self.finish_check)
    }

    /// Marks the fork terminated. The real destruction happens on the next
    /// loop iteration, when the finish timer fires. Idempotent.
    pub fn set_finished(&mut self) {
        if self.state != ForkState::Active {
            return;
        }
        self.state = ForkState::Finishing;
        if let Some(handle) = self.late_timer.take() {
            self.scheduler.cancel(&handle);
        }
        self.clear_urgent_timer();
        for (_, handle) in self.push_timers.drain(..) {
            self.scheduler.cancel(&handle);
        }
        debug!(ctx = %self.id, "fork finishing");
        let handle = self
            .scheduler
            .schedule(std::time::Duration::ZERO, self.id, TimerKind::Finish);
        self.finish_timer = Some(handle);
    }

    /// Default acceptance policy for a newly-registered destination.
    pub fn default_accept_new_register(&self, dest: &SipUri, uid: &str) -> bool {
        self.cfg.fork_late
            && !self.late_timer_expired
            && self.find_branch_by_uid(uid).is_none()
            && self.find_branch_by_dest(dest).is_none()
    }
}

/// Per-variant policy hooks. The state machine is identical across variants;
/// only these differ.
pub trait ForkVariant: Send {
    /// Human-readable variant name, for logs.
    fn name(&self) -> &'static str;

    /// Notifies the creation of a new branch.
    fn on_new_branch(&mut self, _core: &mut ForkCore, _index: usize) {}

    /// Response-handling policy. `core.branches()[index].last_response` is
    /// already updated when this runs.
    fn on_response(&mut self, core: &mut ForkCore, index: usize, response: &Response);

    /// Whether this context wants a new branch for a newly-registered
    /// destination.
    fn on_new_register(&self, core: &ForkCore, dest: &SipUri, uid: &str) -> bool {
        core.default_accept_new_register(dest, uid)
    }

    /// Whether the fork should terminate now. Consulted after a final
    /// response was forwarded and after a cancel.
    fn should_finish(&self, core: &ForkCore) -> bool {
        core.all_branches_answered()
    }

    /// Final forwarding choice when the late-forking window closes. The
    /// context finishes right after this returns.
    fn on_late_timeout(&mut self, core: &mut ForkCore) {
        if core.forwarded_final() || core.is_cancelled() {
            return;
        }
        let urgency = self.urgency(core.config());
        if core.forward_best(&urgency).is_none() {
            core.forward_synthesized(408);
        }
    }

    /// The urgent buffering timer expired.
    fn on_urgent_timeout(&mut self, _core: &mut ForkCore) {}

    /// The caller cancelled the fork; pending branches are already being
    /// torn down when this runs.
    fn on_cancel(&mut self, _core: &mut ForkCore) {}

    /// Urgency policy for best-branch selection.
    fn urgency(&self, cfg: &ForkConfig) -> Urgency {
        Urgency::standard(cfg)
    }
}

/// A fork in flight: the shared state machine plus the variant policy.
pub struct ForkContext {
    core: ForkCore,
    variant: Box<dyn ForkVariant>,
    listener: Arc<dyn ForkListener>,
}

impl ForkContext {
    /// Creates a context for `request`. Arms the late timer when
    /// `fork-late` is enabled.
    pub fn new(
        id: ContextId,
        request: Request,
        incoming: Arc<dyn IncomingTransaction>,
        cfg: Arc<ForkConfig>,
        scheduler: Arc<ForkScheduler>,
        listener: Arc<dyn ForkListener>,
        variant: Box<dyn ForkVariant>,
    ) -> Self {
        let core = ForkCore::new(id, request, incoming, cfg, scheduler);
        debug!(ctx = %core.id(), variant = variant.name(), "fork context created");
        Self {
            core,
            variant,
            listener,
        }
    }

    pub fn id(&self) -> ContextId {
        self.core.id()
    }

    pub fn state(&self) -> ForkState {
        self.core.state()
    }

    pub fn core(&self) -> &ForkCore {
        &self.core
    }

    pub fn variant_name(&self) -> &'static str {
        self.variant.name()
    }

    /// Key of the upstream (incoming) transaction.
    pub fn incoming_key(&self) -> &TransactionKey {
        self.core.incoming.key()
    }

    /// Keys of every live outgoing transaction.
    pub fn outgoing_keys(&self) -> Vec<TransactionKey> {
        self.core
            .branches
            .iter()
            .map(|b| b.transaction.key().clone())
            .collect()
    }

    /// Creates a branch toward a new destination.
    ///
    /// Allocates the outgoing transaction, appends the branch, runs the
    /// variant's `on_new_branch` hook and hands the request to the
    /// transport. An existing branch with the same uid is cancelled and
    /// removed first. A transport failure on send is converted into a
    /// synthesized 503 fed back through the response path.
    pub fn add_branch(
        &mut self,
        request: Request,
        uid: &str,
        layer: &dyn TransactionLayer,
    ) -> Result<AddedBranch, ForkError> {
        if !self.core.is_active() {
            return Err(ForkError::ContextFinished);
        }

        let superseded = self.core.find_branch_by_uid(uid).map(|i| {
            let old = self.core.branches.remove(i);
            debug!(ctx = %self.core.id, uid, "superseding branch after re-registration");
            if !old.is_answered() {
                old.transaction.cancel();
            }
            old.transaction.key().clone()
        });

        let transaction = layer.create_outgoing(&request)?;
        let key = transaction.key().clone();
        let branch = BranchInfo::new(uid, request, transaction);
        debug!(ctx = %self.core.id, uid, dest = %branch.destination(), "new fork branch");
        self.core.branches.push(branch);
        let index = self.core.branches.len() - 1;
        self.variant.on_new_branch(&mut self.core, index);

        let transaction = Arc::clone(&self.core.branches[index].transaction);
        if let Err(err) = transaction.send(&self.core.branches[index].request) {
            warn!(ctx = %self.core.id, uid, %err, "branch send failed, synthesizing 503");
            if let Ok(response) = Response::for_request(&self.core.branches[index].request, 503) {
                self.dispatch_response(index, response);
            }
        }

        Ok(AddedBranch { key, superseded })
    }

    /// A registration for `uid` at `dest` just arrived; returns `true` when
    /// this context wants a new branch for it.
    pub fn on_new_register(&self, dest: &SipUri, uid: &str) -> bool {
        self.core.is_active() && self.variant.on_new_register(&self.core, dest, uid)
    }

    /// Delivers a response arriving on the outgoing transaction `key`.
    ///
    /// A retransmission (same status as the one already recorded) only
    /// refreshes the stored response; the variant hook is not re-run, so
    /// nothing is forwarded twice.
    pub fn on_response(&mut self, key: &TransactionKey, response: Response) {
        if !self.core.is_active() {
            debug!(ctx = %self.core.id, code = response.code(), "response on finished context ignored");
            return;
        }
        let Some(index) = self.core.find_branch_by_tx(key) else {
            debug!(ctx = %self.core.id, "response does not match any branch");
            return;
        };
        if self.core.branches[index].status() == response.code() {
            self.core.branches[index].last_response = Some(response);
            return;
        }
        self.dispatch_response(index, response);
    }

    fn dispatch_response(&mut self, index: usize, response: Response) {
        let uid = self.core.branches[index].uid.clone();
        self.core.branches[index].last_response = Some(response.clone());
        if response.is_final() {
            self.core.clear_push_timer(&uid);
        }
        self.variant.on_response(&mut self.core, index, &response);
        self.finish_check();
    }

    /// The caller cancelled the original request: CANCEL every branch still
    /// awaiting a final response. Idempotent; does not by itself finish the
    /// context unless the variant says so.
    pub fn cancel(&mut self) {
        if !self.core.is_active() {
            return;
        }
        debug!(ctx = %self.core.id, "fork cancelled by caller");
        self.core.cancel();
        self.variant.on_cancel(&mut self.core);
        if self.variant.should_finish(&self.core) {
            self.core.set_finished();
        }
    }

    /// A push notification was triggered for the device `uid`: arm the
    /// push-response deadline for its branch.
    pub fn on_push_sent(&mut self, uid: &str) {
        if !self.core.is_active() {
            return;
        }
        if let Some(index) = self.core.find_branch_by_uid(uid) {
            if self.core.branches[index].status() == 0 {
                let uid = self.core.branches[index].uid.clone();
                self.core.arm_push_timer(&uid);
            }
        }
    }

    /// Handles a timer expiry for this context.
    pub fn on_timer(&mut self, kind: TimerKind) {
        if kind == TimerKind::Finish {
            self.on_finished();
            return;
        }
        if !self.core.is_active() {
            return;
        }
        match kind {
            TimerKind::Late => {
                debug!(ctx = %self.core.id, "late-forking window closed");
                self.core.late_timer = None;
                self.core.late_timer_expired = true;
                self.variant.on_late_timeout(&mut self.core);
                self.core.set_finished();
            }
            TimerKind::Urgent => {
                self.core.urgent_timer = None;
                self.variant.on_urgent_timeout(&mut self.core);
                self.finish_check();
            }
            TimerKind::PushWait { uid } => {
                self.core.clear_push_timer(&uid);
                if let Some(index) = self.core.find_branch_by_uid(&uid) {
                    if self.core.branches[index].status() == 0 {
                        debug!(ctx = %self.core.id, %uid, "no response after push, synthesizing 408");
                        if let Ok(response) =
                            Response::for_request(&self.core.branches[index].request, 408)
                        {
                            self.dispatch_response(index, response);
                        }
                    }
                }
            }
            TimerKind::Finish => {}
        }
    }

    /// Runs the destruction tick: drops branches and their transactions and
    /// fires the listener. Guaranteed to run at most once.
    pub fn on_finished(&mut self) {
        if self.core.state != ForkState::Finishing {
            return;
        }
        self.core.state = ForkState::Finished;
        self.core.finish_timer = None;
        self.core.branches.clear();
        debug!(ctx = %self.core.id, "fork context finished");
        let listener = Arc::clone(&self.listener);
        listener.on_fork_finished(self);
    }

    /// Rejects the original request with a synthesized final response and
    /// finishes the context. Used when no destination exists and late
    /// forking is off.
    pub fn reject(&mut self, code: u16) {
        self.core.forward_synthesized(code);
        self.finish_check();
    }

    fn finish_check(&mut self) {
        if self.core.take_finish_check() && self.variant.should_finish(&self.core) {
            self.core.set_finished();
        }
    }
}

impl std::fmt::Debug for ForkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkContext")
            .field("id", &self.core.id)
            .field("variant", &self.variant.name())
            .field("state", &self.core.state)
            .field("branches", &self.core.branches)
            .finish()
    }
}
