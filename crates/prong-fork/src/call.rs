// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Call (INVITE) forking policy.

use prong_core::Response;
use prong_core::SipUri;

use crate::context::{ForkCore, ForkVariant};

/// INVITE fork: ring every registered device, commit to the first 2xx.
///
/// - provisionals are forwarded as they arrive;
/// - the first 2xx wins: it is forwarded, every other pending branch is
///   cancelled and the fork finishes;
/// - a 6xx terminates the whole fork the same way, unless
///   `fork-no-global-decline` shares the call with the remaining branches;
/// - urgent finals (auth challenges, busy, unsupported media, ...) are
///   buffered for `urgent-timeout` seconds in case a better branch answers;
/// - with `fork-late`, a forwarded non-2xx final keeps the context alive for
///   late registrations until the delivery window closes.
#[derive(Debug, Default)]
pub struct CallFork;

impl CallFork {
    pub fn new() -> Self {
        Self
    }
}

impl ForkVariant for CallFork {
    fn name(&self) -> &'static str {
        "call"
    }

    fn on_response(&mut self, core: &mut ForkCore, index: usize, response: &Response) {
        let code = response.code();

        if code < 200 {
            if !core.is_cancelled() {
                core.forward_response_from(index);
            }
            return;
        }

        if (200..300).contains(&code) {
            core.forward_response_from(index);
            core.cancel_pending_branches_except(Some(index));
            core.set_finished();
            return;
        }

        if code >= 600 && !core.config().fork_no_global_decline {
            if !core.is_cancelled() {
                core.forward_response_from(index);
            }
            core.cancel_pending_branches_except(Some(index));
            core.set_finished();
            return;
        }

        if core.is_cancelled() {
            if core.all_branches_answered() {
                core.set_finished();
            }
            return;
        }

        if core.all_branches_answered() {
            if !core.forwarded_final() {
                let urgency = self.urgency(core.config());
                core.forward_best(&urgency);
            } else {
                core.request_finish_check();
            }
            return;
        }

        if self.urgency(core.config()).contains(code) && !core.forwarded_final() {
            core.arm_urgent_timer();
        }
    }

    fn on_new_register(&self, core: &ForkCore, dest: &SipUri, uid: &str) -> bool {
        if !core.config().fork_late || core.late_timer_expired() {
            return false;
        }
        // A device that re-registers before answering gets a fresh branch in
        // place of its stale one.
        if let Some(index) = core.find_branch_by_uid(uid) {
            return !core.branches()[index].is_answered();
        }
        core.find_branch_by_dest(dest).is_none()
    }

    fn should_finish(&self, core: &ForkCore) -> bool {
        !core.config().fork_late && core.all_branches_answered()
    }

    fn on_urgent_timeout(&mut self, core: &mut ForkCore) {
        if core.forwarded_final() || core.is_cancelled() {
            return;
        }
        let urgency = self.urgency(core.config());
        core.forward_best(&urgency);
    }
}
