// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Message (MESSAGE) forking policy.

use prong_core::Response;
use prong_core::SipUri;

use crate::context::{ForkCore, ForkVariant};

/// MESSAGE fork: deliver to every registered device, report one outcome.
///
/// Provisionals are hop-by-hop for MESSAGE and never forwarded. The fork
/// aggregates until every branch has a final response, then forwards the
/// best. With `fork-late` the context stays open for the whole delivery
/// window so devices registering late still receive the message.
#[derive(Debug, Default)]
pub struct MessageFork;

impl MessageFork {
    pub fn new() -> Self {
        Self
    }
}

impl ForkVariant for MessageFork {
    fn name(&self) -> &'static str {
        "message"
    }

    fn on_response(&mut self, core: &mut ForkCore, _index: usize, response: &Response) {
        if response.code() < 200 {
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
        }
    }

    fn on_new_register(&self, core: &ForkCore, dest: &SipUri, uid: &str) -> bool {
        if !core.config().fork_late || core.late_timer_expired() {
            return false;
        }
        if let Some(index) = core.find_branch_by_uid(uid) {
            // An undelivered device that re-registers gets a fresh attempt;
            // one that already took the message does not see it twice.
            return !core.branches()[index].is_answered();
        }
        core.find_branch_by_dest(dest).is_none()
    }

    fn should_finish(&self, core: &ForkCore) -> bool {
        !core.config().fork_late && core.all_branches_answered()
    }
}
