// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Basic forking policy for methods without dedicated aggregation rules.

use prong_core::Response;

use crate::config::ForkConfig;
use crate::context::{ForkCore, ForkVariant, Urgency};

/// Plain fork: forward provisionals, treat every final as urgent, answer as
/// soon as all branches have, and finish immediately.
#[derive(Debug, Default)]
pub struct BasicFork;

impl BasicFork {
    pub fn new() -> Self {
        Self
    }
}

impl ForkVariant for BasicFork {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn on_response(&mut self, core: &mut ForkCore, index: usize, response: &Response) {
        let code = response.code();

        if code < 200 {
            if !core.is_cancelled() {
                core.forward_response_from(index);
            }
            return;
        }

        if core.is_cancelled() {
            if core.all_branches_answered() {
                core.set_finished();
            }
            return;
        }

        if code >= 600 && !core.config().fork_no_global_decline {
            core.forward_response_from(index);
            core.cancel_pending_branches_except(Some(index));
            core.set_finished();
            return;
        }

        if core.all_branches_answered() {
            core.forward_best(&Urgency::all());
        }
    }

    fn urgency(&self, _cfg: &ForkConfig) -> Urgency {
        Urgency::all()
    }
}
