// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Router module for the Prong SIP proxy.
//!
//! Glues the fork engine to its collaborators: for every forkable incoming
//! request it resolves the address-of-record through the location service,
//! creates a [`prong_fork::ForkContext`] with the right variant, and from
//! then on routes responses, cancels, late registrations, push signals and
//! timer expiries to that context over one serialized event loop.

pub mod events;
pub mod router;

pub use events::RouterEvent;
pub use router::Router;
