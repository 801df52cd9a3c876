// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The Prong fork engine.
//!
//! For a single incoming request this crate maintains a set of outgoing
//! branches, aggregates their responses per SIP semantics, honors deliveries
//! to targets that register after forking began, and drives the delivery and
//! aggregation timers. The state machine is strictly single-threaded: every
//! context method runs on one serialized event loop, and long-running work
//! (transport, registrar lookups, push delivery) lives behind the seams in
//! [`transaction`] and completes by posting events back to that loop.
//!
//! - [`ForkContext`] / [`ForkCore`]: the fork state machine
//! - [`CallFork`], [`MessageFork`], [`BasicFork`]: per-method policies
//! - [`TimerQueue`] / [`ForkScheduler`]: deterministic one-shot timers
//! - [`ForkConfig`]: the recognized `fork-*` policy options

pub mod basic;
pub mod branch;
pub mod call;
pub mod config;
pub mod context;
pub mod error;
pub mod message;
pub mod timer;
pub mod transaction;

pub use basic::BasicFork;
pub use branch::{BranchInfo, PushInfo};
pub use call::CallFork;
pub use config::{ConfigError, ForkConfig};
pub use context::{
    AddedBranch, ContextId, ForkContext, ForkCore, ForkListener, ForkState, ForkVariant, Urgency,
    URGENT_CODES,
};
pub use error::ForkError;
pub use message::MessageFork;
pub use timer::{ForkScheduler, TimerEvent, TimerHandle, TimerKind, TimerQueue};
pub use transaction::{
    branch_from_via, generate_branch_id, IncomingTransaction, OutgoingTransaction, TransactionKey,
    TransactionLayer, TransportError,
};
