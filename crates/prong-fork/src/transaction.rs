// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Seam between the fork engine and the external SIP transaction layer.
//!
//! The surrounding stack owns parsing, retransmission, and the RFC 3261
//! transaction state machines; the fork engine only ever talks to it through
//! the handles defined here. Handing a message to a transaction must never
//! block: implementations enqueue and return.

use std::sync::Arc;

use prong_core::{Method, Request, Response};
use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;

/// Failures reported by the transaction layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("no transaction for request: {0}")]
    NoTransaction(String),
    #[error("transport send failed: {0}")]
    Send(String),
}

/// Unique identity of a transaction: Via branch, method and direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub method: Method,
    pub is_server: bool,
}

impl TransactionKey {
    /// Key for a client (outgoing) transaction.
    pub fn client(branch: impl Into<SmolStr>, method: Method) -> Self {
        Self {
            branch: branch.into(),
            method,
            is_server: false,
        }
    }

    /// Key for a server (incoming) transaction.
    pub fn server(branch: impl Into<SmolStr>, method: Method) -> Self {
        Self {
            branch: branch.into(),
            method,
            is_server: true,
        }
    }

    /// Derives a key from a request's top Via branch parameter.
    pub fn from_request(request: &Request, is_server: bool) -> Option<Self> {
        let via = request.top_via()?;
        let branch = branch_from_via(via)?;
        Some(Self {
            branch: SmolStr::new(branch),
            method: request.start.method.clone(),
            is_server,
        })
    }
}

/// Extracts the `branch=` parameter from a Via header value.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|part| {
        let mut split = part.splitn(2, '=');
        let name = split.next()?.trim();
        let value = split.next()?.trim();
        if name.eq_ignore_ascii_case("branch") {
            Some(value)
        } else {
            None
        }
    })
}

/// Generates a new RFC 3261 magic-cookie branch identifier.
pub fn generate_branch_id() -> SmolStr {
    let mut rng = rand::thread_rng();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("z9hG4bK{}", suffix))
}

/// Server-side transaction created for the original forked request; replies
/// travel upstream through it.
pub trait IncomingTransaction: Send + Sync {
    fn key(&self) -> &TransactionKey;

    /// Sends a response upstream. Non-blocking.
    fn reply(&self, response: &Response) -> Result<(), TransportError>;
}

/// Client-side transaction owned by a single branch.
pub trait OutgoingTransaction: Send + Sync {
    fn key(&self) -> &TransactionKey;

    /// Hands the branch request to the transport. Non-blocking.
    fn send(&self, request: &Request) -> Result<(), TransportError>;

    /// Issues a CANCEL (or equivalent teardown) for this transaction.
    fn cancel(&self);
}

/// Factory half of the seam: allocates client transactions for new branches.
pub trait TransactionLayer: Send + Sync {
    fn create_outgoing(
        &self,
        request: &Request,
    ) -> Result<Arc<dyn OutgoingTransaction>, TransportError>;
}
