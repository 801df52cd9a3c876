// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP message types for the Prong forking proxy.
//!
//! This crate provides the in-memory message model the fork engine
//! manipulates:
//! - **Messages**: [`Request`], [`Response`] and their start lines
//! - **Headers**: the insertion-ordered [`Headers`] container
//! - **URIs**: [`SipUri`] (sip/sips)
//! - **Methods**: the [`Method`] enum
//!
//! Wire encoding and parsing belong to the surrounding SIP stack; everything
//! here is already-parsed structure. Types use [`SmolStr`](smol_str::SmolStr)
//! for short strings and [`Bytes`](bytes::Bytes) for bodies.

pub mod headers;
pub mod method;
pub mod msg;
pub mod uri;

pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{
    reason_phrase, remove_to_tag, status_class, MessageError, Request, RequestLine, Response,
    StatusLine,
};
pub use uri::{SipUri, UriError};
