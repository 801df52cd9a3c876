// prong-rs - The Prong SIP Forking Proxy
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method, uri::SipUri};

const MAX_REASON_LENGTH: usize = 256;

/// Errors produced while building message start lines.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("invalid SIP status code: {code} (must be 100-699)")]
    InvalidStatusCode { code: u16 },
    #[error("reason phrase too long (max {max}, got {actual})")]
    ReasonTooLong { max: usize, actual: usize },
    #[error("reason phrase contains control characters")]
    InvalidReason,
}

/// First line of a SIP request: `Method SP Request-URI SP SIP/2.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl RequestLine {
    /// Creates a request line for the given method and target URI.
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self { method, uri }
    }
}

/// First line of a SIP response: `SIP/2.0 SP Status-Code SP Reason-Phrase`.
///
/// Validates the status code range and rejects control characters in the
/// reason phrase so a synthesized response can never smuggle CRLF into the
/// serialized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    code: u16,
    reason: SmolStr,
}

impl StatusLine {
    /// Creates a status line with the provided code and reason phrase.
    pub fn new(code: u16, reason: impl AsRef<str>) -> Result<Self, MessageError> {
        if !(100..=699).contains(&code) {
            return Err(MessageError::InvalidStatusCode { code });
        }
        let reason = reason.as_ref();
        if reason.len() > MAX_REASON_LENGTH {
            return Err(MessageError::ReasonTooLong {
                max: MAX_REASON_LENGTH,
                actual: reason.len(),
            });
        }
        if reason.chars().any(|c| c.is_control()) {
            return Err(MessageError::InvalidReason);
        }
        Ok(Self {
            code,
            reason: SmolStr::new(reason),
        })
    }

    /// Returns the status code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Returns the reason phrase.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// In-memory representation of a SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub start: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    /// Assembles a request from its parts.
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Returns the Call-ID header value, if present.
    pub fn call_id(&self) -> Option<&SmolStr> {
        self.headers.get("Call-ID")
    }

    /// Returns the top-most Via header value, if present.
    pub fn top_via(&self) -> Option<&SmolStr> {
        self.headers.get("Via")
    }
}

/// In-memory representation of a SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub start: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    /// Assembles a response from its parts.
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Returns the status code.
    pub fn code(&self) -> u16 {
        self.start.code()
    }

    /// Returns `true` for final responses (>= 200).
    pub fn is_final(&self) -> bool {
        self.code() >= 200
    }

    /// Synthesizes a response to the given request, copying the headers a
    /// proxy must mirror (Via chain, From, To, Call-ID, CSeq).
    ///
    /// The reason phrase defaults to the canonical one for `code`.
    pub fn for_request(request: &Request, code: u16) -> Result<Self, MessageError> {
        let mut headers = Headers::new();
        for via in request.headers.get_all("Via") {
            headers.push("Via", via.clone());
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = request.headers.get(name) {
                headers.push(SmolStr::new(name), value.clone());
            }
        }
        headers.push("Content-Length", "0");
        Ok(Self::new(
            StatusLine::new(code, reason_phrase(code))?,
            headers,
            Bytes::new(),
        ))
    }
}

/// Returns the status class (1..=6) for a code.
pub fn status_class(code: u16) -> u16 {
    code / 100
}

/// Canonical reason phrase for the status codes the proxy synthesizes or
/// routinely sees; empty for everything else.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        302 => "Moved Temporarily",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        415 => "Unsupported Media Type",
        420 => "Bad Extension",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        486 => "Busy Here",
        487 => "Request Terminated",
        489 => "Bad Event",
        493 => "Undecipherable",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        600 => "Busy Everywhere",
        603 => "Decline",
        _ => "",
    }
}

/// Strips the `tag` parameter from the To header of a response, if any.
///
/// Workaround for upstreams that key dialogs on the To-tag of forked
/// provisional responses and terminate the wrong call.
pub fn remove_to_tag(response: &mut Response) {
    let Some(to) = response.headers.get("To") else {
        return;
    };
    let stripped: String = to
        .split(';')
        .enumerate()
        .filter(|(i, part)| *i == 0 || !part.trim_start().starts_with("tag="))
        .map(|(_, part)| part)
        .collect::<Vec<_>>()
        .join(";");
    if stripped.len() != to.len() {
        response.headers.set_or_push("To", stripped);
    }
}
