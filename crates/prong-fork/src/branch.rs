use std::sync::Arc;

use prong_core::{Request, Response, SipUri};
use smol_str::SmolStr;

use crate::transaction::OutgoingTransaction;

/// Push-notification routing data carried as contact URI parameters
/// (`pn-type`, `pn-tok`, `app-id`) by registrations from mobile devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushInfo {
    pub kind: SmolStr,
    pub token: SmolStr,
    pub app_id: Option<SmolStr>,
}

impl PushInfo {
    /// Extracts push parameters from a contact or request URI, if present.
    pub fn from_uri(uri: &SipUri) -> Option<Self> {
        let kind = uri.param("pn-type")??;
        let token = uri.param("pn-tok")??;
        Some(Self {
            kind: SmolStr::new(kind),
            token: SmolStr::new(token),
            app_id: uri.param("app-id").flatten().map(SmolStr::new),
        })
    }
}

/// Per-destination record of a fork: one outgoing attempt toward one
/// registered contact.
pub struct BranchInfo {
    /// Stable device identifier (`+sip.instance`) used to suppress duplicate
    /// branches when the same device re-registers.
    pub uid: SmolStr,
    /// The outgoing request sent on this branch.
    pub request: Request,
    /// Handle to the outgoing transaction in the external stack.
    pub transaction: Arc<dyn OutgoingTransaction>,
    /// Most recent response seen on this branch.
    pub last_response: Option<Response>,
    /// A CANCEL was already issued for this branch.
    pub cancelled: bool,
    /// Push routing data, when the target contact advertised it.
    pub push: Option<PushInfo>,
}

impl BranchInfo {
    pub fn new(
        uid: impl Into<SmolStr>,
        request: Request,
        transaction: Arc<dyn OutgoingTransaction>,
    ) -> Self {
        let push = PushInfo::from_uri(&request.start.uri);
        Self {
            uid: uid.into(),
            request,
            transaction,
            last_response: None,
            cancelled: false,
            push,
        }
    }

    /// Status code of the last response, or 0 if none arrived yet.
    pub fn status(&self) -> u16 {
        self.last_response.as_ref().map(Response::code).unwrap_or(0)
    }

    /// Returns `true` once a final response (>= 200) was recorded.
    pub fn is_answered(&self) -> bool {
        self.status() >= 200
    }

    /// The destination this branch was sent to.
    pub fn destination(&self) -> &SipUri {
        &self.request.start.uri
    }
}

impl std::fmt::Debug for BranchInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchInfo")
            .field("uid", &self.uid)
            .field("destination", &self.destination().to_string())
            .field("status", &self.status())
            .field("cancelled", &self.cancelled)
            .field("push", &self.push)
            .finish()
    }
}
