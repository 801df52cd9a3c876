use std::sync::Arc;

use prong_core::{Request, Response};
use prong_fork::{IncomingTransaction, TransactionKey};
use prong_registrar::RegistrationEvent;
use smol_str::SmolStr;

/// Everything the router's serialized loop can be asked to process.
///
/// The external stack, the registrar and any push collaborator all talk to
/// the router by posting these; nothing touches a fork context from outside
/// the loop.
pub enum RouterEvent {
    /// A forkable request arrived, with its server transaction.
    Request {
        request: Request,
        incoming: Arc<dyn IncomingTransaction>,
    },
    /// A response arrived on an outgoing (client) transaction.
    Response {
        key: TransactionKey,
        response: Response,
    },
    /// The caller cancelled; `key` is the incoming transaction of the
    /// original request.
    Cancel { key: TransactionKey },
    /// The registrar saw a new contact for an address-of-record.
    Registration(RegistrationEvent),
    /// A push notification was handed off for the device `uid` of the fork
    /// owning `key`.
    PushSent { key: TransactionKey, uid: SmolStr },
}

impl std::fmt::Debug for RouterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request { request, .. } => f
                .debug_struct("Request")
                .field("method", &request.start.method.as_str())
                .finish_non_exhaustive(),
            Self::Response { key, response } => f
                .debug_struct("Response")
                .field("branch", &key.branch)
                .field("code", &response.code())
                .finish(),
            Self::Cancel { key } => f.debug_struct("Cancel").field("branch", &key.branch).finish(),
            Self::Registration(event) => f
                .debug_struct("Registration")
                .field("aor", &event.aor)
                .finish(),
            Self::PushSent { uid, .. } => {
                f.debug_struct("PushSent").field("uid", &uid).finish()
            }
        }
    }
}
