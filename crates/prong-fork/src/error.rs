use crate::transaction::TransportError;

/// Errors surfaced by fork engine operations.
///
/// Everything here is recovered inside the engine or its caller; no error
/// ever reaches a SIP client except as a response forwarded upstream.
#[derive(Debug, thiserror::Error)]
pub enum ForkError {
    /// Operation attempted on a context that already called `set_finished`.
    #[error("fork context already finished")]
    ContextFinished,

    /// The external stack refused to allocate or feed a transaction.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
