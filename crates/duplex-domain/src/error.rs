/// Error taxonomy shared by every component of the duplex conversation engine.
///
/// `Cancelled` is deliberately the odd one out: it exists so internal control
/// flow has a typed value to propagate through `?`, but no public session or
/// controller method ever returns it — cooperative cancellation is expected,
/// not exceptional, and is always absorbed before it reaches a caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cancelled")]
    Cancelled,

    #[error("rejected: category '{category}' is at capacity")]
    Rejected { category: String },

    #[error("sink failure: {0}")]
    SinkFailure(String),

    #[error("upstream ended")]
    UpstreamEnded,

    #[error("collaborator failure: {0}")]
    CollaboratorFailure(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
