use crate::job::JobId;

/// Errors surfaced by the queue client, producer, dispatcher and admin facade.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The broker could not be reached or the connection dropped mid-command.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The broker answered with a server-side error line.
    #[error("broker rejected `{command}`: {reply}")]
    BrokerRejected { command: String, reply: String },

    /// The broker answered with something the adapter could not interpret.
    #[error("malformed broker response to `{command}`: {detail}")]
    MalformedResponse { command: String, detail: String },

    /// The referenced job does not exist (deleted, or never existed).
    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// The referenced tube does not exist on the broker, or holds no job in
    /// the requested state.
    #[error("tube `{0}` not found")]
    TubeNotFound(String),

    /// A producer referenced a tube with no local registration.
    #[error("unknown tube `{0}`")]
    UnknownTube(String),

    /// A producer supplied an empty or non-object payload.
    #[error("payload for tube `{0}` must be a non-empty object")]
    EmptyPayload(String),

    /// A reserved job carried no tag, or a tag with no registration.
    #[error("job {id} is unroutable: {reason}")]
    UnroutableTag { id: JobId, reason: String },

    /// A reserved job resolved to a tube that has no bound handler.
    #[error("tube `{0}` has no handler bound")]
    HandlerMissing(String),

    /// The handler reported a non-success outcome, errored, or panicked.
    #[error("handler for tube `{tube}` failed: {reason}")]
    HandlerFailure { tube: String, reason: String },

    /// Envelope serialization failed.
    #[error("failed to encode job envelope: {0}")]
    Encode(#[from] serde_json::Error),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Whether this error means "the referenced job or tube is absent".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::JobNotFound(_) | Self::TubeNotFound(_))
    }

    pub(crate) fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::BrokerUnavailable(err.to_string())
    }

    pub(crate) fn malformed(
        command: impl Into<String>,
        detail: impl std::fmt::Display,
    ) -> Self {
        Self::MalformedResponse {
            command: command.into(),
            detail: detail.to_string(),
        }
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        Self::BrokerUnavailable(err.to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;
