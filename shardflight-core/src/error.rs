use arrow::error::ArrowError;
use thiserror::Error;

/// Failure kinds of a single stream.
///
/// Every failure is scoped to one stream and never retried: a ticket is
/// single-use. The RPC layer maps each kind to a client-visible status code.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Ticket unknown or already consumed.
    #[error("Stream not found: {0}")]
    NotFound(String),

    /// Ticket bytes could not be decoded.
    #[error("Invalid ticket: {0}")]
    InvalidTicket(String),

    /// Client- or shutdown-driven cancellation.
    #[error("Stream cancelled: {0}")]
    Cancelled(String),

    /// The consumer did not drain the previous batch in time.
    #[error("Stream timed out: {0}")]
    Timeout(String),

    /// Another consumer already holds this ticket.
    #[error("Stream already being consumed: {0}")]
    SecondConsumer(String),

    /// The service is shutting down or not accepting streams.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type StreamResult<T> = Result<T, StreamError>;

impl StreamError {
    /// Short kind label used in structured logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidTicket(_) => "invalid_ticket",
            Self::Cancelled(_) => "cancelled",
            Self::Timeout(_) => "timeout",
            Self::SecondConsumer(_) => "second_consumer",
            Self::Unavailable(_) => "unavailable",
            Self::OutOfMemory(_) => "out_of_memory",
            Self::Arrow(_) | Self::Transport(_) | Self::Internal(_) => "internal",
        }
    }

    /// Rebuild an owned copy for reporting to the listener while the
    /// original is still returned to the caller.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        match self {
            Self::NotFound(m) => Self::NotFound(m.clone()),
            Self::InvalidTicket(m) => Self::InvalidTicket(m.clone()),
            Self::Cancelled(m) => Self::Cancelled(m.clone()),
            Self::Timeout(m) => Self::Timeout(m.clone()),
            Self::SecondConsumer(m) => Self::SecondConsumer(m.clone()),
            Self::Unavailable(m) => Self::Unavailable(m.clone()),
            Self::OutOfMemory(m) => Self::OutOfMemory(m.clone()),
            Self::Arrow(e) => Self::Internal(e.to_string()),
            Self::Transport(m) => Self::Transport(m.clone()),
            Self::Internal(m) => Self::Internal(m.clone()),
        }
    }
}

impl From<StreamError> for tonic::Status {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::NotFound(msg) => Self::not_found(format!("stream not found: {msg}")),
            StreamError::InvalidTicket(msg) => Self::invalid_argument(format!("invalid ticket: {msg}")),
            StreamError::Cancelled(msg) => Self::cancelled(msg),
            StreamError::Timeout(msg) => Self::deadline_exceeded(msg),
            StreamError::SecondConsumer(msg) => Self::already_exists(msg),
            StreamError::Unavailable(msg) => Self::unavailable(msg),
            StreamError::OutOfMemory(msg) => Self::resource_exhausted(msg),
            StreamError::Arrow(e) => Self::internal(e.to_string()),
            StreamError::Transport(msg) | StreamError::Internal(msg) => Self::internal(msg),
        }
    }
}

impl From<tonic::Status> for StreamError {
    fn from(status: tonic::Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            tonic::Code::NotFound => {
                Self::NotFound(strip(&msg, "stream not found: "))
            }
            tonic::Code::InvalidArgument => Self::InvalidTicket(strip(&msg, "invalid ticket: ")),
            tonic::Code::Cancelled => Self::Cancelled(msg),
            tonic::Code::DeadlineExceeded => Self::Timeout(msg),
            tonic::Code::AlreadyExists => Self::SecondConsumer(msg),
            tonic::Code::Unavailable => Self::Unavailable(msg),
            tonic::Code::ResourceExhausted => Self::OutOfMemory(msg),
            _ => Self::Transport(format!("{}: {msg}", status.code())),
        }
    }
}

/// Drop the prefix added on the way out so relayed errors do not stack it.
fn strip(msg: &str, prefix: &str) -> String {
    msg.strip_prefix(prefix).unwrap_or(msg).to_string()
}

impl From<tonic::transport::Error> for StreamError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let status: tonic::Status = StreamError::NotFound("abc".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert!(status.message().contains("not found"));

        let status: tonic::Status = StreamError::Timeout("slow".into()).into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);

        let status: tonic::Status = StreamError::SecondConsumer("t".into()).into();
        assert_eq!(status.code(), tonic::Code::AlreadyExists);
    }

    #[test]
    fn test_status_round_trip_keeps_kind() {
        let err = StreamError::from(tonic::Status::cancelled("client went away"));
        assert!(matches!(err, StreamError::Cancelled(_)));

        let status: tonic::Status = StreamError::NotFound("abc@node-b".into()).into();
        let err = StreamError::from(status);
        assert_eq!(err.to_string(), StreamError::NotFound("abc@node-b".into()).to_string());

        let err = StreamError::from(tonic::Status::unknown("boom"));
        assert_eq!(err.kind(), "internal");
    }
}
