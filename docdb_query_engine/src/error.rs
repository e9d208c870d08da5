use std::{borrow::Cow, fmt::Display};

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A partition key range reported by the routing collaborator is gone (split or merged).
    ///
    /// This is consumed internally by the producer to trigger split resolution and should only
    /// ever reach a caller if that resolution itself fails.
    PartitionGone,

    /// A continuation token could not be parsed, used a future wire version, or named a
    /// partition key range that was merged away since the token was issued.
    ///
    /// This error is not recoverable; the caller must restart the query without a continuation.
    InvalidContinuation,

    /// The backend throttled a request (429) and the retry policy's budget was exhausted.
    Throttled,

    /// A request timed out at the transport layer and the retry policy's budget was exhausted.
    TimedOut,

    /// The query execution was cancelled by the caller.
    Cancelled,

    /// The query plan requires a composition of features the pipeline does not support
    /// (for example, an aggregate combined with `ORDER BY`, or `GROUP BY`).
    PlanRejected,

    /// The backend returned a 5xx error after retries were exhausted.
    BackendError,

    /// The backend returned a 4xx error that was not 429 and is not retryable.
    BadRequest,

    /// Indicates that the query plan or partition key ranges gathered from the gateway are invalid.
    ///
    /// This error is not recoverable and indicates a bug in the gateway.
    InvalidGatewayResponse,

    /// Indicates a deserialization failure, the details of which should be available in [`Error::source`](std::error::Error::source).
    DeserializationError,

    /// Indicates that a call specified a partition key range ID that is not known to the query pipeline.
    UnknownPartitionKeyRange,

    /// Indicates an internal error in the query pipeline.
    ///
    /// This error is not recoverable, and indicates a bug in the client engine.
    InternalError,

    /// Indicates that an aggregate computation produced a non-finite value (NaN or infinity).
    ArithmeticOverflow,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ErrorKind::PartitionGone => write!(f, "partition key range is gone"),
            ErrorKind::InvalidContinuation => write!(f, "invalid continuation token"),
            ErrorKind::Throttled => write!(f, "request throttled"),
            ErrorKind::TimedOut => write!(f, "request timed out"),
            ErrorKind::Cancelled => write!(f, "query execution cancelled"),
            ErrorKind::PlanRejected => write!(f, "query plan is not supported"),
            ErrorKind::BackendError => write!(f, "backend error"),
            ErrorKind::BadRequest => write!(f, "bad request"),
            ErrorKind::InvalidGatewayResponse => write!(f, "invalid data received from gateway"),
            ErrorKind::DeserializationError => write!(f, "deserialization error"),
            ErrorKind::UnknownPartitionKeyRange => write!(f, "unknown partition key range"),
            ErrorKind::InternalError => write!(f, "internal client engine error"),
            ErrorKind::ArithmeticOverflow => write!(f, "aggregator has non-finite value"),
        }
    }
}

impl ErrorKind {
    pub fn with_source(self, source: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error::from(self).with_source(source)
    }

    pub fn with_message(self, message: impl Into<Cow<'static, str>>) -> Error {
        Error::from(self).with_message(message)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    message: Option<Cow<'static, str>>,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            source: None,
            message: None,
        }
    }
}

impl Error {
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_message(mut self, message: impl Into<Cow<'static, str>>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn into_source(self) -> Option<Box<dyn std::error::Error + Send + Sync>> {
        self.source
    }

    /// Indicates whether a retry policy should be given the chance to retry this error.
    ///
    /// `PartitionGone` is excluded: it's handled by split resolution, never by retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Throttled | ErrorKind::TimedOut)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{message}"),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let source = self.source.as_ref()?;
        Some(&**source)
    }
}
