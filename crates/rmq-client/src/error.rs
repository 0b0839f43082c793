//! Error taxonomy.
//!
//! Transport failures coming out of lapin are folded into a small set of
//! [`TransportKind`]s by substring classification; everything the library
//! surfaces is a [`ClientError`] with a stable code string and a retryable
//! flag. Broker-specific text never crosses the API unwrapped.

use thiserror::Error;

/// Classified transport failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Connection,
    Timeout,
    Auth,
    Resource,
    Parameter,
    Server,
    Unknown,
}

impl TransportKind {
    pub fn retryable(&self) -> bool {
        match self {
            TransportKind::Connection => true,
            TransportKind::Timeout => true,
            TransportKind::Auth => false,
            TransportKind::Resource => true,
            TransportKind::Parameter => false,
            TransportKind::Server => true,
            TransportKind::Unknown => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            TransportKind::Connection => "CONNECTION_ERROR",
            TransportKind::Timeout => "TIMEOUT_ERROR",
            TransportKind::Auth => "AUTH_ERROR",
            TransportKind::Resource => "RESOURCE_ERROR",
            TransportKind::Parameter => "PARAMETER_ERROR",
            TransportKind::Server => "SERVER_ERROR",
            TransportKind::Unknown => "UNKNOWN_ERROR",
        }
    }
}

/// A transport error after classification.
#[derive(Error, Debug, Clone)]
#[error("{} ({})", message, kind.code())]
pub struct TransportError {
    pub kind: TransportKind,
    pub message: String,
}

impl TransportError {
    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

// Rules are evaluated top to bottom; the first matching substring wins.
const CLASSIFICATION_RULES: &[(TransportKind, &[&str])] = &[
    (
        TransportKind::Connection,
        &[
            "connection not available",
            "channel not available",
            "connection closed",
            "channel closed",
            "connection was closed",
            "connection reset",
            "connection refused",
            "broken pipe",
            "not connected",
        ],
    ),
    (
        TransportKind::Timeout,
        &["timeout", "timed out", "deadline exceeded", "context canceled"],
    ),
    (
        TransportKind::Auth,
        &["access refused", "access-refused", "not authorized", "authentication failure"],
    ),
    (
        TransportKind::Resource,
        &["resource limit exceeded", "resource-error", "out of memory", "too many channels"],
    ),
    (
        TransportKind::Parameter,
        &["invalid argument", "precondition failed", "precondition-failed", "not found", "not_found"],
    ),
    (
        TransportKind::Server,
        &["internal error", "internal-error", "server error", "unexpected server response"],
    ),
];

/// Fold raw transport error text into a [`TransportError`].
pub fn classify(message: impl Into<String>) -> TransportError {
    let message = message.into();
    let haystack = message.to_ascii_lowercase();

    for (kind, needles) in CLASSIFICATION_RULES {
        if needles.iter().any(|n| haystack.contains(n)) {
            return TransportError { kind: *kind, message };
        }
    }
    TransportError { kind: TransportKind::Unknown, message }
}

impl From<lapin::Error> for TransportError {
    fn from(e: lapin::Error) -> Self {
        classify(e.to_string())
    }
}

/// Everything the library surfaces to callers.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error("no manager registered for data source '{0}'")]
    ManagerNotFound(String),

    #[error("manager is closed")]
    ManagerClosed,

    #[error("manager is not initialized")]
    ManagerNotInitialized,

    #[error("connection failed: {0}")]
    ConnectionFailed(TransportError),

    #[error("channel creation failed: {0}")]
    ChannelCreationFailed(TransportError),

    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("exchange declaration failed: {0}")]
    ExchangePrepareFailed(TransportError),

    #[error("queue declaration failed: {0}")]
    QueuePrepareFailed(TransportError),

    #[error("dead-letter topology failed: {0}")]
    DlxFailed(TransportError),

    #[error("timed out waiting for an endpoint creation slot")]
    SemaphoreTimeout,

    #[error("signature key is required")]
    SignatureKeyRequired,

    #[error("invalid AES key length {0}")]
    InvalidAesKey(usize),

    #[error("serialization failed: {0}")]
    MarshalFailed(#[from] serde_json::Error),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("publish failed after {attempts} attempts: {last}")]
    PublishFailed { attempts: u32, last: Box<ClientError> },

    #[error("publish timed out")]
    PublishTimeout,

    #[error("transaction select failed: {0}")]
    TxStartFailed(TransportError),

    #[error("transaction commit failed: {0}")]
    TxCommitFailed(TransportError),

    #[error("batch messages must share the same exchange and queue")]
    BatchInconsistent,

    #[error("enabling confirm mode failed: {0}")]
    ConfirmModeError(TransportError),

    #[error("confirm stream closed with {remaining} confirmations outstanding")]
    ConfirmChannelClosed { remaining: usize },

    #[error("confirm deadline elapsed: {confirmed}/{expected} acknowledged")]
    ConfirmTimeout { confirmed: usize, expected: usize },

    #[error("message rejected by broker at delivery tag {tag}, {remaining} outstanding")]
    MessageRejected { tag: u64, remaining: usize },

    #[error("operation canceled")]
    ContextCanceled,

    #[error("no healthy endpoints")]
    NoHealthyChannels,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ClientError {
    /// Stable machine-readable code for the error.
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::Validation(_) => "VALIDATION_ERROR",
            ClientError::ManagerNotFound(_) => "MANAGER_NOT_FOUND",
            ClientError::ManagerClosed => "MANAGER_CLOSED",
            ClientError::ManagerNotInitialized => "MANAGER_NOT_INITIALIZED",
            ClientError::ConnectionFailed(_) => "CONNECTION_FAILED",
            ClientError::ChannelCreationFailed(_) => "CHANNEL_CREATION_FAILED",
            ClientError::ChannelUnavailable(_) => "CHANNEL_UNAVAILABLE",
            ClientError::ChannelClosed => "CHANNEL_CLOSED",
            ClientError::ExchangePrepareFailed(_) => "EXCHANGE_PREPARE_FAILED",
            ClientError::QueuePrepareFailed(_) => "QUEUE_PREPARE_FAILED",
            ClientError::DlxFailed(_) => "DLX_FAILED",
            ClientError::SemaphoreTimeout => "SEMAPHORE_TIMEOUT",
            ClientError::SignatureKeyRequired => "SIGNATURE_KEY_REQUIRED",
            ClientError::InvalidAesKey(_) => "INVALID_AES_KEY",
            ClientError::MarshalFailed(_) => "MARSHAL_FAILED",
            ClientError::EncryptionFailed(_) => "ENCRYPTION_FAILED",
            ClientError::PublishFailed { .. } => "PUBLISH_FAILED",
            ClientError::PublishTimeout => "PUBLISH_TIMEOUT",
            ClientError::TxStartFailed(_) => "TX_START_FAILED",
            ClientError::TxCommitFailed(_) => "TX_COMMIT_FAILED",
            ClientError::BatchInconsistent => "BATCH_INCONSISTENT",
            ClientError::ConfirmModeError(_) => "CONFIRM_MODE_ERROR",
            ClientError::ConfirmChannelClosed { .. } => "CONFIRM_CHANNEL_CLOSED",
            ClientError::ConfirmTimeout { .. } => "CONFIRM_TIMEOUT",
            ClientError::MessageRejected { .. } => "MESSAGE_REJECTED",
            ClientError::ContextCanceled => "CONTEXT_CANCELED",
            ClientError::NoHealthyChannels => "NO_HEALTHY_CHANNELS",
            ClientError::Transport(t) => t.kind.code(),
        }
    }

    /// Whether a caller (or the internal retry loop) may retry the operation.
    pub fn retryable(&self) -> bool {
        match self {
            ClientError::ConnectionFailed(t)
            | ClientError::ChannelCreationFailed(t)
            | ClientError::Transport(t) => t.retryable(),
            ClientError::ChannelUnavailable(_) => true,
            ClientError::SemaphoreTimeout => true,
            ClientError::PublishTimeout => true,
            ClientError::ConfirmChannelClosed { .. } => true,
            ClientError::ConfirmTimeout { .. } => true,
            ClientError::MessageRejected { .. } => true,
            _ => false,
        }
    }
}

impl From<lapin::Error> for ClientError {
    fn from(e: lapin::Error) -> Self {
        ClientError::Transport(TransportError::from(e))
    }
}

impl From<rmq_common::crypto::CryptoError> for ClientError {
    fn from(e: rmq_common::crypto::CryptoError) -> Self {
        use rmq_common::crypto::CryptoError;
        match e {
            CryptoError::KeyRequired => ClientError::SignatureKeyRequired,
            CryptoError::InvalidKeyLength(n) => ClientError::InvalidAesKey(n),
            CryptoError::Encrypt(m) | CryptoError::Decrypt(m) => ClientError::EncryptionFailed(m),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        let cases = [
            ("the channel closed unexpectedly", TransportKind::Connection, true),
            ("connection reset by peer", TransportKind::Connection, true),
            ("write failed: broken pipe", TransportKind::Connection, true),
            ("operation timed out", TransportKind::Timeout, true),
            ("deadline exceeded while waiting", TransportKind::Timeout, true),
            ("context canceled", TransportKind::Timeout, true),
            ("ACCESS_REFUSED - login refused", TransportKind::Auth, false),
            ("user not authorized for vhost", TransportKind::Auth, false),
            ("resource limit exceeded on node", TransportKind::Resource, true),
            ("too many channels open", TransportKind::Resource, true),
            ("PRECONDITION_FAILED - durable mismatch", TransportKind::Parameter, false),
            ("NOT_FOUND - no exchange 'missing' in vhost '/'", TransportKind::Parameter, false),
            ("internal error on node rabbit@host", TransportKind::Server, true),
            ("unexpected server response", TransportKind::Server, true),
            ("something inexplicable", TransportKind::Unknown, false),
        ];

        for (text, kind, retryable) in cases {
            let classified = classify(text);
            assert_eq!(classified.kind, kind, "text: {text}");
            assert_eq!(classified.retryable(), retryable, "text: {text}");
        }
    }

    #[test]
    fn test_first_match_wins() {
        // Contains both a connection and a timeout needle; connection rules
        // are evaluated first.
        let classified = classify("connection closed: handshake timeout");
        assert_eq!(classified.kind, TransportKind::Connection);
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(ClientError::ManagerClosed.code(), "MANAGER_CLOSED");
        assert_eq!(ClientError::SemaphoreTimeout.code(), "SEMAPHORE_TIMEOUT");
        assert_eq!(
            ClientError::ConfirmTimeout { confirmed: 3, expected: 10 }.code(),
            "CONFIRM_TIMEOUT"
        );
        assert_eq!(
            ClientError::Transport(classify("broken pipe")).code(),
            "CONNECTION_ERROR"
        );
    }

    #[test]
    fn test_retryable_flags() {
        assert!(ClientError::Transport(classify("connection reset")).retryable());
        assert!(ClientError::SemaphoreTimeout.retryable());
        assert!(ClientError::MessageRejected { tag: 8, remaining: 3 }.retryable());
        assert!(ClientError::ConfirmChannelClosed { remaining: 1 }.retryable());
        assert!(!ClientError::BatchInconsistent.retryable());
        assert!(!ClientError::ManagerClosed.retryable());
        assert!(!ClientError::Transport(classify("ACCESS_REFUSED")).retryable());
        assert!(!ClientError::ChannelClosed.retryable());
    }

    #[test]
    fn test_crypto_error_mapping() {
        use rmq_common::crypto::CryptoError;
        assert!(matches!(
            ClientError::from(CryptoError::KeyRequired),
            ClientError::SignatureKeyRequired
        ));
        assert!(matches!(
            ClientError::from(CryptoError::InvalidKeyLength(4)),
            ClientError::InvalidAesKey(4)
        ));
    }
}
