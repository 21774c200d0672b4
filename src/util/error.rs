use thiserror::Error;

/// Broad category of a [`C2Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No connector could be resolved, or a configuration value is unusable
    Configuration,
    /// The operation conflicts with current registry state
    State,
    /// The peer answered with something the handshake does not accept
    Protocol,
    /// A connector failed to connect, listen, read or write
    Transport,
    /// The session is closed or its queue cannot take more packets
    Session,
}

/// c2link errors
#[derive(Error, Debug)]
pub enum C2Error {
    #[error("invalid or missing connector")]
    NoConnector,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("listener {0} is already active")]
    ListenerExists(String),

    #[error("server is shut down")]
    ServerClosed,

    #[error("server sent an invalid response")]
    InvalidResponse,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Session queue is full")]
    QueueFull,
}

impl C2Error {
    /// Wrap a transport failure with the address or bind context it happened on
    pub fn transport(context: impl Into<String>, source: std::io::Error) -> Self {
        C2Error::Transport {
            context: context.into(),
            source,
        }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            C2Error::NoConnector | C2Error::Config(_) => ErrorKind::Configuration,
            C2Error::ListenerExists(_) | C2Error::ServerClosed => ErrorKind::State,
            C2Error::InvalidResponse | C2Error::Protocol(_) | C2Error::InvalidPacket(_) => {
                ErrorKind::Protocol
            }
            C2Error::Transport { .. } | C2Error::Io(_) | C2Error::Tls(_) => ErrorKind::Transport,
            C2Error::SessionClosed | C2Error::QueueFull => ErrorKind::Session,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, C2Error>;
