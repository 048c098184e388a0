use thiserror::Error;

use crate::token::TokenError;

/// Errors raised by sessions and the sample driver
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Socket level failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TLS negotiation or certificate failure
    #[cfg(feature = "mqtt-session")]
    #[error("tls error: {0}")]
    Tls(#[from] native_tls::Error),
    /// The connection string could not be turned into credentials
    #[error("invalid credentials: {0}")]
    Token(#[from] TokenError),
    /// The requested transport has no binding in this crate
    #[error("transport {0} is not supported")]
    UnsupportedTransport(&'static str),
    /// The session rejected an option
    #[error("option {name} rejected: {reason}")]
    Option {
        /// Option name as understood by the session
        name: &'static str,
        /// Why it was rejected
        reason: String,
    },
    /// No method handler could be registered, so no method call can ever be serviced
    #[error("failed to register method handler: {0}")]
    Registration(String),
    /// The MQTT connection was refused or behaved unexpectedly
    #[error("connection error: {0}")]
    Connection(String),
    /// The session has already failed and can no longer send
    #[error("session is not connected")]
    NotConnected,
    /// Sample settings could not be loaded
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Crate wide result type
pub type Result<T> = std::result::Result<T, Error>;
