//! Error types for teleconsole.

use thiserror::Error;

/// Main error type for teleconsole operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed config file, bad endpoint host, or conflicting flags.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Unreadable identity file, unsupported key, or empty remote key list.
    #[error("invalid identity: {message}")]
    IdentityInvalid { message: String },

    /// Identity file uses a key algorithm the loader does not handle.
    #[error("unsupported SSH key algorithm: {algorithm}")]
    UnsupportedKey { algorithm: String },

    /// Network-level failure contacting the broker (DNS, connect, TLS).
    #[error("cannot reach {url}: {message}")]
    BrokerTransport { url: String, message: String },

    /// TLS handshake failed because the server certificate is signed by an
    /// unknown authority.
    #[error(
        "the SSL certificate for {url} cannot be trusted!\n\
         Either you are being attacked, or try --insecure if you know what you're doing"
    )]
    UntrustedCertificate { url: String },

    /// Non-200 HTTP response from the broker.
    #[error("{status}: {message}")]
    BrokerProtocol { status: u16, message: String },

    /// Broker response the client cannot parse.
    #[error("server returned malformed response: {message}")]
    VersionMismatch { message: String },

    /// Stats polling exhausted without the proxy seeing any party.
    #[error("SSH tunnel cannot be established, please try again")]
    TunnelNotEstablished,

    /// The broker does not know this session.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// No local private key matches any of the session's users.
    #[error("{message}")]
    KeyMismatch { message: String },

    /// SSH connect attempts exhausted when joining.
    #[error("could not join the session after {attempts} attempts")]
    JoinFailed { attempts: u32 },

    /// Forward specification the parser refused.
    #[error("invalid forwarding spec: '{spec}'\nExamples: localhost:5000 or http://gravitational.com")]
    InvalidForwardSpec { spec: String },

    /// SSH-level failure (handshake, auth, channel).
    #[error("SSH error: {message}")]
    Ssh { message: String },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub fn identity(message: impl Into<String>) -> Self {
        Error::IdentityInvalid {
            message: message.into(),
        }
    }

    pub fn ssh(message: impl std::fmt::Display) -> Self {
        Error::Ssh {
            message: message.to_string(),
        }
    }

    /// Returns true if the cause is an unknown-authority TLS failure. The CLI
    /// prints the `--insecure` hint for these.
    pub fn is_untrusted_cert(&self) -> bool {
        matches!(self, Error::UntrustedCertificate { .. })
    }

    /// Returns true if this error aborts the conversation with the broker.
    ///
    /// Warning banners are informational; everything else here is terminal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::VersionMismatch { .. })
    }
}

/// Convenience result type for teleconsole operations.
pub type Result<T> = std::result::Result<T, Error>;
