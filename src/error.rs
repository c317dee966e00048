//! Crate-wide error type.
//!
//! The wire layers keep their own small error enums (`address::Error`,
//! `DemarshalError`, `MessageDecodeError`); everything that crosses the public
//! API is folded into [`Error`].

use std::io;

use thiserror::Error;

use crate::address;
use crate::demarshal::DemarshalError;
use crate::dispatch::message_types::MessageDecodeError;

/// Well-known D-Bus error names.
pub mod names {
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
    pub const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
    pub const UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
    pub const PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
    pub const INVALID_SIGNATURE: &str = "org.freedesktop.DBus.Error.InvalidSignature";
    pub const INCONSISTENT_MESSAGE: &str = "org.freedesktop.DBus.Error.InconsistentMessage";
    pub const AUTH_FAILED: &str = "org.freedesktop.DBus.Error.AuthFailed";
    pub const DISCONNECTED: &str = "org.freedesktop.DBus.Local.Disconnected";
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid signature {signature:?}: {reason}")]
    SignatureParse { signature: String, reason: String },

    #[error("type conversion failed: {0}")]
    TypeConversion(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("wrong return type: {0}")]
    WrongReturnType(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("not connected")]
    NotConnected,

    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("export failed: {0}")]
    Export(String),

    #[error("bad address {1:?}: {0:?}")]
    Address(address::Error, String),

    #[error("demarshal failed: {0:?}")]
    Demarshal(DemarshalError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn remote<N: Into<String>, M: Into<String>>(name: N, message: M) -> Self {
        Error::Remote { name: name.into(), message: message.into() }
    }

    pub fn signature<S: Into<String>, R: Into<String>>(signature: S, reason: R) -> Self {
        Error::SignatureParse { signature: signature.into(), reason: reason.into() }
    }

    /// Prefixes the message with `ctx`, keeping the variant.
    pub fn with_context(self, ctx: &str) -> Self {
        match self {
            Error::TypeConversion(m) => Error::TypeConversion(format!("{}: {}", ctx, m)),
            Error::Deserialization(m) => Error::Deserialization(format!("{}: {}", ctx, m)),
            Error::WrongReturnType(m) => Error::WrongReturnType(format!("{}: {}", ctx, m)),
            Error::InvalidMessage(m) => Error::InvalidMessage(format!("{}: {}", ctx, m)),
            Error::SignatureParse { signature, reason } => Error::SignatureParse {
                signature,
                reason: format!("{}: {}", ctx, reason),
            },
            other => other,
        }
    }

    /// The wire error name used when this error is sent back as an Error reply.
    pub fn dbus_name(&self) -> &str {
        match self {
            Error::Remote { name, .. } => name,
            Error::SignatureParse { .. } => names::INVALID_SIGNATURE,
            Error::TypeConversion(_) | Error::Deserialization(_) => names::INVALID_ARGS,
            Error::InvalidMessage(_) | Error::Demarshal(_) => names::INCONSISTENT_MESSAGE,
            Error::AuthenticationFailure(_) => names::AUTH_FAILED,
            Error::NotConnected => names::DISCONNECTED,
            _ => names::FAILED,
        }
    }

    /// The human readable part of an Error reply.
    pub fn dbus_message(&self) -> String {
        match self {
            Error::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<address::ServerAddressError> for Error {
    fn from(e: address::ServerAddressError) -> Self {
        Error::Address(e.0, e.1)
    }
}

impl From<DemarshalError> for Error {
    fn from(e: DemarshalError) -> Self {
        Error::Demarshal(e)
    }
}

impl From<MessageDecodeError> for Error {
    fn from(e: MessageDecodeError) -> Self {
        Error::InvalidMessage(format!("{:?}", e))
    }
}
