//! Specific struct representations of DBus message types
use crate::message::{self, HeaderFieldName, Message};
use crate::types::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageDecodeError {
    BadMessageType,
    BadPath,
    BadInterface,
    BadMember,
    BadErrorName,
    BadReplySerial,
}

/// Unpacked, optional header fields that may be present in any message
#[derive(Debug, Clone, Default)]
pub struct OptionalHeaderFields {
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: String,
    pub serial: u32,
    pub flags: u8,
}

impl OptionalHeaderFields {
    fn new(msg: &Message) -> Self {
        OptionalHeaderFields {
            destination: msg.destination().map(str::to_owned),
            sender: msg.sender().map(str::to_owned),
            signature: msg.signature().to_owned(),
            serial: msg.serial,
            flags: msg.flags,
        }
    }
}

/// An unpacked, validated DBus method call
#[derive(Debug, Clone)]
pub struct MethodCall {
    pub path: String,
    pub interface: Option<String>,
    pub member: String,
    pub opt: OptionalHeaderFields,
    pub body: Vec<Value>,
}

impl MethodCall {
    pub fn new(msg: Message) -> Result<Self, MessageDecodeError> {
        Ok(MethodCall {
            path: msg.decode_header_field(HeaderFieldName::Path)
                .map(|p: crate::types::ObjectPath| p.0)
                .ok_or(MessageDecodeError::BadPath)?,
            interface: msg.interface().map(str::to_owned),
            member: msg.member().map(str::to_owned).ok_or(MessageDecodeError::BadMember)?,
            opt: OptionalHeaderFields::new(&msg),
            body: msg.body,
        })
    }

    pub fn expects_reply(&self) -> bool {
        self.opt.flags & message::flags::NO_REPLY_EXPECTED == 0
    }
}

/// An unpacked, validated DBus method return
#[derive(Debug, Clone)]
pub struct MethodReturn {
    pub reply_serial: u32,
    pub opt: OptionalHeaderFields,
    pub body: Vec<Value>,
}

impl MethodReturn {
    pub fn new(msg: Message) -> Result<Self, MessageDecodeError> {
        Ok(MethodReturn {
            reply_serial: msg.reply_serial().ok_or(MessageDecodeError::BadReplySerial)?,
            opt: OptionalHeaderFields::new(&msg),
            body: msg.body,
        })
    }
}

/// An unpacked, validated DBus signal
#[derive(Debug, Clone)]
pub struct Signal {
    pub path: String,
    pub interface: String,
    pub member: String,
    pub opt: OptionalHeaderFields,
    pub body: Vec<Value>,
}

impl Signal {
    pub fn new(msg: Message) -> Result<Self, MessageDecodeError> {
        Ok(Signal {
            path: msg.path().map(str::to_owned).ok_or(MessageDecodeError::BadPath)?,
            interface: msg.interface().map(str::to_owned).ok_or(MessageDecodeError::BadInterface)?,
            member: msg.member().map(str::to_owned).ok_or(MessageDecodeError::BadMember)?,
            opt: OptionalHeaderFields::new(&msg),
            body: msg.body,
        })
    }
}

/// An unpacked, validated DBus error
#[derive(Debug, Clone)]
pub struct Error {
    pub error_name: String,
    pub reply_serial: u32,
    pub opt: OptionalHeaderFields,
    pub body: Vec<Value>,
}

impl Error {
    pub fn new(msg: Message) -> Result<Self, MessageDecodeError> {
        Ok(Error {
            error_name: msg.error_name().map(str::to_owned).ok_or(MessageDecodeError::BadErrorName)?,
            reply_serial: msg.reply_serial().ok_or(MessageDecodeError::BadReplySerial)?,
            opt: OptionalHeaderFields::new(&msg),
            body: msg.body,
        })
    }

    /// The human readable text carried by the error, if any.
    pub fn message(&self) -> String {
        self.body.first().and_then(Value::as_str).unwrap_or("").to_owned()
    }

    pub fn into_error(self) -> crate::error::Error {
        let message = self.message();
        if self.error_name == crate::error::names::DISCONNECTED {
            return crate::error::Error::NotConnected;
        }
        crate::error::Error::remote(self.error_name, message)
    }
}

#[derive(Debug, Clone)]
pub enum MessageType {
    Method(MethodCall),
    MethodReturn(MethodReturn),
    Signal(Signal),
    Error(Error),
}

/// Converts a generic Message to a specific validated MessageType
pub fn decode_message(msg: Message) -> Result<MessageType, MessageDecodeError> {
    match msg.message_type {
        message::MESSAGE_TYPE_METHOD_CALL =>
            Ok(MessageType::Method(MethodCall::new(msg)?)),

        message::MESSAGE_TYPE_METHOD_RETURN =>
            Ok(MessageType::MethodReturn(MethodReturn::new(msg)?)),

        message::MESSAGE_TYPE_SIGNAL =>
            Ok(MessageType::Signal(Signal::new(msg)?)),

        message::MESSAGE_TYPE_ERROR =>
            Ok(MessageType::Error(Error::new(msg)?)),

        _ => Err(MessageDecodeError::BadMessageType),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{create_error, create_method_call, create_signal};

    #[test]
    fn test_decode_kinds() {
        let call = create_method_call(None, "/Test", Some("org.foo"), "Echo").add_arg("hi");
        match decode_message(call).unwrap() {
            MessageType::Method(m) => {
                assert_eq!(m.path, "/Test");
                assert_eq!(m.interface.as_deref(), Some("org.foo"));
                assert_eq!(m.member, "Echo");
                assert_eq!(m.body, vec![Value::from("hi")]);
                assert!(m.expects_reply());
            }
            other => panic!("unexpected {:?}", other),
        }
        match decode_message(create_signal("/a", "org.foo", "Changed")).unwrap() {
            MessageType::Signal(s) => assert_eq!(s.member, "Changed"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_disconnected_error_maps_to_not_connected() {
        let err = match decode_message(create_error(crate::error::names::DISCONNECTED, 1, "gone")).unwrap() {
            MessageType::Error(e) => e,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(err.into_error(), crate::error::Error::NotConnected));
    }

    #[test]
    fn test_missing_fields() {
        let mut m = create_signal("/a", "org.foo", "Changed");
        m.headers.remove(&HeaderFieldName::Interface);
        assert_eq!(decode_message(m).unwrap_err(), MessageDecodeError::BadInterface);
    }
}
