//! Functions for creating, encoding and reading messages sent across the message bus.
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::io::{self, Read};

use crate::demarshal::Demarshaller;
use crate::error::{Error, Result};
use crate::marshal::{body_signature, pad_to_multiple, Marshal};
use crate::types::{ObjectPath, Signature, Struct, Value, Variant};

pub const PROTOCOL_VERSION: u8 = 1;
pub const MAX_MESSAGE_LENGTH: usize = 1 << 27;
pub const MAX_NAME_LENGTH: usize = 255;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageType(pub u8);
pub const MESSAGE_TYPE_INVALID: MessageType = MessageType(0);
pub const MESSAGE_TYPE_METHOD_CALL: MessageType = MessageType(1);
pub const MESSAGE_TYPE_METHOD_RETURN: MessageType = MessageType(2);
pub const MESSAGE_TYPE_ERROR: MessageType = MessageType(3);
pub const MESSAGE_TYPE_SIGNAL: MessageType = MessageType(4);

impl MessageType {
    pub fn name(self) -> &'static str {
        match self.0 {
            1 => "method_call",
            2 => "method_return",
            3 => "error",
            4 => "signal",
            _ => "invalid",
        }
    }
}

pub mod flags {
    pub const NO_REPLY_EXPECTED: u8 = 0x01;
    pub const NO_AUTO_START: u8 = 0x02;
    pub const ASYNC: u8 = 0x40;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum HeaderFieldName {
    Invalid = 0,
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

impl HeaderFieldName {
    fn from_code(code: u8) -> Option<Self> {
        use self::HeaderFieldName::*;
        Some(match code {
            1 => Path,
            2 => Interface,
            3 => Member,
            4 => ErrorName,
            5 => ReplySerial,
            6 => Destination,
            7 => Sender,
            8 => Signature,
            9 => UnixFds,
            _ => return None,
        })
    }

    fn signature(self) -> &'static str {
        use self::HeaderFieldName::*;
        match self {
            Path => "o",
            Signature => "g",
            ReplySerial | UnixFds => "u",
            _ => "s",
        }
    }
}

struct HeaderField<'a>(HeaderFieldName, &'a Value);

impl<'a> Marshal for HeaderField<'a> {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        pad_to_multiple(buf, 8);
        let start_len = buf.len();
        let code = self.0 as u8;
        code.dbus_encode(buf);
        Signature::from(self.0.signature()).dbus_encode(buf);
        self.1.dbus_encode(buf);
        buf.len() - start_len
    }
    fn get_type(&self) -> String {
        "(yv)".to_string()
    }
}

const LEN_OFFSET: usize = 4;
const FIXED_HEADER_LENGTH: usize = 16;

/// A D-Bus message. Header field values are stored unwrapped from their variants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub big_endian: bool,
    pub message_type: MessageType,
    pub flags: u8,
    pub version: u8,
    pub serial: u32,
    pub headers: BTreeMap<HeaderFieldName, Value>,
    pub body: Vec<Value>,
}

fn new_message(message_type: MessageType) -> Message {
    Message { message_type, version: PROTOCOL_VERSION, ..Default::default() }
}

/// Create a Message for a D-Bus method call. Once a Message object is created, arguments
/// can be added to the object with Message.add_arg
pub fn create_method_call(dest: Option<&str>, path: &str, iface: Option<&str>, method: &str) -> Message {
    let mut msg = new_message(MESSAGE_TYPE_METHOD_CALL);
    msg.set_header(HeaderFieldName::Path, Value::ObjectPath(ObjectPath::from(path)));
    msg.set_header(HeaderFieldName::Member, Value::from(method));
    if let Some(dest) = dest {
        msg.set_header(HeaderFieldName::Destination, Value::from(dest));
    }
    if let Some(iface) = iface {
        msg.set_header(HeaderFieldName::Interface, Value::from(iface));
    }
    msg
}

/// Create a Message for a D-Bus method return. Once created, return values can be added to the
/// object with Message.add_arg
pub fn create_method_return(reply_serial: u32) -> Message {
    let mut msg = new_message(MESSAGE_TYPE_METHOD_RETURN);
    msg.set_header(HeaderFieldName::ReplySerial, Value::UInt32(reply_serial));
    msg
}

/// Create an error reply. A non-empty `message` becomes the single string argument.
pub fn create_error(error_name: &str, reply_serial: u32, message: &str) -> Message {
    let mut msg = new_message(MESSAGE_TYPE_ERROR);
    msg.set_header(HeaderFieldName::ErrorName, Value::from(error_name));
    msg.set_header(HeaderFieldName::ReplySerial, Value::UInt32(reply_serial));
    if !message.is_empty() {
        msg.body.push(Value::from(message));
    }
    msg
}

pub fn create_signal(path: &str, iface: &str, member: &str) -> Message {
    let mut msg = new_message(MESSAGE_TYPE_SIGNAL);
    msg.set_header(HeaderFieldName::Path, Value::ObjectPath(ObjectPath::from(path)));
    msg.set_header(HeaderFieldName::Interface, Value::from(iface));
    msg.set_header(HeaderFieldName::Member, Value::from(member));
    msg
}

impl Message {
    /// Add the given argument to the Message. Accepts anything that converts into a `Value`.
    ///
    /// Note that these calls can be chained together to add multiple arguments, see the example
    ///
    /// # Examples
    /// ```
    /// dbus_endpoint::message::create_method_call(Some("foo"), "/bar", Some("baz"), "bloop")
    ///     .add_arg(1i32)
    ///     .add_arg("string");
    /// ```
    pub fn add_arg<V: Into<Value>>(mut self, arg: V) -> Message {
        self.body.push(arg.into());
        self
    }

    pub fn add_flags(mut self, flags: u8) -> Message {
        self.flags |= flags;
        self
    }

    pub fn set_header(&mut self, name: HeaderFieldName, value: Value) {
        self.headers.insert(name, value);
    }

    pub fn set_destination(&mut self, dest: Option<&str>) {
        match dest {
            Some(d) => self.set_header(HeaderFieldName::Destination, Value::from(d)),
            None => {
                self.headers.remove(&HeaderFieldName::Destination);
            }
        }
    }

    pub fn set_sender(&mut self, sender: &str) {
        self.set_header(HeaderFieldName::Sender, Value::from(sender));
    }

    pub fn decode_header_field<T: TryFrom<Value>>(&self, name: HeaderFieldName) -> Option<T> {
        self.headers.get(&name).and_then(|v| T::try_from(v.clone()).ok())
    }

    fn header_str(&self, name: HeaderFieldName) -> Option<&str> {
        self.headers.get(&name).and_then(Value::as_str)
    }

    pub fn path(&self) -> Option<&str> {
        self.header_str(HeaderFieldName::Path)
    }

    pub fn interface(&self) -> Option<&str> {
        self.header_str(HeaderFieldName::Interface)
    }

    pub fn member(&self) -> Option<&str> {
        self.header_str(HeaderFieldName::Member)
    }

    pub fn error_name(&self) -> Option<&str> {
        self.header_str(HeaderFieldName::ErrorName)
    }

    pub fn destination(&self) -> Option<&str> {
        self.header_str(HeaderFieldName::Destination)
    }

    pub fn sender(&self) -> Option<&str> {
        self.header_str(HeaderFieldName::Sender)
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.decode_header_field(HeaderFieldName::ReplySerial)
    }

    pub fn unix_fds(&self) -> Option<u32> {
        self.decode_header_field(HeaderFieldName::UnixFds)
    }

    /// Signature of the body as declared in the header; empty when absent.
    pub fn signature(&self) -> &str {
        self.header_str(HeaderFieldName::Signature).unwrap_or("")
    }

    pub fn get_body(&self) -> &[Value] {
        &self.body
    }

    pub fn expects_reply(&self) -> bool {
        self.message_type == MESSAGE_TYPE_METHOD_CALL && self.flags & flags::NO_REPLY_EXPECTED == 0
    }

    /// First string argument of an Error message, if any.
    pub fn error_message(&self) -> String {
        self.body.first().and_then(Value::as_str).unwrap_or("").to_owned()
    }

    /// Checks the required header fields for the message type, the syntax of every name
    /// and that each variant in the body matches its payload.
    pub fn validate(&self) -> Result<()> {
        let require = |name: HeaderFieldName| {
            if self.headers.contains_key(&name) {
                Ok(())
            } else {
                Err(Error::InvalidMessage(format!(
                    "{} is missing the {:?} header field", self.message_type.name(), name)))
            }
        };
        match self.message_type {
            MESSAGE_TYPE_METHOD_CALL => {
                require(HeaderFieldName::Path)?;
                require(HeaderFieldName::Member)?;
            }
            MESSAGE_TYPE_SIGNAL => {
                require(HeaderFieldName::Path)?;
                require(HeaderFieldName::Interface)?;
                require(HeaderFieldName::Member)?;
            }
            MESSAGE_TYPE_ERROR => {
                require(HeaderFieldName::ErrorName)?;
                require(HeaderFieldName::ReplySerial)?;
            }
            MESSAGE_TYPE_METHOD_RETURN => require(HeaderFieldName::ReplySerial)?,
            _ => return Err(Error::InvalidMessage("invalid message type".into())),
        }
        let check = |ok: bool, what: &str, v: &str| {
            if ok {
                Ok(())
            } else {
                Err(Error::InvalidMessage(format!("invalid {} {:?}", what, v)))
            }
        };
        if let Some(p) = self.path() {
            check(valid_object_path(p), "object path", p)?;
        }
        if let Some(i) = self.interface() {
            check(valid_interface_name(i), "interface name", i)?;
        }
        if let Some(m) = self.member() {
            check(valid_member_name(m), "member name", m)?;
        }
        if let Some(e) = self.error_name() {
            check(valid_interface_name(e), "error name", e)?;
        }
        if let Some(d) = self.destination() {
            check(valid_bus_name(d), "bus name", d)?;
        }
        self.body.iter().try_for_each(check_variants)
    }

    /// Serializes the message, little-endian, computing the signature header from the body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let body = {
            let mut buf = Vec::new();
            for v in &self.body {
                v.dbus_encode(&mut buf);
            }
            buf
        };
        let sig = body_signature(&self.body);

        let mut msg = Vec::with_capacity(FIXED_HEADER_LENGTH + 64 + body.len());
        b'l'.dbus_encode(&mut msg);
        self.message_type.0.dbus_encode(&mut msg);
        self.flags.dbus_encode(&mut msg);
        PROTOCOL_VERSION.dbus_encode(&mut msg);
        (body.len() as u32).dbus_encode(&mut msg);
        self.serial.dbus_encode(&mut msg);

        let sig_value = Value::Signature(Signature(sig.clone()));
        let mut fields: Vec<HeaderField> = self
            .headers
            .iter()
            .filter(|(name, _)| **name != HeaderFieldName::Signature)
            .map(|(name, v)| HeaderField(*name, v))
            .collect();
        if !sig.is_empty() {
            fields.push(HeaderField(HeaderFieldName::Signature, &sig_value));
        }
        fields.dbus_encode(&mut msg);
        pad_to_multiple(&mut msg, 8);
        msg.extend_from_slice(&body);

        if msg.len() > MAX_MESSAGE_LENGTH {
            return Err(Error::InvalidMessage(format!("message too long: {} bytes", msg.len())));
        }
        Ok(msg)
    }

    /// Parses one complete message.
    pub fn decode(buf: &[u8]) -> Result<Message> {
        if buf.len() < FIXED_HEADER_LENGTH {
            return Err(Error::InvalidMessage("message shorter than its fixed header".into()));
        }
        let big_endian = match buf[0] {
            b'l' => false,
            b'B' => true,
            other => return Err(Error::InvalidMessage(format!("bad endianness marker {:#x}", other))),
        };
        let mut d = Demarshaller::new(buf, 0, big_endian);
        let fixed = d.demarshal_all("yyyyuua(yv)")?;
        let mut msg = Message { big_endian, ..Default::default() };
        let mut body_len = 0;
        for (i, v) in fixed.into_iter().enumerate() {
            match (i, v) {
                (1, Value::Byte(t)) => msg.message_type = MessageType(t),
                (2, Value::Byte(f)) => msg.flags = f,
                (3, Value::Byte(ver)) => msg.version = ver,
                (4, Value::UInt32(len)) => body_len = len as usize,
                (5, Value::UInt32(serial)) => msg.serial = serial,
                (6, Value::Array(fields)) => {
                    for f in fields.objects {
                        let (code, value) = header_field_parts(f)?;
                        // Unknown fields are ignored
                        if let Some(name) = HeaderFieldName::from_code(code) {
                            msg.headers.insert(name, value);
                        }
                    }
                }
                _ => (),
            }
        }
        if msg.version != PROTOCOL_VERSION {
            return Err(Error::InvalidMessage(format!("unsupported protocol version {}", msg.version)));
        }
        if msg.serial == 0 {
            return Err(Error::InvalidMessage("serial must not be zero".into()));
        }

        let body_start = (d.offset() + 7) & !7;
        if buf.len() < body_start + body_len {
            return Err(Error::InvalidMessage("truncated message body".into()));
        }
        let sig = msg.signature().to_owned();
        let mut body = Demarshaller::new(&buf[body_start..body_start + body_len], 0, big_endian);
        msg.body = body.demarshal_all(&sig)?;
        if body.remaining() != 0 {
            return Err(Error::InvalidMessage("body longer than its signature".into()));
        }
        Ok(msg)
    }
}

fn header_field_parts(field: Value) -> Result<(u8, Value)> {
    if let Value::Struct(Struct { objects }) = field {
        let mut it = objects.into_iter();
        if let (Some(Value::Byte(code)), Some(Value::Variant(Variant { object, .. }))) = (it.next(), it.next()) {
            return Ok((code, *object));
        }
    }
    Err(Error::InvalidMessage("malformed header field".into()))
}

pub fn get_length(msg: &[u8], big_endian: bool) -> u32 {
    let mut lenbuf = [0; 4];
    lenbuf.copy_from_slice(&msg[LEN_OFFSET..LEN_OFFSET + 4]);
    if big_endian { u32::from_be_bytes(lenbuf) } else { u32::from_le_bytes(lenbuf) }
}

/// Blocks until one complete message has been read from `reader`.
pub fn read_message<R: Read + ?Sized>(reader: &mut R) -> Result<Message> {
    let mut buf = vec![0; FIXED_HEADER_LENGTH];
    reader.read_exact(&mut buf)?;
    let big_endian = buf[0] == b'B';
    let body_len = get_length(&buf, big_endian) as usize;
    let mut fields = [0; 4];
    fields.copy_from_slice(&buf[12..16]);
    let fields_len = if big_endian { u32::from_be_bytes(fields) } else { u32::from_le_bytes(fields) } as usize;
    let header_len = (FIXED_HEADER_LENGTH + fields_len + 7) & !7;
    let total = header_len + body_len;
    // the rest of the frame cannot be skipped safely, so this is a stream error
    if total > MAX_MESSAGE_LENGTH {
        return Err(io::Error::new(io::ErrorKind::InvalidData, format!("message too long: {} bytes", total)).into());
    }
    buf.resize(total, 0);
    reader.read_exact(&mut buf[FIXED_HEADER_LENGTH..])?;
    Message::decode(&buf)
}

fn valid_element(s: &str, allow_digit_first: bool, allow_hyphen: bool) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || (allow_hyphen && c == '-') => (),
        Some(c) if allow_digit_first && c.is_ascii_digit() => (),
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || (allow_hyphen && c == '-'))
}

pub fn valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return false;
    }
    path[1..].split('/').all(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

pub fn valid_interface_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LENGTH {
        return false;
    }
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() >= 2 && parts.iter().all(|p| valid_element(p, false, false))
}

pub fn valid_member_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LENGTH && valid_element(name, false, false)
}

/// Unique (`:1.42`) or well-known (`org.foo.Bar`) bus name.
pub fn valid_bus_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LENGTH {
        return false;
    }
    if let Some(unique) = name.strip_prefix(':') {
        let parts: Vec<&str> = unique.split('.').collect();
        return parts.len() >= 2 && parts.iter().all(|p| valid_element(p, true, true));
    }
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() >= 2 && parts.iter().all(|p| valid_element(p, false, true))
}

/// A variant's signature must describe its payload, or the frame cannot be decoded.
fn check_variants(v: &Value) -> Result<()> {
    match v {
        Value::Variant(var) => {
            let actual = var.object.get_type();
            if actual != var.signature.as_str() {
                return Err(Error::TypeConversion(format!(
                    "variant signature {} does not match its {} payload", var.signature.as_str(), actual)));
            }
            check_variants(&var.object)
        }
        Value::Array(a) => a.objects.iter().try_for_each(check_variants),
        Value::Dictionary(d) => d.entries.iter().try_for_each(|(k, v)| {
            check_variants(k)?;
            check_variants(v)
        }),
        Value::Struct(s) => s.objects.iter().try_for_each(check_variants),
        Value::Tuple(values) => values.iter().try_for_each(check_variants),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::Array;

    #[test]
    fn test_header() {
        let mut msg = create_method_call(None, "/bar", Some("org.baz"), "Floob");
        msg.serial = 12;
        let buf = msg.encode().unwrap();
        assert_eq!(&buf[..4], &[b'l', 1, 0, 1]);
        assert_eq!(get_length(&buf, false), 0);
        assert_eq!(&buf[8..12], &[12, 0, 0, 0]);
        assert_eq!(buf.len() % 8, 0);
    }

    #[test]
    fn test_msg() {
        let mut msg = create_method_call(Some("org.foo"), "/bar", Some("org.baz"), "Floob")
            .add_arg(1i32)
            .add_arg("two")
            .add_arg(Value::Array(Array::new(vec![Value::from(1u64)], "t")))
            .add_flags(flags::NO_AUTO_START);
        msg.serial = 7;
        let buf = msg.encode().unwrap();
        let decoded = read_message(&mut &buf[..]).unwrap();
        assert_eq!(decoded.serial, 7);
        assert_eq!(decoded.message_type, MESSAGE_TYPE_METHOD_CALL);
        assert_eq!(decoded.flags, flags::NO_AUTO_START);
        assert_eq!(decoded.path(), Some("/bar"));
        assert_eq!(decoded.interface(), Some("org.baz"));
        assert_eq!(decoded.member(), Some("Floob"));
        assert_eq!(decoded.destination(), Some("org.foo"));
        assert_eq!(decoded.signature(), "isat");
        assert_eq!(decoded.body, msg.body);
    }

    #[test]
    fn test_error_and_return() {
        let mut err = create_error("org.foo.Error.Nope", 3, "went wrong");
        err.serial = 4;
        let decoded = Message::decode(&err.encode().unwrap()).unwrap();
        assert_eq!(decoded.message_type, MESSAGE_TYPE_ERROR);
        assert_eq!(decoded.reply_serial(), Some(3));
        assert_eq!(decoded.error_name(), Some("org.foo.Error.Nope"));
        assert_eq!(decoded.error_message(), "went wrong");

        let mut ret = create_method_return(9);
        ret.serial = 10;
        let decoded = Message::decode(&ret.encode().unwrap()).unwrap();
        assert_eq!(decoded.reply_serial(), Some(9));
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_validation() {
        assert!(create_signal("/a/b", "org.foo", "Changed").validate().is_ok());
        assert!(create_signal("a/b", "org.foo", "Changed").validate().is_err());
        assert!(create_signal("/a/b", "foo", "Changed").validate().is_err());
        assert!(create_signal("/a/b", "org.foo", "1Changed").validate().is_err());
        assert!(valid_object_path("/"));
        assert!(!valid_object_path("/a//b"));
        assert!(!valid_object_path("/a/"));
        assert!(valid_bus_name(":1.42"));
        assert!(valid_bus_name("org.freedesktop.DBus"));
        assert!(!valid_bus_name("org"));
        assert!(!valid_interface_name(&format!("a.{}", "b".repeat(300))));
    }

    #[test]
    fn test_mistagged_variant_is_not_encoded() {
        let mut msg = create_signal("/a", "org.foo", "Bar")
            .add_arg(Value::Variant(Variant::new(Value::UInt32(3), "t")));
        msg.serial = 1;
        assert!(matches!(msg.encode(), Err(Error::TypeConversion(_))));

        let nested = Value::Array(Array::new(vec![Value::Variant(Variant::new(Value::from("x"), "u"))], "v"));
        let mut msg = create_signal("/a", "org.foo", "Bar").add_arg(nested);
        msg.serial = 2;
        assert!(msg.validate().is_err());

        let mut msg = create_signal("/a", "org.foo", "Bar")
            .add_arg(Value::Variant(Variant::new(Value::UInt64(3), "t")));
        msg.serial = 3;
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.body, msg.body);
    }

    #[test]
    fn test_rejects_zero_serial() {
        let buf = create_signal("/a", "org.foo", "Bar").encode().unwrap();
        assert!(Message::decode(&buf).is_err());
    }
}
