//! Values exchanged with the marshaller.
//!
//! A [`Value`] is either a wire value (everything the D-Bus type grammar can
//! express) or one of a handful of local-only shapes that the conversion layer
//! in `convert` turns into wire values before a message is built: tuples,
//! enum constants, object handles and custom-serializable values.

use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::signature::TypeDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(pub String);

impl ObjectPath {
    pub fn new<S: Into<String>>(s: S) -> Self {
        ObjectPath(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'a> From<&'a str> for ObjectPath {
    fn from(s: &'a str) -> Self {
        ObjectPath(s.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(pub String);

impl Signature {
    pub fn new<S: Into<String>>(s: S) -> Self {
        Signature(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'a> From<&'a str> for Signature {
    fn from(s: &'a str) -> Self {
        Signature(s.to_owned())
    }
}

/// A self-describing value: the wire signature travels with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub signature: Signature,
    pub object: Box<Value>,
}

impl Variant {
    pub fn new(object: Value, signature: &str) -> Self {
        Variant { signature: Signature::from(signature), object: Box::new(object) }
    }

    /// Wraps `object`, taking the signature from the value itself.
    pub fn infer(object: Value) -> Self {
        use crate::marshal::Marshal;
        let signature = Signature(object.get_type());
        Variant { signature, object: Box::new(object) }
    }
}

/// Ordered fixed-arity composite; equality is position-wise.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Struct {
    pub objects: Vec<Value>,
}

impl Struct {
    pub fn new(objects: Vec<Value>) -> Self {
        Struct { objects }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub element: Signature,
    pub objects: Vec<Value>,
}

impl Array {
    pub fn new(objects: Vec<Value>, element: &str) -> Self {
        Array { element: Signature::from(element), objects }
    }

    /// Builds an array whose element signature is taken from the first item.
    /// Empty arrays need an explicit signature, see [`Array::new`].
    pub fn from_values(objects: Vec<Value>) -> Result<Self> {
        use crate::marshal::Marshal;
        let element = match objects.first() {
            Some(v) => v.get_type(),
            None => return Err(Error::TypeConversion("cannot infer element type of an empty array".into())),
        };
        Ok(Array { element: Signature(element), objects })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dictionary {
    pub key: Signature,
    pub value: Signature,
    pub entries: Vec<(Value, Value)>,
}

impl Dictionary {
    pub fn new(entries: Vec<(Value, Value)>, key: &str, value: &str) -> Self {
        Dictionary { key: Signature::from(key), value: Signature::from(value), entries }
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// A named constant of an enum-like type; travels as its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumValue {
    pub type_name: String,
    pub constant: String,
}

/// Handle to an object living on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteObject {
    pub bus_name: Option<String>,
    pub path: ObjectPath,
    pub interface: Option<String>,
    pub autostart: bool,
}

impl RemoteObject {
    pub fn new(bus_name: Option<&str>, path: &str, interface: Option<&str>) -> Self {
        RemoteObject {
            bus_name: bus_name.map(str::to_owned),
            path: ObjectPath::from(path),
            interface: interface.map(str::to_owned),
            autostart: true,
        }
    }
}

/// A value that knows how to flatten itself into wire components.
///
/// When passed as a parameter the components are spliced into the argument
/// list in its place, so a single custom value may become several wire
/// arguments.
pub trait DBusSerializable: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &str;
    fn serialize(&self) -> Vec<Value>;
    fn descriptors(&self) -> Vec<TypeDescriptor>;
}

#[derive(Clone)]
pub struct CustomValue(pub Arc<dyn DBusSerializable>);

impl fmt::Debug for CustomValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq for CustomValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.type_name() == other.0.type_name() && self.0.serialize() == other.0.serialize()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    UnixFd(u32),
    Array(Array),
    Dictionary(Dictionary),
    Struct(Struct),
    Variant(Variant),

    /// Multi-value return; never wrapped on the wire.
    Tuple(Vec<Value>),
    Enum(EnumValue),
    Remote(RemoteObject),
    /// Reference to an object exported on the local connection.
    Exported(ObjectPath),
    Custom(CustomValue),
}

impl Value {
    /// True for values that may be used as dictionary keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Value::Array(_)
                | Value::Dictionary(_)
                | Value::Struct(_)
                | Value::Variant(_)
                | Value::Tuple(_)
                | Value::Custom(_)
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            Value::ObjectPath(p) => Some(&p.0),
            Value::Signature(s) => Some(&s.0),
            _ => None,
        }
    }

    /// Short name of the shape, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Boolean(_) => "boolean",
            Value::Int16(_) => "int16",
            Value::UInt16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::UInt32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::ObjectPath(_) => "object path",
            Value::Signature(_) => "signature",
            Value::UnixFd(_) => "unix fd",
            Value::Array(_) => "array",
            Value::Dictionary(_) => "dictionary",
            Value::Struct(_) => "struct",
            Value::Variant(_) => "variant",
            Value::Tuple(_) => "tuple",
            Value::Enum(_) => "enum",
            Value::Remote(_) => "remote object",
            Value::Exported(_) => "exported object",
            Value::Custom(_) => "custom value",
        }
    }
}

macro_rules! value_conversions {
    ($($t:ty => $variant:ident),* $(,)*) => {
        $(
            impl From<$t> for Value {
                fn from(x: $t) -> Self {
                    Value::$variant(x)
                }
            }

            impl TryFrom<Value> for $t {
                type Error = Error;

                fn try_from(v: Value) -> Result<$t> {
                    match v {
                        Value::$variant(x) => Ok(x),
                        Value::Variant(var) => <$t>::try_from(*var.object),
                        other => Err(Error::Deserialization(format!(
                            "expected {}, got {}", stringify!($variant), other.kind()))),
                    }
                }
            }
        )*
    }
}

value_conversions! {
    u8 => Byte,
    bool => Boolean,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Float,
    f64 => Double,
    String => String,
    ObjectPath => ObjectPath,
    Signature => Signature,
    Struct => Struct,
    Array => Array,
    Dictionary => Dictionary,
    RemoteObject => Remote,
}

impl From<Variant> for Value {
    fn from(v: Variant) -> Self {
        Value::Variant(v)
    }
}

impl TryFrom<Value> for Variant {
    type Error = Error;

    fn try_from(v: Value) -> Result<Variant> {
        match v {
            Value::Variant(x) => Ok(x),
            other => Err(Error::Deserialization(format!("expected Variant, got {}", other.kind()))),
        }
    }
}

impl<'a> From<&'a str> for Value {
    fn from(s: &'a str) -> Self {
        Value::String(s.to_owned())
    }
}
