use crate::config::float_support;
use crate::demarshal::get_alignment;
use crate::types::{Array, Dictionary, ObjectPath, Signature, Struct, Value, Variant};

pub trait Marshal {
    /// Encodes itself into buf, and returns the number of bytes written excluding leading padding
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize;

    /// Returns the D-Bus type signature for this object
    fn get_type(&self) -> String;
}

pub fn pad_to_multiple(buf: &mut Vec<u8>, len: usize) {
    let pad = (len - (buf.len() % len)) % len;
    buf.resize(buf.len() + pad, 0);
}

fn marshal_fixed(bytes: &[u8], buf: &mut Vec<u8>) -> usize {
    pad_to_multiple(buf, bytes.len());
    buf.extend_from_slice(bytes);
    bytes.len()
}

fn marshal_string(x: &str, buf: &mut Vec<u8>) -> usize {
    let len = x.len() as u32;
    let total_len = len.dbus_encode(buf);
    buf.extend_from_slice(x.as_bytes());
    buf.push(0);
    total_len + x.len() + 1
}

fn marshal_signature(x: &str, buf: &mut Vec<u8>) -> usize {
    let len = x.len() as u8;
    let total_len = len.dbus_encode(buf);
    buf.extend_from_slice(x.as_bytes());
    buf.push(0);
    total_len + x.len() + 1
}

/// Writes an array: the length word, padding to the element alignment, then the elements.
/// The length excludes the padding after the length word.
fn marshal_array<F>(element_sig: &str, buf: &mut Vec<u8>, mut encode_elements: F) -> usize
        where F: FnMut(&mut Vec<u8>) {
    // Encode a length of 0 as a place-holder since we don't know the real length yet
    0u32.dbus_encode(buf);
    let len_idx = buf.len() - 4;
    let align = element_sig.chars().next().map(get_alignment).unwrap_or(1);
    pad_to_multiple(buf, align);
    let start_len = buf.len();
    encode_elements(buf);
    let array_len = (buf.len() - start_len) as u32;

    // Update the encoded length with the real value
    buf[len_idx..len_idx + 4].copy_from_slice(&array_len.to_le_bytes());
    buf.len() - len_idx
}

macro_rules! marshal_number {
    ($($t:ty => $code:expr),* $(,)*) => {
        $(
            impl Marshal for $t {
                fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
                    marshal_fixed(&self.to_le_bytes(), buf)
                }
                fn get_type(&self) -> String {
                    $code.to_string()
                }
            }
        )*
    }
}

marshal_number! {
    i16 => "n",
    u16 => "q",
    i32 => "i",
    u32 => "u",
    i64 => "x",
    u64 => "t",
    f64 => "d",
}

impl Marshal for u8 {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        buf.push(*self);
        1
    }
    fn get_type(&self) -> String {
        "y".to_string()
    }
}

impl Marshal for bool {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        (*self as u32).dbus_encode(buf)
    }
    fn get_type(&self) -> String {
        "b".to_string()
    }
}

// Without native float support a float travels as a double
impl Marshal for f32 {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        if float_support() {
            marshal_fixed(&self.to_le_bytes(), buf)
        } else {
            (*self as f64).dbus_encode(buf)
        }
    }
    fn get_type(&self) -> String {
        if float_support() { "f" } else { "d" }.to_string()
    }
}

impl<'a> Marshal for &'a str {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        marshal_string(self, buf)
    }
    fn get_type(&self) -> String {
        "s".to_string()
    }
}

impl Marshal for String {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        marshal_string(self, buf)
    }
    fn get_type(&self) -> String {
        "s".to_string()
    }
}

impl Marshal for ObjectPath {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        marshal_string(&self.0, buf)
    }
    fn get_type(&self) -> String {
        "o".to_string()
    }
}

impl Marshal for Signature {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        marshal_signature(&self.0, buf)
    }
    fn get_type(&self) -> String {
        "g".to_string()
    }
}

impl Marshal for Struct {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        pad_to_multiple(buf, 8);
        let start_len = buf.len();
        for i in &self.objects {
            i.dbus_encode(buf);
        }
        buf.len() - start_len
    }

    fn get_type(&self) -> String {
        let inner: String = self.objects.iter().map(Marshal::get_type).collect();
        format!("({})", inner)
    }
}

impl<T: Marshal> Marshal for Vec<T> {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        let sig = self.first().map(Marshal::get_type).unwrap_or_default();
        marshal_array(&sig, buf, |buf| {
            for x in self {
                x.dbus_encode(buf);
            }
        })
    }
    fn get_type(&self) -> String {
        // An empty Vec has no element to look at; callers needing `a?` for an
        // empty array use types::Array with an explicit element signature.
        "a".to_string() + &self.first().map(Marshal::get_type).unwrap_or_else(|| "v".to_string())
    }
}

impl Marshal for Array {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        marshal_array(&self.element.0, buf, |buf| {
            for x in &self.objects {
                x.dbus_encode(buf);
            }
        })
    }
    fn get_type(&self) -> String {
        format!("a{}", self.element.0)
    }
}

impl Marshal for Dictionary {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        marshal_array("{", buf, |buf| {
            for (key, value) in &self.entries {
                pad_to_multiple(buf, 8);
                key.dbus_encode(buf);
                value.dbus_encode(buf);
            }
        })
    }
    fn get_type(&self) -> String {
        format!("a{{{}{}}}", self.key.0, self.value.0)
    }
}

impl Marshal for Variant {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        let len = self.signature.dbus_encode(buf);
        // We want to include any padding from the variant payload, so we can't just add the return
        // value of the second dbus_encode
        let old_len = buf.len();
        self.object.dbus_encode(buf);
        len + buf.len() - old_len
    }
    fn get_type(&self) -> String {
        "v".to_string()
    }
}

impl Marshal for Value {
    fn dbus_encode(&self, buf: &mut Vec<u8>) -> usize {
        match self {
            Value::Byte(x) => x.dbus_encode(buf),
            Value::Boolean(x) => x.dbus_encode(buf),
            Value::Int16(x) => x.dbus_encode(buf),
            Value::UInt16(x) => x.dbus_encode(buf),
            Value::Int32(x) => x.dbus_encode(buf),
            Value::UInt32(x) | Value::UnixFd(x) => x.dbus_encode(buf),
            Value::Int64(x) => x.dbus_encode(buf),
            Value::UInt64(x) => x.dbus_encode(buf),
            Value::Float(x) => x.dbus_encode(buf),
            Value::Double(x) => x.dbus_encode(buf),
            Value::String(x) => x.dbus_encode(buf),
            Value::ObjectPath(x) | Value::Exported(x) => x.dbus_encode(buf),
            Value::Signature(x) => x.dbus_encode(buf),
            Value::Array(x) => x.dbus_encode(buf),
            Value::Dictionary(x) => x.dbus_encode(buf),
            Value::Struct(x) => x.dbus_encode(buf),
            Value::Variant(x) => x.dbus_encode(buf),
            Value::Enum(x) => x.constant.dbus_encode(buf),
            Value::Remote(x) => x.path.dbus_encode(buf),
            // Splice components, never wrapped
            Value::Tuple(values) => {
                let start_len = buf.len();
                for v in values {
                    v.dbus_encode(buf);
                }
                buf.len() - start_len
            }
            Value::Custom(c) => {
                let start_len = buf.len();
                for v in c.0.serialize() {
                    v.dbus_encode(buf);
                }
                buf.len() - start_len
            }
        }
    }

    fn get_type(&self) -> String {
        match self {
            Value::Byte(_) => "y".to_string(),
            Value::Boolean(_) => "b".to_string(),
            Value::Int16(_) => "n".to_string(),
            Value::UInt16(_) => "q".to_string(),
            Value::Int32(_) => "i".to_string(),
            Value::UInt32(_) => "u".to_string(),
            Value::Int64(_) => "x".to_string(),
            Value::UInt64(_) => "t".to_string(),
            Value::Float(x) => x.get_type(),
            Value::Double(_) => "d".to_string(),
            Value::String(_) | Value::Enum(_) => "s".to_string(),
            Value::ObjectPath(_) | Value::Exported(_) | Value::Remote(_) => "o".to_string(),
            Value::Signature(_) => "g".to_string(),
            Value::UnixFd(_) => "h".to_string(),
            Value::Array(x) => x.get_type(),
            Value::Dictionary(x) => x.get_type(),
            Value::Struct(x) => x.get_type(),
            Value::Variant(_) => "v".to_string(),
            Value::Tuple(values) => values.iter().map(Marshal::get_type).collect(),
            Value::Custom(c) => c.0.serialize().iter().map(Marshal::get_type).collect(),
        }
    }
}

/// Encodes a message body: values back to back, aligned relative to the body start.
pub fn marshal_body(values: &[Value]) -> Vec<u8> {
    let mut buf = Vec::new();
    for v in values {
        v.dbus_encode(&mut buf);
    }
    buf
}

/// Concatenated signature of a body.
pub fn body_signature(values: &[Value]) -> String {
    values.iter().map(Marshal::get_type).collect()
}

#[test]
fn test_ints() {
    let x: u32 = 1;
    let x_bytes = vec![0, 0, 0, 0, 1, 0, 0, 0];
    // Start with a non-empty buffer to test padding
    let mut buf = vec![0];
    let len = x.dbus_encode(&mut buf);
    assert_eq!(len, 4);
    assert_eq!(buf, x_bytes);
    assert_eq!("u", x.get_type());
}

#[test]
fn test_string() {
    let x = "abc123";
    let x_bytes = vec![6, 0, 0, 0, b'a', b'b', b'c', b'1', b'2', b'3', 0];
    let mut x_buf = Vec::new();
    let len = x.dbus_encode(&mut x_buf);
    assert_eq!(len, x_bytes.len());
    assert_eq!(x_buf, x_bytes);
}

#[test]
fn test_array() {
    let empty_array: Vec<u8> = Vec::new();
    let mut bytes = vec![0, 0, 0, 0];
    let mut buf = Vec::new();
    let len = empty_array.dbus_encode(&mut buf);
    assert_eq!(buf, bytes);
    assert_eq!(len, buf.len());

    let array: Vec<u32> = vec![1, 2, 3];
    bytes = vec![12, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0];
    buf = Vec::new();
    array.dbus_encode(&mut buf);
    assert_eq!(buf, bytes);
}

#[test]
fn test_array_padding_excluded_from_length() {
    // Array of 8-byte aligned structs: 4 bytes of padding follow the length word
    let arr = Array::new(vec![Value::Struct(Struct::new(vec![Value::from(7u64)]))], "(t)");
    let mut buf = Vec::new();
    let len = arr.dbus_encode(&mut buf);
    assert_eq!(len, 16);
    assert_eq!(&buf[0..4], &[8, 0, 0, 0]);
    assert_eq!(&buf[4..8], &[0, 0, 0, 0]);
    assert_eq!(buf[8], 7);
    assert_eq!(arr.get_type(), "a(t)");
}

#[test]
fn test_dictionary() {
    let d = Dictionary::new(vec![(Value::from("k"), Value::from(1u32))], "s", "u");
    let mut buf = Vec::new();
    d.dbus_encode(&mut buf);
    assert_eq!(d.get_type(), "a{su}");
    // length, pad to 8, "k" (4+1+1), pad to 4, u32
    assert_eq!(buf, vec![12, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, b'k', 0, 0, 0, 1, 0, 0, 0]);
}

#[test]
fn test_variant() {
    let v = Variant::new(Value::UInt32(42), "u");
    assert_eq!(v.get_type(), "v");
    let v_bytes = vec![1, b'u', 0, 0, 42, 0, 0, 0];

    let mut buf = Vec::new();
    let len = v.dbus_encode(&mut buf);
    assert_eq!(len, 8);
    assert_eq!(buf, v_bytes);
}

#[test]
fn test_signature_type_code() {
    assert_eq!(Signature::from("a{sv}").get_type(), "g");
    let s = Value::Struct(Struct::new(vec![Value::from("a"), Value::from(1u32)]));
    assert_eq!(s.get_type(), "(su)");
    assert_eq!(Value::Tuple(vec![Value::from(1i32), Value::from("x")]).get_type(), "is");
}
