//! Type descriptors and the signature grammar.
//!
//! `encode` turns a [`TypeDescriptor`] into its wire signature and `parse`
//! goes the other way. A [`SignatureCache`] memoizes both; one is owned by
//! every connection and handed by reference to the conversion layer and the
//! proxy.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::float_support;
use crate::error::{Error, Result};
use crate::types::Value;

pub const MAX_SIGNATURE_LENGTH: usize = 255;
pub const MAX_ARRAY_DEPTH: usize = 32;
pub const MAX_STRUCT_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Array(Box<TypeDescriptor>),
    Map(Box<TypeDescriptor>, Box<TypeDescriptor>),
    Struct(Arc<StructType>),
    Variant,
    /// Free type variable: any value, carried as a variant.
    Any,
    /// Multi-value return marker, never wrapped on the wire.
    Tuple(Arc<TupleType>),
    /// Enum-like type carried as the constant's name.
    Enum(Arc<EnumType>),
    /// Capability interface: an object path that decodes into a remote handle.
    Interface(Arc<str>),
    Custom(Arc<CustomType>),
}

/// Struct definition with its field order fixed up front.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<(String, TypeDescriptor)>,
}

impl StructType {
    pub fn new(name: &str, fields: Vec<(&str, TypeDescriptor)>) -> Arc<Self> {
        Arc::new(StructType {
            name: name.to_owned(),
            fields: fields.into_iter().map(|(n, t)| (n.to_owned(), t)).collect(),
        })
    }

    /// A struct recovered from a signature; fields are named by position.
    pub fn anonymous(types: Vec<TypeDescriptor>) -> Arc<Self> {
        Arc::new(StructType {
            name: String::new(),
            fields: types.into_iter().enumerate().map(|(i, t)| (i.to_string(), t)).collect(),
        })
    }

    pub fn field_types(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.fields.iter().map(|(_, t)| t)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TupleType {
    pub name: String,
    pub elements: Vec<TypeDescriptor>,
}

impl TupleType {
    pub fn new(name: &str, elements: Vec<TypeDescriptor>) -> Arc<Self> {
        Arc::new(TupleType { name: name.to_owned(), elements })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumType {
    pub name: String,
    pub constants: Vec<String>,
}

impl EnumType {
    pub fn new(name: &str, constants: &[&str]) -> Arc<Self> {
        Arc::new(EnumType {
            name: name.to_owned(),
            constants: constants.iter().map(|c| (*c).to_owned()).collect(),
        })
    }
}

/// A custom-serializable type: its wire form is a run of component values,
/// rebuilt on the way in by `construct`.
#[derive(Debug, Clone)]
pub struct CustomType {
    pub name: String,
    pub components: Vec<TypeDescriptor>,
    pub construct: fn(Vec<Value>) -> Result<Value>,
}

impl PartialEq for CustomType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.components == other.components
    }
}

impl Eq for CustomType {}

impl Hash for CustomType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.components.hash(state);
    }
}

impl TypeDescriptor {
    pub fn array(element: TypeDescriptor) -> Self {
        TypeDescriptor::Array(Box::new(element))
    }

    pub fn map(key: TypeDescriptor, value: TypeDescriptor) -> Self {
        TypeDescriptor::Map(Box::new(key), Box::new(value))
    }

    /// Non-container types, legal as dictionary keys.
    pub fn is_basic(&self) -> bool {
        use self::TypeDescriptor::*;
        matches!(
            self,
            Byte | Boolean
                | Int16
                | UInt16
                | Int32
                | UInt32
                | Int64
                | UInt64
                | Float
                | Double
                | String
                | ObjectPath
                | Signature
                | UnixFd
                | Enum(_)
                | Interface(_)
        )
    }

    /// Structural equivalence on the wire: field names, enum and interface
    /// metadata, and the any/variant distinction are ignored.
    pub fn is_equivalent(&self, other: &TypeDescriptor) -> bool {
        use self::TypeDescriptor::*;
        match (self.normalized(), other.normalized()) {
            (Array(a), Array(b)) => a.is_equivalent(b),
            (Map(ka, va), Map(kb, vb)) => ka.is_equivalent(kb) && va.is_equivalent(vb),
            (Struct(a), Struct(b)) => {
                a.fields.len() == b.fields.len()
                    && a.field_types().zip(b.field_types()).all(|(x, y)| x.is_equivalent(y))
            }
            (a, b) => a == b,
        }
    }

    fn normalized(&self) -> &TypeDescriptor {
        use self::TypeDescriptor::*;
        match self {
            Enum(_) => &String,
            Interface(_) => &ObjectPath,
            Any => &Variant,
            Float if !float_support() => &Double,
            other => other,
        }
    }
}

/// Wire signature of `d`. A top-level tuple or custom type expands to the
/// concatenation of its members.
pub fn encode(d: &TypeDescriptor) -> Result<String> {
    let mut out = String::new();
    match d {
        TypeDescriptor::Tuple(t) => {
            for e in &t.elements {
                encode_into(e, &mut out)?;
            }
        }
        TypeDescriptor::Custom(c) => {
            for e in &c.components {
                encode_into(e, &mut out)?;
            }
        }
        _ => encode_into(d, &mut out)?,
    }
    if out.len() > MAX_SIGNATURE_LENGTH {
        return Err(Error::TypeConversion(format!("signature too long: {} bytes", out.len())));
    }
    Ok(out)
}

/// Concatenated signature of a parameter list.
pub fn encode_all(ds: &[TypeDescriptor]) -> Result<String> {
    let mut out = String::new();
    for d in ds {
        out.push_str(&encode(d)?);
    }
    Ok(out)
}

fn encode_into(d: &TypeDescriptor, out: &mut String) -> Result<()> {
    use self::TypeDescriptor::*;
    match d {
        Byte => out.push('y'),
        Boolean => out.push('b'),
        Int16 => out.push('n'),
        UInt16 => out.push('q'),
        Int32 => out.push('i'),
        UInt32 => out.push('u'),
        Int64 => out.push('x'),
        UInt64 => out.push('t'),
        Float if float_support() => out.push('f'),
        Float | Double => out.push('d'),
        String | Enum(_) => out.push('s'),
        ObjectPath | Interface(_) => out.push('o'),
        Signature => out.push('g'),
        UnixFd => out.push('h'),
        Variant | Any => out.push('v'),
        Array(e) => {
            out.push('a');
            encode_into(e, out)?;
        }
        Map(k, v) => {
            if !k.is_basic() {
                return Err(Error::TypeConversion(format!(
                    "dictionary key must be a basic type, not {:?}", k)));
            }
            out.push_str("a{");
            encode_into(k, out)?;
            encode_into(v, out)?;
            out.push('}');
        }
        Struct(st) => {
            if st.fields.is_empty() {
                return Err(Error::TypeConversion(format!("struct {} has no fields", st.name)));
            }
            out.push('(');
            for t in st.field_types() {
                encode_into(t, out)?;
            }
            out.push(')');
        }
        Tuple(t) => {
            return Err(Error::TypeConversion(format!(
                "tuple {} may only be used as a top-level return type", t.name)))
        }
        Custom(c) => {
            return Err(Error::TypeConversion(format!(
                "custom type {} may only be used as a top-level parameter", c.name)))
        }
    }
    Ok(())
}

struct Parser<'a> {
    sig: &'a str,
    bytes: &'a [u8],
    pos: usize,
    struct_depth: usize,
    array_depth: usize,
}

impl<'a> Parser<'a> {
    fn new(sig: &'a str) -> Self {
        Parser { sig, bytes: sig.as_bytes(), pos: 0, struct_depth: 0, array_depth: 0 }
    }

    fn fail(&self, reason: &str) -> Error {
        Error::signature(self.sig, format!("{} at offset {}", reason, self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).cloned()
    }

    fn parse_one(&mut self) -> Result<TypeDescriptor> {
        let c = match self.peek() {
            Some(c) => c,
            None => return Err(self.fail("truncated signature")),
        };
        self.pos += 1;
        let t = match c {
            b'y' => TypeDescriptor::Byte,
            b'b' => TypeDescriptor::Boolean,
            b'n' => TypeDescriptor::Int16,
            b'q' => TypeDescriptor::UInt16,
            b'i' => TypeDescriptor::Int32,
            b'u' => TypeDescriptor::UInt32,
            b'x' => TypeDescriptor::Int64,
            b't' => TypeDescriptor::UInt64,
            b'f' => TypeDescriptor::Float,
            b'd' => TypeDescriptor::Double,
            b's' => TypeDescriptor::String,
            b'o' => TypeDescriptor::ObjectPath,
            b'g' => TypeDescriptor::Signature,
            b'h' => TypeDescriptor::UnixFd,
            b'v' => TypeDescriptor::Variant,
            b'a' => {
                self.array_depth += 1;
                if self.array_depth > MAX_ARRAY_DEPTH {
                    return Err(self.fail("arrays nested too deeply"));
                }
                let t = if self.peek() == Some(b'{') {
                    self.pos += 1;
                    self.parse_dict_entry()?
                } else {
                    TypeDescriptor::Array(Box::new(self.parse_one()?))
                };
                self.array_depth -= 1;
                t
            }
            b'(' => {
                self.struct_depth += 1;
                if self.struct_depth > MAX_STRUCT_DEPTH {
                    return Err(self.fail("structs nested too deeply"));
                }
                let mut fields = Vec::new();
                loop {
                    match self.peek() {
                        None => return Err(self.fail("unterminated struct")),
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => fields.push(self.parse_one()?),
                    }
                }
                if fields.is_empty() {
                    return Err(self.fail("empty struct"));
                }
                self.struct_depth -= 1;
                TypeDescriptor::Struct(StructType::anonymous(fields))
            }
            b'{' => return Err(self.fail("dict entry outside of an array")),
            b')' | b'}' => return Err(self.fail("unbalanced close")),
            _ => return Err(self.fail("unknown type code")),
        };
        Ok(t)
    }

    fn parse_dict_entry(&mut self) -> Result<TypeDescriptor> {
        let key = self.parse_one()?;
        if !key.is_basic() {
            return Err(self.fail("dict entry key must be a basic type"));
        }
        if self.peek() == Some(b'}') {
            return Err(self.fail("dict entry needs exactly two types"));
        }
        let value = self.parse_one()?;
        match self.peek() {
            Some(b'}') => {
                self.pos += 1;
                Ok(TypeDescriptor::Map(Box::new(key), Box::new(value)))
            }
            None => Err(self.fail("unterminated dict entry")),
            Some(_) => Err(self.fail("dict entry needs exactly two types")),
        }
    }
}

/// Parses up to `limit` complete types from `sig` (all of them when `None`).
pub fn parse(sig: &str, limit: Option<usize>) -> Result<Vec<TypeDescriptor>> {
    if sig.len() > MAX_SIGNATURE_LENGTH {
        return Err(Error::signature(sig, "signature too long"));
    }
    let mut p = Parser::new(sig);
    let mut out = Vec::new();
    while p.pos < p.bytes.len() {
        if let Some(n) = limit {
            if out.len() >= n {
                break;
            }
        }
        out.push(p.parse_one()?);
    }
    Ok(out)
}

/// Splits off the first complete type of `sig`, returning it and the rest.
pub fn split_first(sig: &str) -> Result<(&str, &str)> {
    let mut p = Parser::new(sig);
    p.parse_one()?;
    Ok(sig.split_at(p.pos))
}

/// Process-lifetime memo of generated and parsed signatures.
///
/// Descriptors are immutable, so entries are never invalidated.
#[derive(Debug, Default)]
pub struct SignatureCache {
    generated: RwLock<HashMap<TypeDescriptor, Arc<str>>>,
    parsed: RwLock<HashMap<String, Arc<[TypeDescriptor]>>>,
}

impl SignatureCache {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn encode(&self, d: &TypeDescriptor) -> Result<Arc<str>> {
        if let Some(s) = self.generated.read().get(d) {
            return Ok(s.clone());
        }
        let s: Arc<str> = Arc::from(encode(d)?);
        self.generated.write().insert(d.clone(), s.clone());
        Ok(s)
    }

    pub fn encode_all(&self, ds: &[TypeDescriptor]) -> Result<String> {
        let mut out = String::new();
        for d in ds {
            out.push_str(&self.encode(d)?);
        }
        Ok(out)
    }

    pub fn parse(&self, sig: &str) -> Result<Arc<[TypeDescriptor]>> {
        if let Some(t) = self.parsed.read().get(sig) {
            return Ok(t.clone());
        }
        let t: Arc<[TypeDescriptor]> = Arc::from(parse(sig, None)?);
        self.parsed.write().insert(sig.to_owned(), t.clone());
        Ok(t)
    }

    pub fn len(&self) -> usize {
        self.generated.read().len() + self.parsed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use super::TypeDescriptor as T;

    fn string_u32_pair() -> T {
        T::Struct(StructType::new("Pair", vec![("name", T::String), ("count", T::UInt32)]))
    }

    #[test]
    fn test_encode_array_of_struct() {
        let d = T::array(string_u32_pair());
        assert_eq!(encode(&d).unwrap(), "a(su)");
        let parsed = parse("a(su)", None).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].is_equivalent(&d));
    }

    #[test]
    fn test_round_trip() {
        let nested = T::Struct(StructType::new("Outer", vec![
            ("inner", string_u32_pair()),
            ("list", T::array(string_u32_pair())),
            ("props", T::map(T::String, T::Variant)),
        ]));
        let cases = vec![
            T::Byte, T::Boolean, T::Int16, T::UInt16, T::Int32, T::UInt32, T::Int64, T::UInt64,
            T::Double, T::String, T::ObjectPath, T::Signature, T::UnixFd, T::Variant,
            T::array(T::array(T::Byte)),
            T::map(T::UInt32, T::array(T::String)),
            nested,
            T::Enum(EnumType::new("Color", &["RED", "GREEN"])),
            T::Interface(Arc::from("org.foo.Thing")),
            T::Any,
        ];
        for d in cases {
            let s = encode(&d).unwrap();
            let back = parse(&s, None).unwrap();
            assert_eq!(back.len(), 1, "{}", s);
            assert!(back[0].is_equivalent(&d), "{} -> {:?}", s, back[0]);
        }
    }

    #[test]
    fn test_dict_key_must_be_basic() {
        let d = T::map(T::array(T::Byte), T::String);
        match encode(&d) {
            Err(Error::TypeConversion(_)) => (),
            other => panic!("expected TypeConversion, got {:?}", other),
        }
        let d = T::map(string_u32_pair(), T::String);
        assert!(matches!(encode(&d), Err(Error::TypeConversion(_))));
    }

    #[test]
    fn test_tuple_expands_at_top_level_only() {
        let t = T::Tuple(TupleType::new("Pair", vec![T::String, T::Int32]));
        assert_eq!(encode(&t).unwrap(), "si");
        assert!(matches!(encode(&T::array(t)), Err(Error::TypeConversion(_))));
    }

    #[test]
    fn test_parse_errors() {
        for bad in &["a", "(", "(ii", "ii)", "{si}", "a{s}", "a{sii}", "a{(i)s}", "()", "z", "a{si"] {
            match parse(bad, None) {
                Err(Error::SignatureParse { .. }) => (),
                other => panic!("{:?} parsed as {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_parse_limit() {
        let first = parse("(si)ua{sv}", Some(1)).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(encode(&first[0]).unwrap(), "(si)");
        assert_eq!(parse("(si)ua{sv}", None).unwrap().len(), 3);
        assert_eq!(split_first("a{sv}ii").unwrap(), ("a{sv}", "ii"));
    }

    #[test]
    fn test_cache_memoizes() {
        let cache = SignatureCache::new();
        let d = T::array(string_u32_pair());
        let a = cache.encode(&d).unwrap();
        let b = cache.encode(&d).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let p = cache.parse("a(su)").unwrap();
        let q = cache.parse("a(su)").unwrap();
        assert!(Arc::ptr_eq(&p, &q));
        assert_eq!(cache.len(), 2);
    }
}
