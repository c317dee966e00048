use crate::message::valid_object_path;
use crate::signature::split_first;
use crate::types::{Array, Dictionary, ObjectPath, Signature, Struct, Value, Variant};

pub const MAX_ARRAY_LENGTH: u32 = 1 << 26;
pub const MAX_VARIANT_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemarshalError {
    MessageTooShort,
    CorruptedMessage,
    BadUTF8,
    BadSignature,
    ElementTooBig,
    MismatchedParens,
    NestingTooDeep,
}

pub fn get_alignment(sig: char) -> usize {
    match sig {
        'y' | 'g' | 'v' => 1,
        'n' | 'q' => 2,
        'b' | 'i' | 'u' | 'h' | 'f' | 's' | 'o' | 'a' => 4,
        'x' | 't' | 'd' | '(' | '{' => 8,
        _ => 1,
    }
}

/// Signature-driven decoder over a byte slice.
///
/// Offsets are relative to the start of `buf`, which must itself be 8-byte
/// aligned with respect to the message (the header start or the body start).
pub struct Demarshaller<'a> {
    buf: &'a [u8],
    offset: usize,
    big_endian: bool,
    variant_depth: usize,
}

impl<'a> Demarshaller<'a> {
    pub fn new(buf: &'a [u8], offset: usize, big_endian: bool) -> Self {
        Demarshaller { buf, offset, big_endian, variant_depth: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.offset)
    }

    /// Decodes the first complete type of `sig` and advances `sig` past it.
    pub fn demarshal(&mut self, sig: &mut &str) -> Result<Value, DemarshalError> {
        let (this, rest) = split_first(sig).or(Err(DemarshalError::BadSignature))?;
        let v = self.demarshal_one(this)?;
        *sig = rest;
        Ok(v)
    }

    /// Decodes every value described by `sig`.
    pub fn demarshal_all(&mut self, sig: &str) -> Result<Vec<Value>, DemarshalError> {
        let mut sig = sig;
        let mut values = Vec::new();
        while !sig.is_empty() {
            values.push(self.demarshal(&mut sig)?);
        }
        Ok(values)
    }

    fn align_to(&mut self, align: usize) -> Result<(), DemarshalError> {
        let delta = (align - (self.offset % align)) % align;
        if self.remaining() < delta {
            return Err(DemarshalError::MessageTooShort);
        }
        // Padding must be zero
        if self.buf[self.offset..self.offset + delta].iter().any(|b| *b != 0) {
            return Err(DemarshalError::CorruptedMessage);
        }
        self.offset += delta;
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DemarshalError> {
        if self.remaining() < len {
            return Err(DemarshalError::MessageTooShort);
        }
        let bytes = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N], DemarshalError> {
        self.align_to(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn demarshal_byte(&mut self) -> Result<u8, DemarshalError> {
        Ok(self.take(1)?[0])
    }

    fn demarshal_u16(&mut self) -> Result<u16, DemarshalError> {
        let b = self.fixed::<2>()?;
        Ok(if self.big_endian { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) })
    }

    fn demarshal_u32(&mut self) -> Result<u32, DemarshalError> {
        let b = self.fixed::<4>()?;
        Ok(if self.big_endian { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) })
    }

    fn demarshal_u64(&mut self) -> Result<u64, DemarshalError> {
        let b = self.fixed::<8>()?;
        Ok(if self.big_endian { u64::from_be_bytes(b) } else { u64::from_le_bytes(b) })
    }

    fn demarshal_bool(&mut self) -> Result<bool, DemarshalError> {
        match self.demarshal_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DemarshalError::CorruptedMessage),
        }
    }

    fn demarshal_string(&mut self, count_size: usize) -> Result<String, DemarshalError> {
        // The length read also aligns us with the input
        let len = if count_size == 1 {
            self.demarshal_byte()? as usize
        } else {
            self.demarshal_u32()? as usize
        };
        let bytes = self.take(len)?;
        // Check the NUL byte
        if self.take(1)?[0] != 0 {
            return Err(DemarshalError::CorruptedMessage);
        }
        if bytes.contains(&0) {
            return Err(DemarshalError::CorruptedMessage);
        }
        String::from_utf8(bytes.to_vec()).or(Err(DemarshalError::BadUTF8))
    }

    fn demarshal_array(&mut self, elem: &str) -> Result<Value, DemarshalError> {
        let typ = elem.chars().next().ok_or(DemarshalError::BadSignature)?;
        // The length read also aligns us with the input
        let array_len = self.demarshal_u32()?;
        if array_len > MAX_ARRAY_LENGTH {
            return Err(DemarshalError::ElementTooBig);
        }
        self.align_to(get_alignment(typ))?;
        if self.remaining() < array_len as usize {
            return Err(DemarshalError::MessageTooShort);
        }

        let end = self.offset + array_len as usize;
        if typ == '{' {
            let inner = elem
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .ok_or(DemarshalError::MismatchedParens)?;
            let (key_sig, value_sig) = split_first(inner).or(Err(DemarshalError::BadSignature))?;
            let mut entries = Vec::new();
            while self.offset < end {
                self.align_to(8)?;
                let key = self.demarshal_one(key_sig)?;
                let value = self.demarshal_one(value_sig)?;
                entries.push((key, value));
            }
            if self.offset != end {
                return Err(DemarshalError::CorruptedMessage);
            }
            return Ok(Value::Dictionary(Dictionary::new(entries, key_sig, value_sig)));
        }

        let mut vec = Vec::new();
        while self.offset < end {
            vec.push(self.demarshal_one(elem)?);
        }
        if self.offset != end {
            return Err(DemarshalError::CorruptedMessage);
        }
        Ok(Value::Array(Array::new(vec, elem)))
    }

    fn demarshal_struct(&mut self, inner: &str) -> Result<Value, DemarshalError> {
        self.align_to(8)?;
        let mut sig = inner;
        let mut vec = Vec::new();
        while !sig.is_empty() {
            vec.push(self.demarshal(&mut sig)?);
        }
        Ok(Value::Struct(Struct::new(vec)))
    }

    fn demarshal_variant(&mut self) -> Result<Value, DemarshalError> {
        let sig = self.demarshal_string(1)?;
        match split_first(&sig) {
            Ok((_, "")) => (),
            _ => return Err(DemarshalError::BadSignature),
        }
        self.variant_depth += 1;
        if self.variant_depth > MAX_VARIANT_DEPTH {
            return Err(DemarshalError::NestingTooDeep);
        }
        let var = self.demarshal_one(&sig)?;
        self.variant_depth -= 1;
        Ok(Value::Variant(Variant { object: Box::new(var), signature: Signature(sig) }))
    }

    /// `this` is exactly one complete type.
    fn demarshal_one(&mut self, this: &str) -> Result<Value, DemarshalError> {
        let typ = this.chars().next().ok_or(DemarshalError::BadSignature)?;
        match typ {
            'y' => self.demarshal_byte().map(Value::Byte),
            'b' => self.demarshal_bool().map(Value::Boolean),
            'n' => self.demarshal_u16().map(|x| Value::Int16(x as i16)),
            'q' => self.demarshal_u16().map(Value::UInt16),
            'i' => self.demarshal_u32().map(|x| Value::Int32(x as i32)),
            'u' => self.demarshal_u32().map(Value::UInt32),
            'h' => self.demarshal_u32().map(Value::UnixFd),
            'x' => self.demarshal_u64().map(|x| Value::Int64(x as i64)),
            't' => self.demarshal_u64().map(Value::UInt64),
            'f' => self.demarshal_u32().map(|x| Value::Float(f32::from_bits(x))),
            'd' => self.demarshal_u64().map(|x| Value::Double(f64::from_bits(x))),
            's' => self.demarshal_string(4).map(Value::String),
            'o' => {
                let path = self.demarshal_string(4)?;
                if !valid_object_path(&path) {
                    return Err(DemarshalError::CorruptedMessage);
                }
                Ok(Value::ObjectPath(ObjectPath(path)))
            }
            'g' => {
                let sig = self.demarshal_string(1)?;
                if crate::signature::parse(&sig, None).is_err() {
                    return Err(DemarshalError::BadSignature);
                }
                Ok(Value::Signature(Signature(sig)))
            }
            'a' => self.demarshal_array(&this[1..]),
            '(' => {
                let inner = this
                    .strip_prefix('(')
                    .and_then(|s| s.strip_suffix(')'))
                    .ok_or(DemarshalError::MismatchedParens)?;
                self.demarshal_struct(inner)
            }
            'v' => self.demarshal_variant(),
            _ => Err(DemarshalError::BadSignature),
        }
    }
}

/// Little-endian convenience wrapper: decodes the first type of `sig` from
/// `buf` at `offset`, advancing both.
pub fn demarshal(buf: &[u8], offset: &mut usize, sig: &mut &str) -> Result<Value, DemarshalError> {
    let mut d = Demarshaller::new(buf, *offset, false);
    let v = d.demarshal(sig)?;
    *offset = d.offset();
    Ok(v)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::marshal::Marshal;

    #[test]
    fn test_demarshal_u32() {
        let mut buf = Vec::new();
        let x = 16 as u32;
        let t = x.get_type();
        let mut sig = t.as_str();
        x.dbus_encode(&mut buf);

        let mut offset = 0;
        let v = demarshal(&buf, &mut offset, &mut sig).unwrap();
        assert_eq!(v, Value::UInt32(16));
        assert_eq!(offset, buf.len());
        assert_eq!(sig, "");
    }

    #[test]
    fn test_demarshal_u32_offset() {
        let mut buf = vec![0];
        let x = 16 as u32;
        let mut sig = "u";
        x.dbus_encode(&mut buf);

        let mut offset = 1;
        let v = demarshal(&buf, &mut offset, &mut sig).unwrap();
        assert_eq!(v, Value::UInt32(16));
        assert_eq!(offset, 8);
        assert_eq!(sig, "");
    }

    #[test]
    fn test_big_endian() {
        let buf = vec![0, 0, 0, 42, 0xff, 0xfe];
        let mut d = Demarshaller::new(&buf, 0, true);
        assert_eq!(d.demarshal_all("un").unwrap(), vec![Value::UInt32(42), Value::Int16(-2)]);
    }

    #[test]
    fn test_string() {
        let mut buf = Vec::new();
        let x = "swalter".to_string();
        let mut sig = "s";
        x.dbus_encode(&mut buf);

        let mut offset = 0;
        let v = demarshal(&buf, &mut offset, &mut sig).unwrap();
        assert_eq!(v, Value::String("swalter".to_string()));
        assert_eq!(offset, buf.len());
        assert_eq!(sig, "");
    }

    #[test]
    fn test_array() {
        let mut buf = Vec::new();
        let x = vec![1 as u32, 2 as u32, 3 as u32];
        let mut sig = "au";
        x.dbus_encode(&mut buf);

        let mut offset = 0;
        let v = demarshal(&buf, &mut offset, &mut sig).unwrap();
        let arr = match v {
            Value::Array(x) => x,
            _ => panic!("Bad return from demarshal {:?}", v)
        };
        let golden = vec![Value::UInt32(1), Value::UInt32(2), Value::UInt32(3)];
        assert_eq!(arr.objects, golden);
        assert_eq!(arr.element.as_str(), "u");
        assert_eq!(offset, buf.len());
        assert_eq!(sig, "");
    }

    #[test]
    fn test_array_bytes() {
        let mut buf = Vec::new();
        let x = vec![1 as u8, 2 as u8, 3 as u8];
        let mut sig = "ay";
        x.dbus_encode(&mut buf);

        let mut offset = 0;
        let v = demarshal(&buf, &mut offset, &mut sig).unwrap();
        let arr = match v {
            Value::Array(x) => x,
            _ => panic!("Bad return from demarshal {:?}", v)
        };
        assert_eq!(arr.objects, vec![Value::Byte(1), Value::Byte(2), Value::Byte(3)]);
        assert_eq!(offset, buf.len());
        assert_eq!(sig, "");
    }

    #[test]
    fn test_struct() {
        let mut buf = Vec::new();
        let x = "swalter".to_string();
        let mut sig = "(ss)u";
        x.dbus_encode(&mut buf);
        x.dbus_encode(&mut buf);

        let mut offset = 0;
        let v = demarshal(&buf, &mut offset, &mut sig).unwrap();
        assert_eq!(offset, buf.len());
        assert_eq!(sig, "u");
        let s = match v {
            Value::Struct(x) => x,
            _ => panic!("Bad return from demarshal {:?}", v)
        };
        assert_eq!(Value::Struct(s).get_type(), "(ss)");
    }

    #[test]
    fn test_dictionary_and_variant() {
        let d = Dictionary::new(
            vec![
                (Value::from("a"), Value::Variant(Variant::new(Value::from(1u32), "u"))),
                (Value::from("b"), Value::Variant(Variant::new(Value::from("x"), "s"))),
            ],
            "s",
            "v",
        );
        let mut buf = Vec::new();
        d.dbus_encode(&mut buf);
        let mut offset = 0;
        let mut sig = "a{sv}";
        let v = demarshal(&buf, &mut offset, &mut sig).unwrap();
        assert_eq!(v, Value::Dictionary(d));
    }

    #[test]
    fn test_rejects_bad_input() {
        // bool other than 0/1
        let buf = vec![2, 0, 0, 0];
        assert_eq!(demarshal(&buf, &mut 0, &mut "b"), Err(DemarshalError::CorruptedMessage));
        // missing NUL terminator
        let buf = vec![1, 0, 0, 0, b'a', b'b'];
        assert_eq!(demarshal(&buf, &mut 0, &mut "s"), Err(DemarshalError::CorruptedMessage));
        // array longer than the limit
        let buf = ((MAX_ARRAY_LENGTH + 1).to_le_bytes()).to_vec();
        assert_eq!(demarshal(&buf, &mut 0, &mut "ay"), Err(DemarshalError::ElementTooBig));
        // truncated
        let buf = vec![8, 0, 0, 0, 1, 2];
        assert_eq!(demarshal(&buf, &mut 0, &mut "ay"), Err(DemarshalError::MessageTooShort));
        assert_eq!(demarshal(&buf, &mut 0, &mut "(u"), Err(DemarshalError::BadSignature));
    }

    #[test]
    fn test_variant_depth_limit() {
        // Nest variants past the limit: each level is "v" signature then the inner value
        let mut v = Value::from(1u8);
        for _ in 0..(MAX_VARIANT_DEPTH + 1) {
            let sig = crate::marshal::Marshal::get_type(&v);
            v = Value::Variant(Variant::new(v, &sig));
        }
        let mut buf = Vec::new();
        v.dbus_encode(&mut buf);
        assert_eq!(demarshal(&buf, &mut 0, &mut "v"), Err(DemarshalError::NestingTooDeep));
    }
}
