//! Conversion between caller-side values and wire values.
//!
//! [`convert_out`] runs before a message is built: it splices tuples and
//! custom values into the argument list, wraps values bound for `Any` in
//! variants, and resolves local-only shapes (enum constants, object handles)
//! into their wire form. [`convert_in`] is the inverse and runs on every
//! decoded body that has a declared type list.

use std::sync::Arc;

use crate::config::float_support;
use crate::error::{Error, Result};
use crate::marshal::Marshal;
use crate::signature::{SignatureCache, StructType, TypeDescriptor};
use crate::types::{Array, Dictionary, EnumValue, ObjectPath, RemoteObject, Signature, Struct, Value, Variant};

/// What the conversion layer needs from the connection it runs for.
pub trait ObjectContext {
    /// True when `path` is currently exported on this connection.
    fn is_exported(&self, path: &str) -> bool;

    /// Handle for an object path received from the peer.
    fn remote_object(&self, path: ObjectPath, interface: &str) -> RemoteObject;
}

/// Context for values that never reference live objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl ObjectContext for Detached {
    fn is_exported(&self, _path: &str) -> bool {
        false
    }

    fn remote_object(&self, path: ObjectPath, interface: &str) -> RemoteObject {
        RemoteObject::new(None, path.as_str(), Some(interface))
    }
}

/// Outbound arguments after conversion, with the types they were converted against.
#[derive(Debug, Clone, PartialEq)]
pub struct Converted {
    pub values: Vec<Value>,
    pub types: Vec<TypeDescriptor>,
}

impl Converted {
    pub fn signature(&self, cache: &SignatureCache) -> Result<String> {
        cache.encode_all(&self.types)
    }
}

fn mismatch(expected: &TypeDescriptor, got: &Value) -> String {
    format!("cannot convert {} to {:?}", got.kind(), expected)
}

/// Prepares `values` for the wire against the declared parameter `types`.
///
/// `variant_sigs` optionally tags values wrapped into variants with an
/// explicit signature; entries are consumed left to right as wrapping happens.
pub fn convert_out(
    values: Vec<Value>,
    types: &[TypeDescriptor],
    variant_sigs: &[&str],
    cache: &SignatureCache,
    ctx: &dyn ObjectContext,
) -> Result<Converted> {
    if values.len() != types.len() {
        return Err(Error::TypeConversion(format!(
            "expected {} arguments, got {}", types.len(), values.len())));
    }

    // Splice custom values and tuples; arity may grow here
    let mut flat: Vec<(Value, TypeDescriptor)> = Vec::with_capacity(values.len());
    for (v, t) in values.into_iter().zip(types.iter()) {
        match (v, t) {
            (Value::Custom(c), _) => {
                let parts = c.0.serialize();
                let descs = c.0.descriptors();
                if parts.len() != descs.len() {
                    return Err(Error::TypeConversion(format!(
                        "{} serialized {} values for {} types", c.0.type_name(), parts.len(), descs.len())));
                }
                flat.extend(parts.into_iter().zip(descs));
            }
            (Value::Tuple(parts), TypeDescriptor::Tuple(tt)) => {
                if parts.len() != tt.elements.len() {
                    return Err(Error::TypeConversion(format!(
                        "tuple {} has {} elements, got {}", tt.name, tt.elements.len(), parts.len())));
                }
                flat.extend(parts.into_iter().zip(tt.elements.iter().cloned()));
            }
            (Value::Tuple(parts), TypeDescriptor::Any) => {
                let n = parts.len();
                flat.extend(parts.into_iter().zip(std::iter::repeat(TypeDescriptor::Any).take(n)));
            }
            (v, t) => flat.push((v, t.clone())),
        }
    }

    let mut out = Converted { values: Vec::with_capacity(flat.len()), types: Vec::with_capacity(flat.len()) };
    let mut outbound = Outbound { cache, ctx, sigs: variant_sigs, next_sig: 0 };
    for (i, (v, t)) in flat.into_iter().enumerate() {
        let v = outbound
            .value(v, &t)
            .map_err(|e| e.with_context(&format!("argument {}", i)))?;
        out.values.push(v);
        out.types.push(t);
    }
    Ok(out)
}

struct Outbound<'a> {
    cache: &'a SignatureCache,
    ctx: &'a dyn ObjectContext,
    sigs: &'a [&'a str],
    next_sig: usize,
}

impl<'a> Outbound<'a> {
    fn value(&mut self, v: Value, t: &TypeDescriptor) -> Result<Value> {
        use self::TypeDescriptor as T;
        match (v, t) {
            (Value::Variant(var), T::Any) | (Value::Variant(var), T::Variant) => {
                let inner = self.loose(*var.object)?;
                if inner.get_type() != var.signature.as_str() {
                    return Err(Error::TypeConversion(format!(
                        "variant tagged {} holds a {}", var.signature.as_str(), inner.get_type())));
                }
                Ok(Value::Variant(Variant { signature: var.signature, object: Box::new(inner) }))
            }
            (v, T::Any) | (v, T::Variant) => {
                let tagged = self.sigs.get(self.next_sig).copied();
                self.next_sig += 1;
                let inner = match tagged {
                    Some(sig) => self.tagged(v, sig)?,
                    None => self.loose(v)?,
                };
                Ok(Value::Variant(Variant::infer(inner)))
            }

            (Value::Exported(p), T::ObjectPath) | (Value::Exported(p), T::Interface(_)) => self.exported(p),
            (Value::Remote(r), T::ObjectPath) | (Value::Remote(r), T::Interface(_)) => Ok(Value::ObjectPath(r.path)),
            (v @ Value::ObjectPath(_), T::ObjectPath) | (v @ Value::ObjectPath(_), T::Interface(_)) => Ok(v),

            (Value::Enum(e), T::String) => Ok(Value::String(e.constant)),
            (Value::Enum(e), T::Enum(et)) => {
                if e.type_name != et.name || !et.constants.contains(&e.constant) {
                    return Err(Error::TypeConversion(format!("{} is not a constant of {}", e.constant, et.name)));
                }
                Ok(Value::String(e.constant))
            }
            (Value::String(s), T::Enum(et)) if et.constants.contains(&s) => Ok(Value::String(s)),

            (Value::Float(f), T::Double) => Ok(Value::Double(f64::from(f))),
            (Value::Float(f), T::Float) => Ok(float_out(f)),
            (Value::Double(d), T::Float) if !float_support() => Ok(Value::Double(d)),
            (Value::UInt32(fd), T::UnixFd) => Ok(Value::UnixFd(fd)),

            (Value::Array(a), T::Array(elem)) => {
                let mut objects = Vec::with_capacity(a.objects.len());
                for o in a.objects {
                    objects.push(self.value(o, elem)?);
                }
                Ok(Value::Array(Array::new(objects, &self.cache.encode(elem)?)))
            }
            (Value::Dictionary(d), T::Map(kt, vt)) => {
                let mut entries = Vec::with_capacity(d.entries.len());
                for (k, v) in d.entries {
                    entries.push((self.value(k, kt)?, self.value(v, vt)?));
                }
                Ok(Value::Dictionary(Dictionary::new(entries, &self.cache.encode(kt)?, &self.cache.encode(vt)?)))
            }
            (Value::Struct(s), T::Struct(st)) => self.fields(s.objects, st),
            (Value::Tuple(parts), T::Struct(st)) => self.fields(parts, st),
            (Value::Custom(c), T::Struct(st)) => self.fields(c.0.serialize(), st),

            (v, t) if wire_matches(&v, t) => Ok(v),
            (v, t) => Err(Error::TypeConversion(mismatch(t, &v))),
        }
    }

    fn fields(&mut self, objects: Vec<Value>, st: &Arc<StructType>) -> Result<Value> {
        if objects.len() != st.fields.len() {
            return Err(Error::TypeConversion(format!(
                "struct {} has {} fields, got {}", st.name, st.fields.len(), objects.len())));
        }
        let mut out = Vec::with_capacity(objects.len());
        for (o, (name, t)) in objects.into_iter().zip(st.fields.iter()) {
            out.push(self.value(o, t).map_err(|e| e.with_context(name))?);
        }
        Ok(Value::Struct(Struct::new(out)))
    }

    /// Converts `v` to the single complete type named by a caller's variant tag.
    fn tagged(&mut self, v: Value, sig: &str) -> Result<Value> {
        let parsed = self.cache.parse(sig)?;
        match &parsed[..] {
            [t] => self.value(v, t).map_err(|e| e.with_context(&format!("variant tagged {}", sig))),
            _ => Err(Error::TypeConversion(format!("variant tag {:?} is not a single complete type", sig))),
        }
    }

    fn exported(&self, p: ObjectPath) -> Result<Value> {
        if !self.ctx.is_exported(p.as_str()) {
            return Err(Error::Export(format!("{} is not exported on this connection", p)));
        }
        Ok(Value::ObjectPath(p))
    }

    /// Wire form of a value with no declared type, used inside variants.
    fn loose(&mut self, v: Value) -> Result<Value> {
        Ok(match v {
            Value::Float(f) => float_out(f),
            Value::Enum(e) => Value::String(e.constant),
            Value::Remote(r) => Value::ObjectPath(r.path),
            Value::Exported(p) => self.exported(p)?,
            Value::Tuple(parts) => Value::Struct(Struct::new(self.loose_all(parts)?)),
            Value::Custom(c) => Value::Struct(Struct::new(self.loose_all(c.0.serialize())?)),
            Value::Struct(s) => Value::Struct(Struct::new(self.loose_all(s.objects)?)),
            Value::Array(a) => {
                let objects = self.loose_all(a.objects)?;
                let element = objects.first().map(Marshal::get_type).unwrap_or(a.element.0);
                Value::Array(Array { element: Signature(element), objects })
            }
            Value::Dictionary(d) => {
                let mut entries = Vec::with_capacity(d.entries.len());
                for (k, v) in d.entries {
                    entries.push((self.loose(k)?, self.loose(v)?));
                }
                Value::Dictionary(Dictionary { key: d.key, value: d.value, entries })
            }
            other => other,
        })
    }

    fn loose_all(&mut self, values: Vec<Value>) -> Result<Vec<Value>> {
        values.into_iter().map(|v| self.loose(v)).collect()
    }
}

fn float_out(f: f32) -> Value {
    if float_support() {
        Value::Float(f)
    } else {
        Value::Double(f64::from(f))
    }
}

/// True when `v` already has the wire shape `t` asks for.
fn wire_matches(v: &Value, t: &TypeDescriptor) -> bool {
    use self::TypeDescriptor as T;
    matches!(
        (v, t),
        (Value::Byte(_), T::Byte)
            | (Value::Boolean(_), T::Boolean)
            | (Value::Int16(_), T::Int16)
            | (Value::UInt16(_), T::UInt16)
            | (Value::Int32(_), T::Int32)
            | (Value::UInt32(_), T::UInt32)
            | (Value::Int64(_), T::Int64)
            | (Value::UInt64(_), T::UInt64)
            | (Value::Float(_), T::Float)
            | (Value::Double(_), T::Double)
            | (Value::String(_), T::String)
            | (Value::ObjectPath(_), T::ObjectPath)
            | (Value::Signature(_), T::Signature)
            | (Value::UnixFd(_), T::UnixFd)
    )
}

/// Rebuilds caller-side values from a decoded body.
///
/// With `top_level_return` set and a single struct target, the whole body is
/// read as that struct's fields.
pub fn convert_in(
    values: Vec<Value>,
    types: &[TypeDescriptor],
    ctx: &dyn ObjectContext,
    top_level_return: bool,
) -> Result<Vec<Value>> {
    if let [TypeDescriptor::Struct(st)] = types {
        let already_wrapped = values.len() == 1 && matches!(values[0], Value::Struct(_));
        if top_level_return && !already_wrapped {
            if values.len() != st.fields.len() {
                return Err(Error::Deserialization(format!(
                    "struct {} has {} fields, got {} values", st.name, st.fields.len(), values.len())));
            }
            let s = Value::Struct(Struct::new(values));
            return Ok(vec![Inbound { ctx }.value(s, &types[0])?]);
        }
    }

    let mut values = values.into_iter();
    let mut out = Vec::with_capacity(types.len());
    for (i, t) in types.iter().enumerate() {
        let wanted = match t {
            TypeDescriptor::Tuple(tt) => tt.elements.len(),
            TypeDescriptor::Custom(ct) => ct.components.len(),
            _ => 1,
        };
        let taken: Vec<Value> = values.by_ref().take(wanted).collect();
        if taken.len() != wanted {
            return Err(Error::Deserialization(format!(
                "argument {}: expected {} values, got {}", i, wanted, taken.len())));
        }
        let inbound = Inbound { ctx };
        let v = match t {
            TypeDescriptor::Tuple(tt) => {
                let mut parts = Vec::with_capacity(wanted);
                for (v, et) in taken.into_iter().zip(tt.elements.iter()) {
                    parts.push(inbound.value(v, et)?);
                }
                Ok(Value::Tuple(parts))
            }
            TypeDescriptor::Custom(ct) => inbound.custom(taken, ct),
            _ => taken.into_iter().next().map_or_else(
                || Err(Error::Deserialization("missing value".into())),
                |v| inbound.value(v, t),
            ),
        };
        out.push(v.map_err(|e| e.with_context(&format!("argument {}", i)))?);
    }
    let extra = values.count();
    if extra != 0 {
        return Err(Error::Deserialization(format!("{} values left over after {} arguments", extra, types.len())));
    }
    Ok(out)
}

struct Inbound<'a> {
    ctx: &'a dyn ObjectContext,
}

impl<'a> Inbound<'a> {
    fn value(&self, v: Value, t: &TypeDescriptor) -> Result<Value> {
        use self::TypeDescriptor as T;
        match (v, t) {
            (Value::Variant(var), T::Any) => Ok(*var.object),
            (v, T::Any) => Ok(v),
            (v @ Value::Variant(_), T::Variant) => Ok(v),

            (Value::ObjectPath(p), T::Interface(name)) => Ok(Value::Remote(self.ctx.remote_object(p, name))),
            (Value::String(s), T::Enum(et)) => {
                if !et.constants.contains(&s) {
                    return Err(Error::Deserialization(format!("{} is not a constant of {}", s, et.name)));
                }
                Ok(Value::Enum(EnumValue { type_name: et.name.clone(), constant: s }))
            }
            (Value::Double(d), T::Float) => Ok(Value::Float(d as f32)),

            (Value::Array(a), T::Array(elem)) => {
                let mut objects = Vec::with_capacity(a.objects.len());
                for o in a.objects {
                    objects.push(self.value(o, elem)?);
                }
                Ok(Value::Array(Array { element: a.element, objects }))
            }
            (Value::Dictionary(d), T::Map(kt, vt)) => {
                let mut entries = Vec::with_capacity(d.entries.len());
                for (k, v) in d.entries {
                    entries.push((self.value(k, kt)?, self.value(v, vt)?));
                }
                Ok(Value::Dictionary(Dictionary { key: d.key, value: d.value, entries }))
            }
            (Value::Struct(s), T::Struct(st)) => {
                if s.objects.len() != st.fields.len() {
                    return Err(Error::Deserialization(format!(
                        "struct {} has {} fields, got {}", st.name, st.fields.len(), s.objects.len())));
                }
                let mut out = Vec::with_capacity(s.objects.len());
                for (o, (name, ft)) in s.objects.into_iter().zip(st.fields.iter()) {
                    out.push(self.value(o, ft).map_err(|e| e.with_context(name))?);
                }
                Ok(Value::Struct(Struct::new(out)))
            }
            (Value::Struct(s), T::Tuple(tt)) => {
                if s.objects.len() != tt.elements.len() {
                    return Err(Error::Deserialization(format!(
                        "tuple {} has {} elements, got {}", tt.name, tt.elements.len(), s.objects.len())));
                }
                let mut parts = Vec::with_capacity(s.objects.len());
                for (o, et) in s.objects.into_iter().zip(tt.elements.iter()) {
                    parts.push(self.value(o, et)?);
                }
                Ok(Value::Tuple(parts))
            }
            (Value::Struct(s), T::Custom(ct)) => self.custom(s.objects, ct),

            (v, t) if wire_matches(&v, t) => Ok(v),
            (v, t) => Err(Error::Deserialization(mismatch(t, &v))),
        }
    }

    fn custom(&self, parts: Vec<Value>, ct: &crate::signature::CustomType) -> Result<Value> {
        if parts.len() != ct.components.len() {
            return Err(Error::Deserialization(format!(
                "{} has {} components, got {}", ct.name, ct.components.len(), parts.len())));
        }
        let mut converted = Vec::with_capacity(parts.len());
        for (p, t) in parts.into_iter().zip(ct.components.iter()) {
            converted.push(self.value(p, t)?);
        }
        (ct.construct)(converted).map_err(|e| e.with_context(&ct.name))
    }
}
