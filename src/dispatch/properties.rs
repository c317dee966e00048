//! The standard `org.freedesktop.DBus.Properties` interface, answered from
//! the properties an [`InterfaceImpl`](super::InterfaceImpl) declares.

use std::slice;
use std::sync::Arc;

use crate::convert::{self, ObjectContext};
use crate::error::{names, Error, Result};
use crate::signature::{SignatureCache, TypeDescriptor};
use crate::types::{Array, Dictionary, Value, Variant};

use super::CallInfo;

pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

pub type PropertyGetter = Arc<dyn Fn(&CallInfo) -> Result<Value> + Send + Sync>;
pub type PropertySetter = Arc<dyn Fn(&CallInfo, Value) -> Result<()> + Send + Sync>;

pub(super) struct PropertyDef {
    pub(super) name: String,
    pub(super) ty: TypeDescriptor,
    pub(super) getter: PropertyGetter,
    pub(super) setter: Option<PropertySetter>,
}

/// A declared property, detached from the table.
pub struct PropertyEntry {
    pub interface: String,
    pub name: String,
    pub ty: TypeDescriptor,
    pub signature: String,
    getter: PropertyGetter,
    setter: Option<PropertySetter>,
}

impl PropertyEntry {
    pub(super) fn build(interface: &str, def: PropertyDef, cache: &SignatureCache) -> Result<Self> {
        let signature = cache.encode(&def.ty)?.to_string();
        Ok(PropertyEntry {
            interface: interface.to_owned(),
            name: def.name,
            ty: def.ty,
            signature,
            getter: def.getter,
            setter: def.setter,
        })
    }

    pub fn writable(&self) -> bool {
        self.setter.is_some()
    }

    pub(super) fn access(&self) -> &'static str {
        if self.writable() {
            "readwrite"
        } else {
            "read"
        }
    }

    /// Current value, wrapped in a variant of the declared type.
    fn read(&self, info: &CallInfo, cache: &SignatureCache, ctx: &dyn ObjectContext) -> Result<Value> {
        let value = (self.getter)(info)?;
        let mut converted = convert::convert_out(vec![value], slice::from_ref(&self.ty), &[], cache, ctx)
            .map_err(|e| e.with_context(&format!("property {}", self.name)))?;
        match converted.values.pop() {
            Some(v) if converted.values.is_empty() => Ok(Value::Variant(Variant::infer(v))),
            _ => Err(Error::TypeConversion(format!("property {} does not convert to a single value", self.name))),
        }
    }

    fn write(&self, info: &CallInfo, value: Value, ctx: &dyn ObjectContext) -> Result<()> {
        let setter = match &self.setter {
            Some(s) => s,
            None => return Err(read_only(self)),
        };
        let inner = match value {
            Value::Variant(var) if var.signature.as_str() == self.signature => *var.object,
            Value::Variant(var) => {
                return Err(Error::remote(
                    names::INVALID_ARGS,
                    format!("property {} has type {}, got {}", self.name, self.signature, var.signature.as_str()),
                ))
            }
            other => {
                return Err(Error::remote(
                    names::INVALID_ARGS,
                    format!("property {} is set from a variant, got {}", self.name, other.kind()),
                ))
            }
        };
        let mut args = convert::convert_in(vec![inner], slice::from_ref(&self.ty), ctx, false)?;
        match args.pop() {
            Some(v) if args.is_empty() => setter(info, v),
            _ => Err(Error::Deserialization(format!("property {} does not decode to a single value", self.name))),
        }
    }
}

fn read_only(p: &PropertyEntry) -> Error {
    Error::remote(names::PROPERTY_READ_ONLY, format!("property {}.{} is read-only", p.interface, p.name))
}

pub(super) fn unknown_property(interface: &str, name: &str) -> Error {
    let interface = if interface.is_empty() { "*" } else { interface };
    Error::remote(names::UNKNOWN_PROPERTY, format!("no property {}.{}", interface, name))
}

pub(super) fn unknown_interface(interface: &str) -> Error {
    Error::remote(names::UNKNOWN_INTERFACE, format!("no interface {}", interface))
}

/// A resolved `Get`, `Set` or `GetAll`.
pub enum PropertyCall {
    Get(Arc<PropertyEntry>),
    Set(Arc<PropertyEntry>, Value),
    GetAll(Vec<Arc<PropertyEntry>>),
}

impl PropertyCall {
    /// Runs the getters or the setter and encodes the reply body.
    pub fn run(self, info: &CallInfo, cache: &SignatureCache, ctx: &dyn ObjectContext) -> Result<Vec<Value>> {
        match self {
            PropertyCall::Get(p) => Ok(vec![p.read(info, cache, ctx)?]),
            PropertyCall::Set(p, v) => {
                p.write(info, v, ctx)?;
                Ok(Vec::new())
            }
            PropertyCall::GetAll(props) => {
                let mut entries = Vec::with_capacity(props.len());
                for p in props {
                    entries.push((Value::String(p.name.clone()), p.read(info, cache, ctx)?));
                }
                Ok(vec![Value::Dictionary(Dictionary::new(entries, "s", "v"))])
            }
        }
    }
}

/// Body of a `PropertiesChanged` signal. Values that are not variants yet
/// are wrapped with their own type.
pub fn properties_changed_args(interface: &str, changed: Vec<(String, Value)>, invalidated: Vec<String>) -> Vec<Value> {
    let changed = changed
        .into_iter()
        .map(|(name, v)| {
            let v = match v {
                v @ Value::Variant(_) => v,
                other => Value::Variant(Variant::infer(other)),
            };
            (Value::String(name), v)
        })
        .collect();
    let invalidated = invalidated.into_iter().map(Value::String).collect();
    vec![
        Value::from(interface),
        Value::Dictionary(Dictionary::new(changed, "s", "v")),
        Value::Array(Array::new(invalidated, "s")),
    ]
}

pub(super) fn introspection(out: &mut String) {
    out.push_str(" <interface name=\"org.freedesktop.DBus.Properties\">\n");
    out.push_str("  <method name=\"Get\">\n   <arg type=\"s\" direction=\"in\"/>\n   <arg type=\"s\" direction=\"in\"/>\n");
    out.push_str("   <arg type=\"v\" direction=\"out\"/>\n  </method>\n");
    out.push_str("  <method name=\"Set\">\n   <arg type=\"s\" direction=\"in\"/>\n   <arg type=\"s\" direction=\"in\"/>\n");
    out.push_str("   <arg type=\"v\" direction=\"in\"/>\n  </method>\n");
    out.push_str("  <method name=\"GetAll\">\n   <arg type=\"s\" direction=\"in\"/>\n");
    out.push_str("   <arg type=\"a{sv}\" direction=\"out\"/>\n  </method>\n");
    out.push_str("  <signal name=\"PropertiesChanged\">\n   <arg type=\"s\"/>\n   <arg type=\"a{sv}\"/>\n   <arg type=\"as\"/>\n  </signal>\n");
    out.push_str(" </interface>\n");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::marshal::body_signature;

    #[test]
    fn test_properties_changed_body() {
        let body = properties_changed_args(
            "org.foo",
            vec![("Volume".to_owned(), Value::UInt32(7)), ("Name".to_owned(), Value::Variant(Variant::new(Value::from("x"), "s")))],
            vec!["Cache".to_owned()],
        );
        assert_eq!(body_signature(&body), "sa{sv}as");
        match &body[1] {
            Value::Dictionary(d) => {
                assert_eq!(d.entries[0].1, Value::Variant(Variant::new(Value::UInt32(7), "u")));
                assert_eq!(d.entries[1].1, Value::Variant(Variant::new(Value::from("x"), "s")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
