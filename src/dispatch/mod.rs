//! Routes incoming method calls to exported objects
//!
//! An [`ExportedObject`] is a set of interfaces, each a table of methods keyed
//! by (member, signature). The connection keeps exported objects in an
//! [`ObjectTable`] by path, next to a table of fallbacks that answer for a
//! whole subtree. A call is resolved against the exact path first, then the
//! longest fallback prefix, and finally the built-in `org.freedesktop.DBus.Peer`
//! and `org.freedesktop.DBus.Introspectable` handler that every path answers.
//! Objects that declare properties also answer `org.freedesktop.DBus.Properties`.
//!
//! Resolution only copies what the call needs out of the table; the handler
//! itself runs later without any table lock held.
//!
//! # Examples
//! Exporting an echo method and resolving a call against it
//!
//! ```
//! use dbus_endpoint::dispatch::{ExportedObject, InterfaceImpl, ObjectTable, Target};
//! use dbus_endpoint::dispatch::message_types::{decode_message, MessageType};
//! use dbus_endpoint::message;
//! use dbus_endpoint::signature::{SignatureCache, TypeDescriptor};
//!
//! let obj = ExportedObject::new().interface(
//!     InterfaceImpl::new("org.foo")
//!         .method("Echo", vec![TypeDescriptor::String], Some(TypeDescriptor::String),
//!                 |_info, args| Ok(args.into_iter().next())));
//!
//! let cache = SignatureCache::new();
//! let mut table = ObjectTable::new();
//! table.export("/Test", obj, &cache).unwrap();
//!
//! let mut msg = message::create_method_call(None, "/Test", Some("org.foo"), "Echo").add_arg("hi");
//! msg.serial = 1;
//! let msg = message::Message::decode(&msg.encode().unwrap()).unwrap();
//! if let MessageType::Method(call) = decode_message(msg).unwrap() {
//!     match table.resolve(&call).unwrap() {
//!         Target::Method(m) => assert_eq!(m.member, "Echo"),
//!         _ => panic!("expected the exported method"),
//!     }
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::fs;
use std::sync::Arc;

use lazy_static::lazy_static;

use crate::convert::{self, ObjectContext};
use crate::error::{names, Error, Result};
use crate::message::{self, valid_interface_name, valid_member_name, valid_object_path};
use crate::signature::{SignatureCache, TypeDescriptor};
use crate::types::Value;

pub mod message_types;
pub mod properties;
use self::message_types::MethodCall;
pub use self::properties::{PropertyCall, PropertyEntry, PROPERTIES_INTERFACE};
use self::properties::PropertyDef;

pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";

const INTROSPECT_DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\" \
\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

/// Everything a handler may want to know about the call it is servicing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallInfo {
    pub sender: Option<String>,
    pub destination: Option<String>,
    pub path: String,
    pub interface: Option<String>,
    pub member: String,
    pub serial: u32,
    pub flags: u8,
}

impl CallInfo {
    pub fn new(call: &MethodCall) -> Self {
        CallInfo {
            sender: call.opt.sender.clone(),
            destination: call.opt.destination.clone(),
            path: call.path.clone(),
            interface: call.interface.clone(),
            member: call.member.clone(),
            serial: call.opt.serial,
            flags: call.opt.flags,
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.flags & message::flags::NO_REPLY_EXPECTED == 0
    }
}

/// A method implementation. Returning `Ok(None)` from a method declared with
/// a return type is an error; for void methods the value is ignored.
pub type MethodHandler = Arc<dyn Fn(&CallInfo, Vec<Value>) -> Result<Option<Value>> + Send + Sync>;

struct MethodDef {
    name: String,
    params: Vec<TypeDescriptor>,
    ret: Option<TypeDescriptor>,
    handler: MethodHandler,
}

struct SignalDef {
    name: String,
    params: Vec<TypeDescriptor>,
}

/// One interface of an exported object.
pub struct InterfaceImpl {
    name: String,
    methods: Vec<MethodDef>,
    signals: Vec<SignalDef>,
    properties: Vec<PropertyDef>,
}

impl InterfaceImpl {
    pub fn new(name: &str) -> Self {
        InterfaceImpl { name: name.to_owned(), methods: Vec::new(), signals: Vec::new(), properties: Vec::new() }
    }

    pub fn method<F>(mut self, name: &str, params: Vec<TypeDescriptor>, ret: Option<TypeDescriptor>, f: F) -> Self
    where
        F: Fn(&CallInfo, Vec<Value>) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        self.methods.push(MethodDef { name: name.to_owned(), params, ret, handler: Arc::new(f) });
        self
    }

    /// Declares a signal, for introspection only.
    pub fn signal(mut self, name: &str, params: Vec<TypeDescriptor>) -> Self {
        self.signals.push(SignalDef { name: name.to_owned(), params });
        self
    }

    /// Declares a read-only property served through `org.freedesktop.DBus.Properties`.
    pub fn property<G>(mut self, name: &str, ty: TypeDescriptor, getter: G) -> Self
    where
        G: Fn(&CallInfo) -> Result<Value> + Send + Sync + 'static,
    {
        self.properties.push(PropertyDef { name: name.to_owned(), ty, getter: Arc::new(getter), setter: None });
        self
    }

    pub fn writable_property<G, S>(mut self, name: &str, ty: TypeDescriptor, getter: G, setter: S) -> Self
    where
        G: Fn(&CallInfo) -> Result<Value> + Send + Sync + 'static,
        S: Fn(&CallInfo, Value) -> Result<()> + Send + Sync + 'static,
    {
        self.properties.push(PropertyDef {
            name: name.to_owned(),
            ty,
            getter: Arc::new(getter),
            setter: Some(Arc::new(setter)),
        });
        self
    }
}

/// A local object ready to be exported.
#[derive(Default)]
pub struct ExportedObject {
    interfaces: Vec<InterfaceImpl>,
}

impl ExportedObject {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn interface(mut self, iface: InterfaceImpl) -> Self {
        self.interfaces.push(iface);
        self
    }
}

/// A resolved method, detached from the table.
pub struct MethodEntry {
    pub interface: String,
    pub member: String,
    pub params: Vec<TypeDescriptor>,
    pub ret: Option<TypeDescriptor>,
    pub in_signature: String,
    pub out_signature: String,
    handler: MethodHandler,
}

impl MethodEntry {
    /// Decodes the arguments, runs the handler and encodes its result.
    pub fn invoke(&self, info: &CallInfo, body: Vec<Value>, cache: &SignatureCache, ctx: &dyn ObjectContext) -> Result<Vec<Value>> {
        let args = convert::convert_in(body, &self.params, ctx, false)?;
        let result = (self.handler)(info, args)?;
        match (&self.ret, result) {
            (None, _) => Ok(Vec::new()),
            (Some(t), Some(v)) => Ok(convert::convert_out(vec![v], std::slice::from_ref(t), &[], cache, ctx)?.values),
            (Some(_), None) => Err(Error::remote(
                names::FAILED,
                format!("{}.{} returned no value", self.interface, self.member),
            )),
        }
    }
}

struct ObjectEntry {
    interfaces: Vec<InterfaceEntry>,
}

struct InterfaceEntry {
    name: String,
    methods: Vec<Arc<MethodEntry>>,
    signals: Vec<(String, String)>,
    properties: Vec<Arc<PropertyEntry>>,
}

impl ObjectEntry {
    fn build(obj: ExportedObject, cache: &SignatureCache) -> Result<Self> {
        let mut interfaces = Vec::with_capacity(obj.interfaces.len());
        for iface in obj.interfaces {
            if !valid_interface_name(&iface.name) {
                return Err(Error::Export(format!("invalid interface name {:?}", iface.name)));
            }
            let mut methods: Vec<Arc<MethodEntry>> = Vec::with_capacity(iface.methods.len());
            for m in iface.methods {
                if !valid_member_name(&m.name) {
                    return Err(Error::Export(format!("invalid member name {:?}", m.name)));
                }
                let in_signature = cache.encode_all(&m.params)?;
                let out_signature = match &m.ret {
                    Some(t) => cache.encode(t)?.to_string(),
                    None => String::new(),
                };
                if methods.iter().any(|e| e.member == m.name && e.in_signature == in_signature) {
                    return Err(Error::Export(format!("{}.{}({}) declared twice", iface.name, m.name, in_signature)));
                }
                methods.push(Arc::new(MethodEntry {
                    interface: iface.name.clone(),
                    member: m.name,
                    params: m.params,
                    ret: m.ret,
                    in_signature,
                    out_signature,
                    handler: m.handler,
                }));
            }
            let mut signals = Vec::with_capacity(iface.signals.len());
            for s in iface.signals {
                signals.push((s.name, cache.encode_all(&s.params)?));
            }
            let mut properties: Vec<Arc<PropertyEntry>> = Vec::with_capacity(iface.properties.len());
            for p in iface.properties {
                if !valid_member_name(&p.name) {
                    return Err(Error::Export(format!("invalid property name {:?}", p.name)));
                }
                if properties.iter().any(|e| e.name == p.name) {
                    return Err(Error::Export(format!("property {}.{} declared twice", iface.name, p.name)));
                }
                properties.push(Arc::new(PropertyEntry::build(&iface.name, p, cache)?));
            }
            interfaces.push(InterfaceEntry { name: iface.name, methods, signals, properties });
        }
        Ok(ObjectEntry { interfaces })
    }

    /// `Err(true)` when the member exists under another signature.
    fn find(&self, interface: Option<&str>, member: &str, signature: &str) -> std::result::Result<Arc<MethodEntry>, bool> {
        let mut member_seen = false;
        for iface in &self.interfaces {
            if interface.map_or(false, |i| i != iface.name) {
                continue;
            }
            for m in &iface.methods {
                if m.member == member {
                    if m.in_signature == signature {
                        return Ok(m.clone());
                    }
                    member_seen = true;
                }
            }
        }
        Err(member_seen)
    }

    fn has_properties(&self) -> bool {
        self.interfaces.iter().any(|i| !i.properties.is_empty())
    }

    /// An empty interface name searches every interface.
    fn property(&self, interface: &str, name: &str) -> Result<Arc<PropertyEntry>> {
        self.interfaces
            .iter()
            .filter(|i| interface.is_empty() || i.name == interface)
            .flat_map(|i| i.properties.iter())
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| properties::unknown_property(interface, name))
    }

    fn all_properties(&self, interface: &str) -> Result<Vec<Arc<PropertyEntry>>> {
        if !interface.is_empty() && !self.interfaces.iter().any(|i| i.name == interface) {
            return Err(properties::unknown_interface(interface));
        }
        Ok(self
            .interfaces
            .iter()
            .filter(|i| interface.is_empty() || i.name == interface)
            .flat_map(|i| i.properties.iter().cloned())
            .collect())
    }

    /// `Ok(None)` when `call` is not a Properties call.
    fn property_call(&self, call: &MethodCall) -> Result<Option<PropertyCall>> {
        if call.interface.as_deref().map_or(false, |i| i != PROPERTIES_INTERFACE) {
            return Ok(None);
        }
        match (call.member.as_str(), call.opt.signature.as_str(), call.body.as_slice()) {
            ("Get", "ss", [Value::String(iface), Value::String(name)]) => {
                Ok(Some(PropertyCall::Get(self.property(iface, name)?)))
            }
            ("Set", "ssv", [Value::String(iface), Value::String(name), value]) => {
                Ok(Some(PropertyCall::Set(self.property(iface, name)?, value.clone())))
            }
            ("GetAll", "s", [Value::String(iface)]) => Ok(Some(PropertyCall::GetAll(self.all_properties(iface)?))),
            _ => Ok(None),
        }
    }

    fn introspect_interfaces(&self, out: &mut String) {
        for iface in &self.interfaces {
            let _ = writeln!(out, " <interface name=\"{}\">", iface.name);
            for m in &iface.methods {
                let _ = writeln!(out, "  <method name=\"{}\">", m.member);
                for arg in signature_args(&m.in_signature) {
                    let _ = writeln!(out, "   <arg type=\"{}\" direction=\"in\"/>", xml_escape(arg));
                }
                if !m.out_signature.is_empty() {
                    let _ = writeln!(out, "   <arg type=\"{}\" direction=\"out\"/>", xml_escape(&m.out_signature));
                }
                out.push_str("  </method>\n");
            }
            for (name, sig) in &iface.signals {
                let _ = writeln!(out, "  <signal name=\"{}\">", name);
                for arg in signature_args(sig) {
                    let _ = writeln!(out, "   <arg type=\"{}\"/>", xml_escape(arg));
                }
                out.push_str("  </signal>\n");
            }
            for p in &iface.properties {
                let _ = writeln!(
                    out,
                    "  <property name=\"{}\" type=\"{}\" access=\"{}\"/>",
                    p.name,
                    xml_escape(&p.signature),
                    p.access()
                );
            }
            out.push_str(" </interface>\n");
        }
    }
}

fn signature_args(sig: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = sig;
    while !rest.is_empty() {
        match crate::signature::split_first(rest) {
            Ok((first, tail)) => {
                out.push(first);
                rest = tail;
            }
            Err(_) => break,
        }
    }
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

/// What an inbound call resolved to.
pub enum Target {
    Method(Arc<MethodEntry>),
    Ping,
    GetMachineId,
    /// A Properties call against declared properties.
    Property(PropertyCall),
    /// Introspection data, rendered while the table was locked.
    Introspect(String),
}

/// Exported objects and fallbacks of one connection. Not synchronized; the
/// connection keeps it behind a lock.
#[derive(Default)]
pub struct ObjectTable {
    objects: BTreeMap<String, ObjectEntry>,
    fallbacks: BTreeMap<String, ObjectEntry>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Default::default()
    }

    fn check_path(path: &str) -> Result<()> {
        if valid_object_path(path) {
            Ok(())
        } else {
            Err(Error::Export(format!("invalid object path {:?}", path)))
        }
    }

    pub fn export(&mut self, path: &str, obj: ExportedObject, cache: &SignatureCache) -> Result<()> {
        ObjectTable::check_path(path)?;
        if self.objects.contains_key(path) {
            return Err(Error::Export(format!("an object is already exported at {}", path)));
        }
        let entry = ObjectEntry::build(obj, cache)?;
        self.objects.insert(path.to_owned(), entry);
        Ok(())
    }

    pub fn unexport(&mut self, path: &str) -> bool {
        self.objects.remove(path).is_some()
    }

    /// Registers `obj` to answer for `prefix` and every path below it that
    /// has no object of its own.
    pub fn add_fallback(&mut self, prefix: &str, obj: ExportedObject, cache: &SignatureCache) -> Result<()> {
        ObjectTable::check_path(prefix)?;
        if self.fallbacks.contains_key(prefix) {
            return Err(Error::Export(format!("a fallback is already registered at {}", prefix)));
        }
        let entry = ObjectEntry::build(obj, cache)?;
        self.fallbacks.insert(prefix.to_owned(), entry);
        Ok(())
    }

    pub fn remove_fallback(&mut self, prefix: &str) -> bool {
        self.fallbacks.remove(prefix).is_some()
    }

    pub fn is_exported(&self, path: &str) -> bool {
        self.objects.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn fallback_for(&self, path: &str) -> Option<&ObjectEntry> {
        self.fallbacks
            .iter()
            .filter(|(prefix, _)| is_under(path, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, entry)| entry)
    }

    fn lookup(&self, path: &str) -> Option<&ObjectEntry> {
        self.objects.get(path).or_else(|| self.fallback_for(path))
    }

    /// Names of the direct children of `path` that lead to exported objects.
    fn children(&self, path: &str) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        for p in self.objects.keys() {
            let rest = if path == "/" {
                p.strip_prefix('/')
            } else {
                p.strip_prefix(path).and_then(|r| r.strip_prefix('/'))
            };
            if let Some(rest) = rest {
                if let Some(first) = rest.split('/').next().filter(|s| !s.is_empty()) {
                    out.insert(first);
                }
            }
        }
        out
    }

    /// Introspection XML for `path`, or `None` when nothing lives there.
    pub fn introspect(&self, path: &str) -> Option<String> {
        let entry = self.lookup(path);
        let children = self.children(path);
        if entry.is_none() && children.is_empty() {
            return None;
        }
        let mut out = String::from(INTROSPECT_DOCTYPE);
        let _ = writeln!(out, "<node name=\"{}\">", path);
        if let Some(entry) = entry {
            entry.introspect_interfaces(&mut out);
            if entry.has_properties() {
                properties::introspection(&mut out);
            }
        }
        builtin_introspection(&mut out);
        for child in children {
            let _ = writeln!(out, " <node name=\"{}\"/>", child);
        }
        out.push_str("</node>\n");
        Some(out)
    }

    /// Finds what should answer `call`.
    pub fn resolve(&self, call: &MethodCall) -> Result<Target> {
        let interface = call.interface.as_deref();
        let signature = call.opt.signature.as_str();
        let mut member_seen = false;
        let entry = self.lookup(&call.path);
        if let Some(entry) = entry {
            match entry.find(interface, &call.member, signature) {
                Ok(m) => return Ok(Target::Method(m)),
                Err(seen) => member_seen = seen,
            }
            if let Some(p) = entry.property_call(call)? {
                return Ok(Target::Property(p));
            }
        }

        if signature.is_empty() {
            match (interface, call.member.as_str()) {
                (Some(PEER_INTERFACE), "Ping") | (None, "Ping") => return Ok(Target::Ping),
                (Some(PEER_INTERFACE), "GetMachineId") | (None, "GetMachineId") => return Ok(Target::GetMachineId),
                (Some(INTROSPECTABLE_INTERFACE), "Introspect") | (None, "Introspect") => {
                    return match self.introspect(&call.path) {
                        Some(xml) => Ok(Target::Introspect(xml)),
                        None => Err(Error::remote(
                            names::UNKNOWN_OBJECT,
                            format!("introspecting on non-existent object {}", call.path),
                        )),
                    };
                }
                _ => (),
            }
        }

        if entry.is_none() {
            return Err(Error::remote(names::UNKNOWN_OBJECT, format!("no object at {}", call.path)));
        }
        let what = if member_seen { "signature" } else { "method" };
        Err(Error::remote(
            names::UNKNOWN_METHOD,
            format!(
                "no {} {}.{}({}) at {}",
                what,
                interface.unwrap_or("*"),
                call.member,
                signature,
                call.path
            ),
        ))
    }
}

fn is_under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix || path.strip_prefix(prefix).map_or(false, |r| r.starts_with('/'))
}

fn builtin_introspection(out: &mut String) {
    let _ = writeln!(out, " <interface name=\"{}\">", INTROSPECTABLE_INTERFACE);
    out.push_str("  <method name=\"Introspect\">\n   <arg type=\"s\" direction=\"out\"/>\n  </method>\n");
    out.push_str(" </interface>\n");
    let _ = writeln!(out, " <interface name=\"{}\">", PEER_INTERFACE);
    out.push_str("  <method name=\"Ping\">\n  </method>\n");
    out.push_str("  <method name=\"GetMachineId\">\n   <arg type=\"s\" direction=\"out\"/>\n  </method>\n");
    out.push_str(" </interface>\n");
}

lazy_static! {
    static ref MACHINE_ID: String = read_machine_id().unwrap_or_else(|| hex::encode(rand::random::<[u8; 16]>()));
}

fn read_machine_id() -> Option<String> {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .filter_map(|p| fs::read_to_string(p).ok())
        .map(|s| s.trim().to_owned())
        .find(|s| s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit()))
}

/// The host's D-Bus machine id; a random one, fixed for the process, when
/// the host has none.
pub fn machine_id() -> &'static str {
    &MACHINE_ID
}

#[cfg(test)]
mod test {
    use super::*;
    use super::message_types::{decode_message, MessageType};
    use crate::convert::Detached;
    use crate::message::create_method_call;
    use crate::signature::TypeDescriptor as T;
    use crate::types::Variant;

    fn call(path: &str, iface: Option<&str>, member: &str, args: Vec<Value>) -> MethodCall {
        let mut msg = create_method_call(None, path, iface, member);
        msg.body = args;
        msg.serial = 9;
        let sig = crate::marshal::body_signature(&msg.body);
        if !sig.is_empty() {
            msg.set_header(message::HeaderFieldName::Signature, Value::Signature(crate::types::Signature(sig)));
        }
        match decode_message(msg).unwrap() {
            MessageType::Method(m) => m,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn echo_object() -> ExportedObject {
        ExportedObject::new().interface(
            InterfaceImpl::new("org.foo")
                .method("Echo", vec![T::String], Some(T::String), |_, args| Ok(args.into_iter().next()))
                .method("Echo", vec![T::Int32], Some(T::Int32), |_, args| Ok(args.into_iter().next()))
                .method("Nothing", vec![], None, |_, _| Ok(None))
                .signal("Changed", vec![T::String]),
        )
    }

    #[test]
    fn test_resolve_by_member_and_signature() {
        let cache = SignatureCache::new();
        let mut table = ObjectTable::new();
        table.export("/Test", echo_object(), &cache).unwrap();

        let c = call("/Test", Some("org.foo"), "Echo", vec![Value::from("hi")]);
        let m = match table.resolve(&c).unwrap() {
            Target::Method(m) => m,
            _ => panic!("expected a method"),
        };
        assert_eq!(m.in_signature, "s");
        let reply = m.invoke(&CallInfo::new(&c), c.body.clone(), &cache, &Detached).unwrap();
        assert_eq!(reply, vec![Value::from("hi")]);

        let c = call("/Test", None, "Echo", vec![Value::Int32(3)]);
        match table.resolve(&c).unwrap() {
            Target::Method(m) => assert_eq!(m.in_signature, "i"),
            _ => panic!("expected a method"),
        }
    }

    fn remote_name(r: Result<Target>) -> String {
        match r {
            Err(Error::Remote { name, .. }) => name,
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn test_unknown_object_and_method() {
        let cache = SignatureCache::new();
        let mut table = ObjectTable::new();
        table.export("/Test", echo_object(), &cache).unwrap();

        let c = call("/Nope", Some("org.foo"), "Echo", vec![Value::from("hi")]);
        assert_eq!(remote_name(table.resolve(&c)), names::UNKNOWN_OBJECT);
        let c = call("/Test", Some("org.foo"), "Missing", vec![]);
        assert_eq!(remote_name(table.resolve(&c)), names::UNKNOWN_METHOD);
        let c = call("/Test", Some("org.foo"), "Echo", vec![Value::Boolean(true)]);
        assert_eq!(remote_name(table.resolve(&c)), names::UNKNOWN_METHOD);
    }

    #[test]
    fn test_fallback_longest_prefix() {
        let cache = SignatureCache::new();
        let mut table = ObjectTable::new();
        let tagged = |tag: &'static str| {
            ExportedObject::new().interface(InterfaceImpl::new("org.foo").method(
                "Who",
                vec![],
                Some(T::String),
                move |_, _| Ok(Some(Value::from(tag))),
            ))
        };
        table.add_fallback("/a", tagged("a"), &cache).unwrap();
        table.add_fallback("/a/b", tagged("ab"), &cache).unwrap();
        table.export("/a/b/exact", tagged("exact"), &cache).unwrap();

        let who = |path: &str| {
            let c = call(path, Some("org.foo"), "Who", vec![]);
            match table.resolve(&c).unwrap() {
                Target::Method(m) => m.invoke(&CallInfo::new(&c), vec![], &cache, &Detached).unwrap(),
                _ => panic!("expected a method"),
            }
        };
        assert_eq!(who("/a/x"), vec![Value::from("a")]);
        assert_eq!(who("/a/b/c/d"), vec![Value::from("ab")]);
        assert_eq!(who("/a/b/exact"), vec![Value::from("exact")]);
        // "/ab" is not below "/a"
        let c = call("/ab", Some("org.foo"), "Who", vec![]);
        assert_eq!(remote_name(table.resolve(&c)), names::UNKNOWN_OBJECT);
        assert!(table.remove_fallback("/a"));
        let c = call("/a/x", Some("org.foo"), "Who", vec![]);
        assert_eq!(remote_name(table.resolve(&c)), names::UNKNOWN_OBJECT);
    }

    #[test]
    fn test_builtin_peer_and_introspect() {
        let cache = SignatureCache::new();
        let mut table = ObjectTable::new();
        table.export("/org/foo/Obj", echo_object(), &cache).unwrap();

        assert!(matches!(table.resolve(&call("/any/where", Some(PEER_INTERFACE), "Ping", vec![])), Ok(Target::Ping)));
        assert!(matches!(
            table.resolve(&call("/", Some(PEER_INTERFACE), "GetMachineId", vec![])),
            Ok(Target::GetMachineId)
        ));
        assert_eq!(machine_id().len(), 32);

        let xml = match table.resolve(&call("/org/foo/Obj", Some(INTROSPECTABLE_INTERFACE), "Introspect", vec![])) {
            Ok(Target::Introspect(xml)) => xml,
            _ => panic!("expected introspection data"),
        };
        assert!(xml.starts_with("<!DOCTYPE node PUBLIC"));
        assert!(xml.contains("<interface name=\"org.foo\">"));
        assert!(xml.contains("<method name=\"Echo\">"));
        assert!(xml.contains("<signal name=\"Changed\">"));

        let root = table.introspect("/org").unwrap();
        assert!(root.contains("<node name=\"foo\"/>"));
        assert!(!root.contains("org.foo"));
        let c = call("/nothing", Some(INTROSPECTABLE_INTERFACE), "Introspect", vec![]);
        assert_eq!(remote_name(table.resolve(&c)), names::UNKNOWN_OBJECT);
    }

    #[test]
    fn test_export_validation() {
        let cache = SignatureCache::new();
        let mut table = ObjectTable::new();
        assert!(matches!(table.export("no/slash", echo_object(), &cache), Err(Error::Export(_))));
        table.export("/x", echo_object(), &cache).unwrap();
        assert!(matches!(table.export("/x", echo_object(), &cache), Err(Error::Export(_))));
        let bad = ExportedObject::new().interface(InterfaceImpl::new("nodots"));
        assert!(matches!(table.export("/y", bad, &cache), Err(Error::Export(_))));
        let bad_key = ExportedObject::new().interface(InterfaceImpl::new("org.foo").method(
            "M",
            vec![T::map(T::array(T::Byte), T::String)],
            None,
            |_, _| Ok(None),
        ));
        assert!(matches!(table.export("/z", bad_key, &cache), Err(Error::TypeConversion(_))));
        assert!(table.unexport("/x"));
        assert!(!table.is_exported("/x"));
        assert!(!table.unexport("/x"));
    }

    #[test]
    fn test_handler_fault_and_missing_value() {
        let cache = SignatureCache::new();
        let mut table = ObjectTable::new();
        let obj = ExportedObject::new().interface(
            InterfaceImpl::new("org.foo")
                .method("Fail", vec![], None, |_, _| Err(Error::remote("org.foo.Error.Nope", "nope")))
                .method("Empty", vec![], Some(T::String), |_, _| Ok(None)),
        );
        table.export("/f", obj, &cache).unwrap();
        for (member, name) in [("Fail", "org.foo.Error.Nope"), ("Empty", names::FAILED)] {
            let c = call("/f", Some("org.foo"), member, vec![]);
            let m = match table.resolve(&c).unwrap() {
                Target::Method(m) => m,
                _ => panic!("expected a method"),
            };
            let err = m.invoke(&CallInfo::new(&c), vec![], &cache, &Detached).unwrap_err();
            assert_eq!(err.dbus_name(), name);
        }
    }

    fn volume_object(volume: Arc<parking_lot::Mutex<u32>>) -> ExportedObject {
        let read = volume.clone();
        ExportedObject::new().interface(
            InterfaceImpl::new("org.foo.Player")
                .method("Stop", vec![], None, |_, _| Ok(None))
                .writable_property(
                    "Volume",
                    T::UInt32,
                    move |_| Ok(Value::UInt32(*read.lock())),
                    move |_, v| match v {
                        Value::UInt32(n) => {
                            *volume.lock() = n;
                            Ok(())
                        }
                        other => panic!("unexpected {:?}", other),
                    },
                )
                .property("Name", T::String, |_| Ok(Value::from("player"))),
        )
    }

    fn run_property(table: &ObjectTable, c: &MethodCall, cache: &SignatureCache) -> Result<Vec<Value>> {
        match table.resolve(c)? {
            Target::Property(p) => p.run(&CallInfo::new(c), cache, &Detached),
            _ => panic!("expected a property call"),
        }
    }

    #[test]
    fn test_properties_get_set_get_all() {
        let cache = SignatureCache::new();
        let mut table = ObjectTable::new();
        let volume = Arc::new(parking_lot::Mutex::new(3));
        table.export("/player", volume_object(volume.clone()), &cache).unwrap();

        let get = call("/player", Some(PROPERTIES_INTERFACE), "Get", vec![Value::from("org.foo.Player"), Value::from("Volume")]);
        assert_eq!(run_property(&table, &get, &cache).unwrap(), vec![Value::Variant(Variant::new(Value::UInt32(3), "u"))]);

        let set = call(
            "/player",
            Some(PROPERTIES_INTERFACE),
            "Set",
            vec![Value::from(""), Value::from("Volume"), Value::Variant(Variant::new(Value::UInt32(9), "u"))],
        );
        assert!(run_property(&table, &set, &cache).unwrap().is_empty());
        assert_eq!(*volume.lock(), 9);

        let all = call("/player", Some(PROPERTIES_INTERFACE), "GetAll", vec![Value::from("org.foo.Player")]);
        match &run_property(&table, &all, &cache).unwrap()[..] {
            [Value::Dictionary(d)] => {
                assert_eq!(d.entries.len(), 2);
                assert_eq!(d.entries[0], (Value::from("Volume"), Value::Variant(Variant::new(Value::UInt32(9), "u"))));
                assert_eq!(d.entries[1], (Value::from("Name"), Value::Variant(Variant::new(Value::from("player"), "s"))));
            }
            other => panic!("unexpected {:?}", other),
        }

        // a Stop method next to the properties still resolves normally
        assert!(matches!(table.resolve(&call("/player", None, "Stop", vec![])), Ok(Target::Method(_))));
    }

    #[test]
    fn test_property_errors() {
        let cache = SignatureCache::new();
        let mut table = ObjectTable::new();
        table.export("/player", volume_object(Arc::new(parking_lot::Mutex::new(0))), &cache).unwrap();

        let get = call("/player", Some(PROPERTIES_INTERFACE), "Get", vec![Value::from("org.foo.Player"), Value::from("Speed")]);
        assert_eq!(remote_name(table.resolve(&get)), names::UNKNOWN_PROPERTY);
        let get = call("/player", Some(PROPERTIES_INTERFACE), "Get", vec![Value::from("org.bar"), Value::from("Volume")]);
        assert_eq!(remote_name(table.resolve(&get)), names::UNKNOWN_PROPERTY);

        let set_name = call(
            "/player",
            Some(PROPERTIES_INTERFACE),
            "Set",
            vec![Value::from("org.foo.Player"), Value::from("Name"), Value::Variant(Variant::new(Value::from("x"), "s"))],
        );
        assert_eq!(run_property(&table, &set_name, &cache).unwrap_err().dbus_name(), names::PROPERTY_READ_ONLY);

        let set_wrong_type = call(
            "/player",
            Some(PROPERTIES_INTERFACE),
            "Set",
            vec![Value::from("org.foo.Player"), Value::from("Volume"), Value::Variant(Variant::new(Value::from("loud"), "s"))],
        );
        assert_eq!(run_property(&table, &set_wrong_type, &cache).unwrap_err().dbus_name(), names::INVALID_ARGS);

        let all = call("/player", Some(PROPERTIES_INTERFACE), "GetAll", vec![Value::from("org.bar")]);
        assert_eq!(remote_name(table.resolve(&all)), names::UNKNOWN_INTERFACE);
        let bad_args = call("/player", Some(PROPERTIES_INTERFACE), "Get", vec![Value::from("org.foo.Player")]);
        assert_eq!(remote_name(table.resolve(&bad_args)), names::UNKNOWN_METHOD);

        let dup = ExportedObject::new().interface(
            InterfaceImpl::new("org.foo").property("P", T::Byte, |_| Ok(Value::Byte(1))).property("P", T::Byte, |_| Ok(Value::Byte(2))),
        );
        assert!(matches!(table.export("/dup", dup, &cache), Err(Error::Export(_))));
    }

    #[test]
    fn test_properties_in_introspection() {
        let cache = SignatureCache::new();
        let mut table = ObjectTable::new();
        table.export("/player", volume_object(Arc::new(parking_lot::Mutex::new(0))), &cache).unwrap();
        table.export("/plain", echo_object(), &cache).unwrap();

        let xml = table.introspect("/player").unwrap();
        assert!(xml.contains("<property name=\"Volume\" type=\"u\" access=\"readwrite\"/>"));
        assert!(xml.contains("<property name=\"Name\" type=\"s\" access=\"read\"/>"));
        assert!(xml.contains("<interface name=\"org.freedesktop.DBus.Properties\">"));
        assert!(xml.contains("<signal name=\"PropertiesChanged\">"));
        assert!(!table.introspect("/plain").unwrap().contains(PROPERTIES_INTERFACE));
    }
}
