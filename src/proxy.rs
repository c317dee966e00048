//! Calling methods on remote objects through a declared interface.
//!
//! An [`InterfaceSpec`] lists the methods a remote object is expected to
//! implement. A [`Proxy`] binds one to a [`RemoteObject`] on a connection and
//! turns each call into a method call message, then turns the reply back
//! into a value of the declared return type.

use std::slice;
use std::time::Duration;

use log::trace;

use crate::connection::{Connection, MessageSender, PendingReply};
use crate::convert::{self, Converted, ObjectContext};
use crate::error::{names, Error, Result};
use crate::marshal::body_signature;
use crate::message::{self, flags, valid_interface_name, valid_member_name, Message};
use crate::signature::{SignatureCache, TypeDescriptor};
use crate::types::{ObjectPath, RemoteObject, Value};

/// One method of a remote interface.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    /// Member name on the wire, when it differs from `name`.
    pub member: Option<String>,
    pub params: Vec<TypeDescriptor>,
    /// `None` for a method returning nothing.
    pub ret: Option<TypeDescriptor>,
    /// Sent flagged `NO_REPLY_EXPECTED`; calls return at once.
    pub no_reply: bool,
}

impl MethodSpec {
    pub fn new(name: &str, params: Vec<TypeDescriptor>, ret: Option<TypeDescriptor>) -> Self {
        MethodSpec { name: name.to_owned(), member: None, params, ret, no_reply: false }
    }

    pub fn member(mut self, wire_name: &str) -> Self {
        self.member = Some(wire_name.to_owned());
        self
    }

    pub fn no_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }

    pub fn wire_name(&self) -> &str {
        self.member.as_deref().unwrap_or(&self.name)
    }
}

/// A remote interface: its name and its methods. Methods may be overloaded
/// on their parameter types.
#[derive(Debug, Clone)]
pub struct InterfaceSpec {
    pub name: String,
    pub methods: Vec<MethodSpec>,
}

impl InterfaceSpec {
    pub fn new(name: &str) -> Self {
        InterfaceSpec { name: name.to_owned(), methods: Vec::new() }
    }

    pub fn method(mut self, m: MethodSpec) -> Self {
        self.methods.push(m);
        self
    }
}

/// Inbound conversion only needs to know who the peer is.
struct Peer<'a>(Option<&'a str>);

impl<'a> ObjectContext for Peer<'a> {
    fn is_exported(&self, _path: &str) -> bool {
        false
    }

    fn remote_object(&self, path: ObjectPath, interface: &str) -> RemoteObject {
        RemoteObject::new(self.0, path.as_str(), Some(interface))
    }
}

/// Converts a reply body against the declared return type.
///
/// No values needs a void method; one value maps directly; more than one
/// needs a tuple (or struct) return of the same arity.
pub fn convert_rv(ret: Option<&TypeDescriptor>, values: Vec<Value>, ctx: &dyn ObjectContext) -> Result<Option<Value>> {
    let t = match (ret, values.len()) {
        (None, 0) => return Ok(None),
        (None, n) => return Err(Error::WrongReturnType(format!("expected no value, got {}", n))),
        (Some(_), 0) => return Err(Error::WrongReturnType("got void, expected a value".into())),
        (Some(t), 1) => t,
        (Some(t), n) => match t {
            TypeDescriptor::Tuple(_) | TypeDescriptor::Struct(_) | TypeDescriptor::Custom(_) => t,
            _ => return Err(Error::WrongReturnType(format!("not expecting a tuple, got {} values", n))),
        },
    };
    let mut out = convert::convert_in(values, slice::from_ref(t), ctx, true)
        .map_err(|e| Error::WrongReturnType(format!("failed to de-serialize correct types: {}", e)))?;
    Ok(out.pop())
}

/// The reply to an asynchronous proxy call.
pub struct AsyncReply {
    reply: PendingReply,
    ret: Option<TypeDescriptor>,
    peer: Option<String>,
}

impl AsyncReply {
    pub fn serial(&self) -> u32 {
        self.reply.serial()
    }

    pub fn has_reply(&self) -> bool {
        self.reply.has_reply()
    }

    fn convert(&self, values: Result<Vec<Value>>) -> Result<Option<Value>> {
        convert_rv(self.ret.as_ref(), values?, &Peer(self.peer.as_deref()))
    }

    /// Blocks until the reply arrives.
    pub fn get_reply(&self) -> Result<Option<Value>> {
        self.convert(self.reply.wait())
    }

    /// `None` when no reply arrived within `timeout`.
    pub fn get_reply_timeout(&self, timeout: Duration) -> Option<Result<Option<Value>>> {
        self.reply.wait_timeout(timeout).map(|r| self.convert(r))
    }
}

/// Signature of the declared parameter types, checked against the converted values.
fn wire_signature(converted: &Converted, cache: &SignatureCache) -> Result<String> {
    let declared = converted.signature(cache)?;
    let actual = body_signature(&converted.values);
    if declared != actual {
        return Err(Error::TypeConversion(format!(
            "arguments convert to {} but the method declares {}", actual, declared)));
    }
    Ok(declared)
}

pub struct Proxy {
    conn: Connection,
    remote: RemoteObject,
    interface: InterfaceSpec,
}

impl Proxy {
    /// Binds `interface` to `remote`. The interface name goes into the
    /// remote object's description.
    pub fn new(conn: &Connection, mut remote: RemoteObject, interface: InterfaceSpec) -> Result<Proxy> {
        if !valid_interface_name(&interface.name) {
            return Err(Error::InvalidMessage(format!("invalid interface name {:?}", interface.name)));
        }
        if !message::valid_object_path(remote.path.as_str()) {
            return Err(Error::InvalidMessage(format!("invalid object path {:?}", remote.path.as_str())));
        }
        for m in &interface.methods {
            if !valid_member_name(m.wire_name()) {
                return Err(Error::InvalidMessage(format!("invalid member name {:?}", m.wire_name())));
            }
        }
        remote.interface = Some(interface.name.clone());
        Ok(Proxy { conn: conn.clone(), remote, interface })
    }

    pub fn remote(&self) -> &RemoteObject {
        &self.remote
    }

    /// Picks the overload of `name` the arguments convert to and builds the
    /// method call for it.
    fn plan(&self, name: &str, args: Vec<Value>, extra_flags: u8) -> Result<(&MethodSpec, Message)> {
        let candidates: Vec<&MethodSpec> = self.interface.methods.iter().filter(|m| m.name == name).collect();
        let ctx = self.conn.objects(self.remote.bus_name.as_deref());
        let cache = self.conn.signature_cache();
        let mut last_err = None;
        for spec in candidates {
            let planned = convert::convert_out(args.clone(), &spec.params, &[], cache, &ctx)
                .and_then(|converted| wire_signature(&converted, cache).map(|sig| (converted, sig)));
            match planned {
                Ok((converted, signature)) => {
                    let mut msg = message::create_method_call(
                        self.remote.bus_name.as_deref(),
                        self.remote.path.as_str(),
                        Some(&self.interface.name),
                        spec.wire_name(),
                    );
                    msg.body = converted.values;
                    let mut f = extra_flags;
                    if !self.remote.autostart {
                        f |= flags::NO_AUTO_START;
                    }
                    if spec.no_reply {
                        f |= flags::NO_REPLY_EXPECTED;
                    }
                    trace!(
                        "calling {}.{}({}) on {}",
                        self.interface.name,
                        spec.wire_name(),
                        signature,
                        self.remote.path.as_str()
                    );
                    return Ok((spec, msg.add_flags(f)));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::remote(names::UNKNOWN_METHOD, format!("{} declares no method {}", self.interface.name, name))
        }))
    }

    /// Calls `name` and blocks for the converted return value. One-way
    /// methods return `Ok(None)` as soon as the call is sent.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Option<Value>> {
        let (spec, msg) = self.plan(name, args, 0)?;
        if spec.no_reply {
            self.conn.send(msg)?;
            return Ok(None);
        }
        let values = self.conn.call_sync(msg)?;
        convert_rv(spec.ret.as_ref(), values, &Peer(self.remote.bus_name.as_deref()))
    }

    /// Sends the call and returns a handle to its future reply.
    pub fn call_async(&self, name: &str, args: Vec<Value>) -> Result<AsyncReply> {
        let (spec, msg) = self.plan(name, args, flags::ASYNC)?;
        if spec.no_reply {
            return Err(Error::InvalidMessage(format!("{} expects no reply", name)));
        }
        let reply = self.conn.call_async(msg)?;
        Ok(AsyncReply { reply, ret: spec.ret.clone(), peer: self.remote.bus_name.clone() })
    }

    /// Sends the call; `callback` runs on the connection's worker pool with
    /// the converted reply.
    pub fn call_with_callback<F>(&self, name: &str, args: Vec<Value>, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Option<Value>>) + Send + 'static,
    {
        let (spec, msg) = self.plan(name, args, 0)?;
        if spec.no_reply {
            return Err(Error::InvalidMessage(format!("{} expects no reply", name)));
        }
        let ret = spec.ret.clone();
        let peer = self.remote.bus_name.clone();
        self.conn.call_with_callback(msg, move |res| {
            callback(res.and_then(|values| convert_rv(ret.as_ref(), values, &Peer(peer.as_deref()))))
        })
    }

    /// Sends the call flagged `NO_REPLY_EXPECTED`, whatever the method
    /// declares, and returns at once.
    pub fn call_one_way(&self, name: &str, args: Vec<Value>) -> Result<u32> {
        let (_, msg) = self.plan(name, args, flags::NO_REPLY_EXPECTED)?;
        self.conn.send(msg)
    }
}
