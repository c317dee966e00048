//! Deals with creating and using connections to a bus daemon or a peer.
//! The primary type of interest is the Connection struct.
//!
//! A connection owns one reader thread, one sender thread and a worker pool.
//! The reader classifies every inbound frame: replies complete the call
//! waiting on their serial, method calls are resolved against the exported
//! objects and run on the pool, signals are routed through the match rules
//! and each handler runs on the pool.
//!
//! # Examples
//! ```no_run
//! use dbus_endpoint::connection::{Connection, MessageSender};
//! use dbus_endpoint::message;
//!
//! let conn = Connection::connect_system().unwrap();
//! let msg = message::create_method_call(
//!     Some("org.freedesktop.DBus"), // destination
//!     "/org/freedesktop/DBus", // path
//!     Some("org.freedesktop.DBus"), // interface
//!     "ListNames" // method
//! );
//! let reply = conn.call_sync(msg);
//! println!("{:?}", reply);
//! ```

mod pending;
mod sender;
mod workers;

pub use self::pending::PendingReply;

use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use self::pending::{Completion, PendingCalls, ReplySlot};
use self::sender::SerialSender;
use self::workers::{Job, WorkerPool};
use crate::config::{self, ConnectionConfig};
use crate::convert::ObjectContext;
use crate::dispatch::message_types::{decode_message, MessageType, Signal};
use crate::dispatch::properties::properties_changed_args;
use crate::dispatch::{machine_id, CallInfo, ExportedObject, ObjectTable, Target, PROPERTIES_INTERFACE};
use crate::error::{names, Error, Result};
use crate::match_rule::{HandlerId, MatchRule, SignalTable};
use crate::message::{
    self, flags, Message, MESSAGE_TYPE_ERROR, MESSAGE_TYPE_METHOD_CALL, MESSAGE_TYPE_METHOD_RETURN,
};
use crate::sasl::Sasl;
use crate::signature::SignatureCache;
use crate::transport::{self, Listener, MessageReader, Transport};
use crate::types::{ObjectPath, RemoteObject, Value};

pub const DBUS_NAME: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const LOCAL_PATH: &str = "/org/freedesktop/DBus/Local";
pub const LOCAL_INTERFACE: &str = "org.freedesktop.DBus.Local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connected,
    Disconnecting,
    Disconnected,
}

struct Inner {
    config: ConnectionConfig,
    cache: SignatureCache,
    bus: bool,
    guid: Option<String>,
    pending: Mutex<PendingCalls>,
    signals: RwLock<SignalTable>,
    objects: RwLock<ObjectTable>,
    workers: RwLock<Option<WorkerPool>>,
    sender: Arc<SerialSender>,
    errors: Mutex<VecDeque<Error>>,
    state: Mutex<State>,
    unique_name: Mutex<Option<String>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// A live connection. Clones share the same underlying connection, which is
/// disconnected when the last clone goes away.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Keeps an object exported; dropping it unexports the object.
pub struct ExportHandle {
    conn: Weak<Inner>,
    path: String,
    armed: bool,
}

impl ExportHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Leaves the object exported until it is explicitly unexported.
    pub fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for ExportHandle {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(inner) = self.conn.upgrade() {
            if inner.objects.write().unexport(&self.path) {
                info!("implicitly unexported {}", self.path);
            }
        }
    }
}

/// Resolves object references against one connection's export table.
pub(crate) struct Objects<'a> {
    inner: &'a Inner,
    peer: Option<&'a str>,
}

impl<'a> ObjectContext for Objects<'a> {
    fn is_exported(&self, path: &str) -> bool {
        self.inner.objects.read().is_exported(path)
    }

    fn remote_object(&self, path: ObjectPath, interface: &str) -> RemoteObject {
        RemoteObject::new(self.peer, path.as_str(), Some(interface))
    }
}

pub trait MessageSender {
    /// Sends a message over the connection. On success, returns the serial
    /// number the message went out with. Replies to a method call sent this
    /// way are not tracked.
    fn send(&self, msg: Message) -> Result<u32>;

    /// Sends a method call and blocks until its reply arrives. Returns the
    /// body of the method return; an Error reply is returned as `Err`.
    fn call_sync(&self, msg: Message) -> Result<Vec<Value>>;
}

fn check_call(msg: &Message) -> Result<()> {
    if msg.message_type != MESSAGE_TYPE_METHOD_CALL {
        return Err(Error::InvalidMessage(format!("expected a method call, got a {}", msg.message_type.name())));
    }
    if !msg.expects_reply() {
        return Err(Error::InvalidMessage("method call is flagged NO_REPLY_EXPECTED".into()));
    }
    Ok(())
}

/// Runs a handler, turning a panic into a `Failed` error naming `what`.
fn guarded<T>(what: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panicked".to_owned());
        error!("{} panicked: {}", what, reason);
        Err(Error::remote(names::FAILED, format!("Error executing {}: {}", what, reason)))
    })
}

impl Inner {
    fn is_connected(&self) -> bool {
        *self.state.lock() == State::Connected
    }

    /// Runs `job` on the pool, or inline once the pool has been shut down.
    fn run_job(&self, job: Job) {
        let workers = self.workers.read();
        match workers.as_ref() {
            Some(pool) => {
                if let Err(e) = pool.execute(job) {
                    debug!("dropping job: {}", e);
                }
            }
            None => {
                drop(workers);
                job();
            }
        }
    }

    /// Allocates a serial and queues `msg`. Sends keep working while the
    /// pool drains during disconnection; the closed queue refuses them after.
    fn send_message(&self, mut msg: Message, completion: Option<Completion>) -> Result<u32> {
        msg.validate()?;
        let mut pending = self.pending.lock();
        let serial = pending.allocate();
        msg.serial = serial;
        let tracked = completion.is_some();
        if let Some(c) = completion {
            pending.register(serial, c)?;
        }
        trace!("queueing {} serial {}", msg.message_type.name(), serial);
        if let Err(e) = self.sender.enqueue(msg) {
            if tracked {
                pending.take(serial);
            }
            return Err(e);
        }
        Ok(serial)
    }

    fn complete(&self, completion: Completion, msg: Message) {
        match completion {
            Completion::Callback(cb) => self.run_job(Box::new(move || cb(msg))),
            sync => sync.complete(msg),
        }
    }

    fn dispatch(self: &Arc<Self>, msg: Message) {
        debug!(
            "received {} serial {} {}.{} from {:?}",
            msg.message_type.name(),
            msg.serial,
            msg.interface().unwrap_or("*"),
            msg.member().or_else(|| msg.error_name()).unwrap_or("*"),
            msg.sender()
        );
        match msg.message_type {
            MESSAGE_TYPE_METHOD_RETURN | MESSAGE_TYPE_ERROR => self.handle_reply(msg),
            _ => match decode_message(msg) {
                Ok(MessageType::Method(call)) => self.handle_call(call),
                Ok(MessageType::Signal(sig)) => self.handle_signal(sig),
                Ok(_) => (),
                Err(e) => warn!("dropping malformed message: {:?}", e),
            },
        }
    }

    fn handle_reply(&self, msg: Message) {
        let serial = match msg.reply_serial() {
            Some(s) => s,
            None => {
                warn!("dropping {} without a reply serial", msg.message_type.name());
                return;
            }
        };
        let completion = self.pending.lock().take(serial);
        match completion {
            Some(c) => self.complete(c, msg),
            None if msg.message_type == MESSAGE_TYPE_ERROR => {
                debug!("queueing unmatched error for serial {}", serial);
                if let Err(e) = pending::reply_result(msg) {
                    self.errors.lock().push_back(e);
                }
            }
            None => {
                info!("spurious reply to serial {} from {:?}", serial, msg.sender());
                let mut err = message::create_error(
                    names::FAILED,
                    msg.serial,
                    "Spurious reply. No message with the specified reply serial in queue.",
                );
                err.set_destination(msg.sender());
                if let Err(e) = self.send_message(err, None) {
                    debug!("could not answer spurious reply: {}", e);
                }
            }
        }
    }

    fn reply(&self, info: &CallInfo, result: Result<Vec<Value>>) {
        if !info.expects_reply() {
            return;
        }
        let mut msg = match result {
            Ok(values) => {
                let mut m = message::create_method_return(info.serial);
                m.body = values;
                m
            }
            Err(e) => message::create_error(e.dbus_name(), info.serial, &e.dbus_message()),
        };
        if let Err(e) = msg.validate() {
            warn!("cannot send the return for serial {}: {}", info.serial, e);
            msg = message::create_error(e.dbus_name(), info.serial, &e.dbus_message());
        }
        msg.set_destination(info.sender.as_deref());
        if let Err(e) = self.send_message(msg, None) {
            debug!("could not reply to serial {}: {}", info.serial, e);
        }
    }

    fn handle_call(self: &Arc<Self>, call: crate::dispatch::message_types::MethodCall) {
        let info = CallInfo::new(&call);
        let target = self.objects.read().resolve(&call);
        let target = match target {
            Ok(t) => t,
            Err(e) => {
                debug!("cannot dispatch {}.{} on {}: {}", info.interface.as_deref().unwrap_or("*"), info.member, info.path, e);
                self.reply(&info, Err(e));
                return;
            }
        };
        let inner = self.clone();
        let body = call.body;
        self.run_job(Box::new(move || {
            let result = match target {
                Target::Method(m) => {
                    let ctx = Objects { inner: &inner, peer: info.sender.as_deref() };
                    let what = format!("method {}.{}", m.interface, m.member);
                    guarded(&what, || m.invoke(&info, body, &inner.cache, &ctx))
                }
                Target::Property(p) => {
                    let ctx = Objects { inner: &inner, peer: info.sender.as_deref() };
                    let what = format!("{}.{} on {}", PROPERTIES_INTERFACE, info.member, info.path);
                    guarded(&what, || p.run(&info, &inner.cache, &ctx))
                }
                Target::Ping => Ok(Vec::new()),
                Target::GetMachineId => Ok(vec![Value::from(machine_id())]),
                Target::Introspect(xml) => Ok(vec![Value::String(xml)]),
            };
            if let Err(e) = &result {
                warn!("{}.{} on {} failed: {}", info.interface.as_deref().unwrap_or("*"), info.member, info.path, e);
            }
            inner.reply(&info, result);
        }));
    }

    fn handle_signal(self: &Arc<Self>, sig: Signal) {
        if sig.interface == LOCAL_INTERFACE {
            warn!("dropping {}.{} signal received from {:?}", sig.interface, sig.member, sig.opt.sender);
            return;
        }
        let handlers = self.signals.read().handlers_for(&sig);
        if handlers.is_empty() {
            trace!("no handler for signal {}.{}", sig.interface, sig.member);
            return;
        }
        let sig = Arc::new(sig);
        for (id, handler) in handlers {
            let inner = self.clone();
            let sig = sig.clone();
            self.run_job(Box::new(move || {
                let what = format!("signal handler for {}.{}", sig.interface, sig.member);
                if let Err(e) = guarded(&what, || handler(&sig)) {
                    warn!("signal handler {:?} for {}.{} failed: {}", id, sig.interface, sig.member, e);
                    let mut err = message::create_error(e.dbus_name(), sig.opt.serial, &e.dbus_message());
                    err.set_destination(sig.opt.sender.as_deref());
                    if let Err(e) = inner.send_message(err, None) {
                        debug!("could not report signal handler fault: {}", e);
                    }
                }
            }));
        }
    }

    /// Delivers the local Disconnected signal on the calling thread.
    fn emit_disconnected(&self) {
        let sig = Signal {
            path: LOCAL_PATH.to_owned(),
            interface: LOCAL_INTERFACE.to_owned(),
            member: "Disconnected".to_owned(),
            opt: Default::default(),
            body: Vec::new(),
        };
        let handlers = self.signals.read().handlers_for(&sig);
        for (id, handler) in handlers {
            if let Err(e) = guarded("Disconnected handler", || handler(&sig)) {
                warn!("Disconnected handler {:?} failed: {}", id, e);
            }
        }
    }

    fn write_failed(&self, msg: &Message, e: Error) {
        warn!("failed to send {} serial {}: {}", msg.message_type.name(), msg.serial, e);
        if msg.expects_reply() {
            let completion = self.pending.lock().take(msg.serial);
            if let Some(c) = completion {
                self.complete(c, pending::send_failed_reply(msg.serial));
            }
        }
        if let Error::Io(_) = e {
            self.disconnect();
        }
    }

    fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            if *state != State::Connected {
                return;
            }
            *state = State::Disconnecting;
        }
        debug!("disconnecting");
        self.emit_disconnected();

        let pool = self.workers.write().take();
        if let Some(pool) = pool {
            if !pool.shutdown(self.config.shutdown_timeout) {
                warn!("worker pool did not drain within {:?}", self.config.shutdown_timeout);
            }
        }

        for (msg, res) in self.sender.close() {
            if let Err(e) = res {
                self.write_failed(&msg, e);
            }
        }

        let outstanding = self.pending.lock().close();
        for (serial, c) in outstanding {
            self.complete(c, pending::disconnected_reply(serial));
        }

        *self.state.lock() = State::Disconnected;
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        let me = thread::current().id();
        for h in handles {
            if h.thread().id() != me && h.join().is_err() {
                error!("connection thread panicked");
            }
        }
        debug!("disconnected");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn reader_loop(conn: Weak<Inner>, mut reader: Box<dyn MessageReader>) {
    loop {
        let res = reader.read_message();
        let inner = match conn.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        match res {
            Ok(msg) => inner.dispatch(msg),
            Err(Error::Io(e)) => {
                if inner.is_connected() {
                    error!("reading from transport failed: {}", e);
                    inner.disconnect();
                } else {
                    debug!("reader stopping: {}", e);
                }
                break;
            }
            Err(e) => warn!("dropping undecodable message: {}", e),
        }
    }
    if let Err(e) = reader.close() {
        debug!("closing reader: {}", e);
    }
}

fn sender_loop(conn: Weak<Inner>, sender: Arc<SerialSender>) {
    while let Some((msg, res)) = sender.write_next() {
        if let Err(e) = res {
            match conn.upgrade() {
                Some(inner) => inner.write_failed(&msg, e),
                None => break,
            }
        }
    }
}

impl Connection {
    fn start(transport: Transport, config: ConnectionConfig, bus: bool, guid: Option<String>) -> Result<Connection> {
        let Transport { reader, writer } = transport;
        let pool = WorkerPool::new("dbus", config.worker_threads)?;
        let sender = Arc::new(SerialSender::new(writer));
        let inner = Arc::new(Inner {
            config,
            cache: SignatureCache::new(),
            bus,
            guid,
            pending: Mutex::new(PendingCalls::new()),
            signals: RwLock::new(SignalTable::new()),
            objects: RwLock::new(ObjectTable::new()),
            workers: RwLock::new(Some(pool)),
            sender: sender.clone(),
            errors: Mutex::new(VecDeque::new()),
            state: Mutex::new(State::Connected),
            unique_name: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let reader_thread = thread::Builder::new()
            .name("dbus-reader".to_owned())
            .spawn(move || reader_loop(weak, reader))?;
        inner.threads.lock().push(reader_thread);
        let weak = Arc::downgrade(&inner);
        let sender_thread = thread::Builder::new()
            .name("dbus-sender".to_owned())
            .spawn(move || sender_loop(weak, sender))?;
        inner.threads.lock().push(sender_thread);
        Ok(Connection { inner })
    }

    fn open(address: &str, config: ConnectionConfig, bus: bool) -> Result<Connection> {
        let (mut sock, addr) = transport::connect(address)?;
        let outcome = Sasl::client(&config.auth).authenticate(&mut sock)?;
        if let Some(expected) = addr.guid() {
            if expected != outcome.guid {
                return Err(Error::AuthenticationFailure(format!(
                    "server guid {} does not match the address guid {}",
                    outcome.guid, expected
                )));
            }
        }
        debug!("authenticated to {:?} using {:?}", addr, outcome.mechanism);
        Connection::start(Transport::from_socket(sock)?, config, bus, Some(outcome.guid))
    }

    /// Connects to a bus daemon at a D-Bus address string and registers with
    /// `Hello`.
    pub fn connect(address: &str) -> Result<Connection> {
        Connection::connect_with(address, ConnectionConfig::default())
    }

    pub fn connect_with(address: &str, config: ConnectionConfig) -> Result<Connection> {
        let register = config.register;
        let conn = Connection::open(address, config, true)?;
        if register {
            conn.hello()?;
        }
        Ok(conn)
    }

    /// Connects to the system bus.
    ///
    /// The address is specified by the environment variable
    /// DBUS_SYSTEM_BUS_ADDRESS or "unix:path=/var/run/dbus/system_bus_socket" if unset.
    pub fn connect_system() -> Result<Connection> {
        Connection::connect(&config::system_bus_address())
    }

    /// Connects to the session bus.
    ///
    /// The address is specified by the environment variable DBUS_SESSION_BUS_ADDRESS.
    pub fn connect_session() -> Result<Connection> {
        match config::session_bus_address() {
            Some(addr) => Connection::connect(&addr),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "DBUS_SESSION_BUS_ADDRESS is not set",
            ))),
        }
    }

    /// Connects straight to a peer: no bus registration, match rules stay local.
    pub fn connect_direct(address: &str) -> Result<Connection> {
        Connection::open(address, ConnectionConfig::default().register(false), false)
    }

    /// Runs a connection over a transport that is already authenticated.
    pub fn with_transport(transport: Transport, config: ConnectionConfig) -> Result<Connection> {
        Connection::start(transport, config, false, None)
    }

    /// Registers with the bus daemon and records the unique name it assigns.
    pub fn hello(&self) -> Result<String> {
        let msg = message::create_method_call(Some(DBUS_NAME), DBUS_PATH, Some(DBUS_NAME), "Hello");
        let reply = self.call_sync(msg)?;
        let name = reply
            .first()
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| Error::InvalidMessage("Hello reply carried no name".into()))?;
        debug!("registered as {}", name);
        *self.inner.unique_name.lock() = Some(name.clone());
        Ok(name)
    }

    pub fn unique_name(&self) -> Option<String> {
        self.inner.unique_name.lock().clone()
    }

    /// Guid of the server side, as settled during authentication.
    pub fn guid(&self) -> Option<&str> {
        self.inner.guid.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub(crate) fn signature_cache(&self) -> &SignatureCache {
        &self.inner.cache
    }

    pub(crate) fn objects<'a>(&'a self, peer: Option<&'a str>) -> Objects<'a> {
        Objects { inner: &self.inner, peer }
    }

    /// Exports `obj` at `path`. The object stays exported while the returned
    /// handle lives, or until [`ExportHandle::keep`] hands it to the
    /// connection for good.
    pub fn export_object(&self, path: &str, obj: ExportedObject) -> Result<ExportHandle> {
        self.inner.objects.write().export(path, obj, &self.inner.cache)?;
        debug!("exported {}", path);
        Ok(ExportHandle { conn: Arc::downgrade(&self.inner), path: path.to_owned(), armed: true })
    }

    pub fn unexport(&self, path: &str) -> bool {
        self.inner.objects.write().unexport(path)
    }

    /// Answers calls to `prefix` and any path below it that has no exported
    /// object of its own.
    pub fn add_fallback(&self, prefix: &str, obj: ExportedObject) -> Result<()> {
        self.inner.objects.write().add_fallback(prefix, obj, &self.inner.cache)
    }

    pub fn remove_fallback(&self, prefix: &str) -> bool {
        self.inner.objects.write().remove_fallback(prefix)
    }

    fn forwards(&self, rule: &MatchRule) -> bool {
        self.inner.bus && rule.interface.as_deref() != Some(LOCAL_INTERFACE)
    }

    fn bus_call(&self, member: &str, arg: &str) -> Result<Vec<Value>> {
        let msg = message::create_method_call(Some(DBUS_NAME), DBUS_PATH, Some(DBUS_NAME), member).add_arg(arg);
        self.call_sync(msg)
    }

    /// Routes signals matching `rule` to `handler`. On a bus connection the
    /// first handler for a rule also sends `AddMatch` to the daemon.
    pub fn add_signal_handler<F>(&self, rule: MatchRule, handler: F) -> Result<HandlerId>
    where
        F: Fn(&Signal) -> Result<()> + Send + Sync + 'static,
    {
        let (id, first) = self.inner.signals.write().add(rule.clone(), Arc::new(handler));
        if first && self.forwards(&rule) {
            if let Err(e) = self.bus_call("AddMatch", &rule.to_string()) {
                self.inner.signals.write().remove(id);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Removes one handler. The rule is dropped at the daemon once no
    /// handler uses it. Returns false for an unknown id.
    pub fn remove_signal_handler(&self, id: HandlerId) -> Result<bool> {
        let removed = self.inner.signals.write().remove(id);
        match removed {
            Some((rule, true)) if self.forwards(&rule) => {
                self.bus_call("RemoveMatch", &rule.to_string())?;
                Ok(true)
            }
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    pub fn send_signal(&self, path: &str, interface: &str, member: &str, args: Vec<Value>) -> Result<u32> {
        let mut msg = message::create_signal(path, interface, member);
        msg.body = args;
        self.send(msg)
    }

    /// Announces new values of properties of the object at `path`, and
    /// names the ones whose values are only invalidated.
    pub fn emit_properties_changed(
        &self,
        path: &str,
        interface: &str,
        changed: Vec<(String, Value)>,
        invalidated: Vec<String>,
    ) -> Result<u32> {
        let args = properties_changed_args(interface, changed, invalidated);
        self.send_signal(path, PROPERTIES_INTERFACE, "PropertiesChanged", args)
    }

    /// Sends a method call and returns at once; the reply is collected
    /// through the returned handle.
    pub fn call_async(&self, msg: Message) -> Result<PendingReply> {
        check_call(&msg)?;
        let slot = Arc::new(ReplySlot::new());
        let serial = self.inner.send_message(msg, Some(Completion::Sync(slot.clone())))?;
        Ok(PendingReply::new(serial, slot))
    }

    /// Sends a method call; `callback` later runs on the worker pool with
    /// the outcome.
    pub fn call_with_callback<F>(&self, msg: Message, callback: F) -> Result<u32>
    where
        F: FnOnce(Result<Vec<Value>>) + Send + 'static,
    {
        check_call(&msg)?;
        let completion = Completion::Callback(Box::new(move |reply| callback(pending::reply_result(reply))));
        self.inner.send_message(msg, Some(completion))
    }

    /// Sends a method call flagged `NO_REPLY_EXPECTED`.
    pub fn call_no_reply(&self, msg: Message) -> Result<u32> {
        if msg.message_type != MESSAGE_TYPE_METHOD_CALL {
            return Err(Error::InvalidMessage(format!("expected a method call, got a {}", msg.message_type.name())));
        }
        self.send(msg.add_flags(flags::NO_REPLY_EXPECTED))
    }

    /// Oldest Error reply that matched no pending call, if any.
    pub fn get_error(&self) -> Option<Error> {
        self.inner.errors.lock().pop_front()
    }

    /// Replaces the worker pool with one of `n` threads. Work that has not
    /// started yet moves to the new pool.
    pub fn change_thread_count(&self, n: usize) -> Result<()> {
        let pool = WorkerPool::new("dbus", n)?;
        let old = {
            let mut workers = self.inner.workers.write();
            if workers.is_none() {
                return Err(Error::NotConnected);
            }
            workers.replace(pool)
        };
        if let Some(old) = old {
            let workers = self.inner.workers.read();
            match workers.as_ref() {
                Some(new) => {
                    let moved = old.migrate(new);
                    debug!("resized worker pool to {}, moved {} queued jobs", new.size(), moved);
                }
                None => drop(old),
            }
        }
        Ok(())
    }

    /// Tears the connection down. Calls still waiting for a reply fail with
    /// `NotConnected`; queued outbound messages are flushed first. Calling
    /// it again does nothing.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn close(&self) {
        self.disconnect();
    }
}

impl MessageSender for Connection {
    fn send(&self, msg: Message) -> Result<u32> {
        self.inner.send_message(msg, None)
    }

    fn call_sync(&self, msg: Message) -> Result<Vec<Value>> {
        self.call_async(msg)?.wait()
    }
}

impl Listener {
    /// Accepts one peer, authenticates it as the server side and starts a
    /// direct connection over it.
    pub fn accept(&self, config: ConnectionConfig) -> Result<Connection> {
        let mut sock = self.accept_socket()?;
        let mut auth = config.auth.clone();
        if auth.guid.is_none() {
            auth.guid = self.address().guid().map(str::to_owned);
        }
        let outcome = Sasl::server(&auth, sock.peer_uid()).authenticate(&mut sock)?;
        debug!("accepted peer using {:?}", outcome.mechanism);
        Connection::start(Transport::from_socket(sock)?, config, false, Some(outcome.guid))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dispatch::InterfaceImpl;
    use crate::signature::TypeDescriptor as T;
    use crate::transport::MessageWriter;
    use crossbeam::channel::{self, Receiver, Sender};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(5);

    struct ChannelReader {
        inbound: Receiver<Message>,
        closed: Receiver<()>,
    }

    impl MessageReader for ChannelReader {
        fn read_message(&mut self) -> Result<Message> {
            crossbeam::select! {
                recv(self.inbound) -> msg => msg.map_err(|_| Error::Io(io::ErrorKind::UnexpectedEof.into())),
                recv(self.closed) -> _ => Err(Error::Io(io::ErrorKind::UnexpectedEof.into())),
            }
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct ChannelWriter {
        outbound: Sender<Message>,
        closed: Option<Sender<()>>,
    }

    impl MessageWriter for ChannelWriter {
        fn write_message(&mut self, msg: &Message) -> Result<()> {
            // round trip through the codec, as a socket would
            let wire = Message::decode(&msg.encode()?)?;
            self.outbound.send(wire).map_err(|_| Error::Io(io::ErrorKind::BrokenPipe.into()))
        }

        fn close(&mut self) -> Result<()> {
            self.closed.take();
            Ok(())
        }
    }

    struct Peer {
        to_conn: Sender<Message>,
        from_conn: Receiver<Message>,
        serial: u32,
    }

    impl Peer {
        fn send(&mut self, mut msg: Message) {
            self.serial += 1;
            msg.serial = self.serial;
            let wire = Message::decode(&msg.encode().unwrap()).unwrap();
            self.to_conn.send(wire).unwrap();
        }

        fn recv(&self) -> Message {
            self.from_conn.recv_timeout(WAIT).unwrap()
        }
    }

    fn fake(config: ConnectionConfig) -> (Connection, Peer) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (to_conn, inbound) = channel::unbounded();
        let (outbound, from_conn) = channel::unbounded();
        let (closed_tx, closed_rx) = channel::bounded(0);
        let transport = Transport::new(
            Box::new(ChannelReader { inbound, closed: closed_rx }),
            Box::new(ChannelWriter { outbound, closed: Some(closed_tx) }),
        );
        let conn = Connection::with_transport(transport, config).unwrap();
        (conn, Peer { to_conn, from_conn, serial: 100 })
    }

    fn echo_object() -> ExportedObject {
        ExportedObject::new().interface(InterfaceImpl::new("org.example.Echo").method(
            "Echo",
            vec![T::String],
            Some(T::String),
            |_, args| Ok(args.into_iter().next()),
        ))
    }

    fn call(member: &str) -> Message {
        message::create_method_call(Some("org.example"), "/echo", Some("org.example.Echo"), member)
    }

    #[test]
    fn test_serials_match_out_of_order_replies() {
        let (conn, peer) = fake(ConnectionConfig::default());
        let callers: Vec<_> = (0..8u32)
            .map(|i| {
                let conn = conn.clone();
                thread::spawn(move || conn.call_sync(call("Echo").add_arg(i)).unwrap())
            })
            .collect();

        let calls: Vec<Message> = (0..8).map(|_| peer.recv()).collect();
        let mut serials: Vec<u32> = calls.iter().map(|m| m.serial).collect();
        serials.sort_unstable();
        serials.dedup();
        assert_eq!(serials.len(), 8);
        assert!(!serials.contains(&0));

        let mut peer = peer;
        for c in calls.into_iter().rev() {
            let mut reply = message::create_method_return(c.serial);
            reply.body = c.body.clone();
            peer.send(reply);
        }
        let mut got: Vec<u32> = callers
            .into_iter()
            .map(|t| match t.join().unwrap().as_slice() {
                [Value::UInt32(n)] => *n,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<u32>>());
    }

    #[test]
    fn test_disconnect_unblocks_sync_call() {
        let (conn, peer) = fake(ConnectionConfig::default());
        let c = conn.clone();
        let caller = thread::spawn(move || c.call_sync(call("Echo").add_arg("x")));
        peer.recv();
        conn.disconnect();
        assert!(matches!(caller.join().unwrap(), Err(Error::NotConnected)));
        assert!(!conn.is_connected());
        assert!(matches!(conn.call_sync(call("Echo")), Err(Error::NotConnected)));
    }

    #[test]
    fn test_disconnected_signal_once() {
        let (conn, _peer) = fake(ConnectionConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        conn.add_signal_handler(MatchRule::signal(LOCAL_INTERFACE, "Disconnected"), move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        conn.disconnect();
        conn.close();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_signal_fan_out() {
        let (conn, mut peer) = fake(ConnectionConfig::default());
        let (tx, rx) = channel::unbounded();
        for tag in ["first", "second"] {
            let tx = tx.clone();
            conn.add_signal_handler(MatchRule::signal("org.example.Sig", "Changed"), move |sig| {
                tx.send((tag, sig.body.clone())).unwrap();
                Ok(())
            })
            .unwrap();
        }
        let tx2 = tx.clone();
        conn.add_signal_handler(MatchRule::new().interface("org.example.Sig"), move |sig| {
            tx2.send(("iface", sig.body.clone())).unwrap();
            Ok(())
        })
        .unwrap();
        conn.add_signal_handler(MatchRule::signal("org.example.Sig", "Other"), move |_| {
            tx.send(("other", vec![])).unwrap();
            Ok(())
        })
        .unwrap();

        peer.send(message::create_signal("/s", "org.example.Sig", "Changed").add_arg(3i32));
        let mut tags: Vec<&str> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap().0).collect();
        tags.sort_unstable();
        assert_eq!(tags, vec!["first", "iface", "second"]);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_signal_handler_fault_is_reported() {
        let (conn, mut peer) = fake(ConnectionConfig::default());
        conn.add_signal_handler(MatchRule::signal("org.example.Sig", "Changed"), |_| {
            Err(Error::remote("org.example.Error.Nope", "refused"))
        })
        .unwrap();
        let mut sig = message::create_signal("/s", "org.example.Sig", "Changed");
        sig.set_sender(":1.7");
        peer.send(sig);
        let err = peer.recv();
        assert_eq!(err.message_type, MESSAGE_TYPE_ERROR);
        assert_eq!(err.error_name(), Some("org.example.Error.Nope"));
        assert_eq!(err.reply_serial(), Some(peer.serial));
        assert_eq!(err.destination(), Some(":1.7"));
    }

    #[test]
    fn test_panicking_signal_handler_is_reported() {
        let (conn, mut peer) = fake(ConnectionConfig::default());
        conn.add_signal_handler(MatchRule::signal("org.example.Sig", "Changed"), |_| panic!("handler bug"))
            .unwrap();
        let mut sig = message::create_signal("/s", "org.example.Sig", "Changed");
        sig.set_sender(":1.7");
        peer.send(sig);
        let err = peer.recv();
        assert_eq!(err.error_name(), Some(names::FAILED));
        assert_eq!(err.reply_serial(), Some(peer.serial));
        match err.body.first() {
            Some(Value::String(text)) => assert!(text.contains("handler bug"), "{}", text),
            other => panic!("unexpected body {:?}", other),
        }
        assert!(conn.is_connected());
    }

    #[test]
    fn test_local_signals_from_the_wire_are_dropped() {
        let (conn, mut peer) = fake(ConnectionConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        conn.add_signal_handler(MatchRule::signal(LOCAL_INTERFACE, "Disconnected"), move |_| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        peer.send(message::create_signal(LOCAL_PATH, LOCAL_INTERFACE, "Disconnected"));
        peer.send(message::create_method_call(None, "/any", Some(crate::dispatch::PEER_INTERFACE), "Ping"));
        assert_eq!(peer.recv().reply_serial(), Some(peer.serial));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(conn.is_connected());
    }

    #[test]
    fn test_panicking_method_gets_error_reply() {
        let (conn, mut peer) = fake(ConnectionConfig::default().worker_threads(1));
        let obj = ExportedObject::new().interface(
            InterfaceImpl::new("org.example.Echo")
                .method("Echo", vec![T::String], Some(T::String), |_, args| Ok(args.into_iter().next()))
                .method("Boom", vec![], None, |_, _| panic!("handler bug")),
        );
        let _handle = conn.export_object("/echo", obj).unwrap();

        peer.send(call("Boom"));
        let err = peer.recv();
        assert_eq!(err.message_type, MESSAGE_TYPE_ERROR);
        assert_eq!(err.error_name(), Some(names::FAILED));
        assert_eq!(err.reply_serial(), Some(peer.serial));

        // the single worker survives and keeps serving
        peer.send(call("Echo").add_arg("still here"));
        assert_eq!(peer.recv().body, vec![Value::from("still here")]);
    }

    #[test]
    fn test_inbound_call_dispatch() {
        let (conn, mut peer) = fake(ConnectionConfig::default());
        let _handle = conn.export_object("/echo", echo_object()).unwrap();

        let mut msg = call("Echo").add_arg("hi");
        msg.set_sender(":1.9");
        peer.send(msg);
        let reply = peer.recv();
        assert_eq!(reply.message_type, MESSAGE_TYPE_METHOD_RETURN);
        assert_eq!(reply.reply_serial(), Some(peer.serial));
        assert_eq!(reply.destination(), Some(":1.9"));
        assert_eq!(reply.body, vec![Value::from("hi")]);

        peer.send(call("Shout").add_arg("hi"));
        let reply = peer.recv();
        assert_eq!(reply.error_name(), Some(names::UNKNOWN_METHOD));

        peer.send(message::create_method_call(None, "/nowhere", Some("org.example.Echo"), "Echo").add_arg("hi"));
        assert_eq!(peer.recv().error_name(), Some(names::UNKNOWN_OBJECT));

        // no reply for NO_REPLY_EXPECTED; the Ping after it is answered first
        peer.send(call("Echo").add_arg("quiet").add_flags(flags::NO_REPLY_EXPECTED));
        peer.send(message::create_method_call(None, "/echo", Some(crate::dispatch::PEER_INTERFACE), "Ping"));
        let pong = peer.recv();
        assert_eq!(pong.reply_serial(), Some(peer.serial));
        assert!(pong.body.is_empty());
    }

    #[test]
    fn test_property_calls_and_changes() {
        let (conn, mut peer) = fake(ConnectionConfig::default());
        let obj = ExportedObject::new().interface(
            InterfaceImpl::new("org.example.Thermo").property("Celsius", T::Int32, |_| Ok(Value::Int32(21))),
        );
        let _handle = conn.export_object("/thermo", obj).unwrap();

        let get = message::create_method_call(None, "/thermo", Some(PROPERTIES_INTERFACE), "Get")
            .add_arg("org.example.Thermo")
            .add_arg("Celsius");
        peer.send(get);
        let reply = peer.recv();
        assert_eq!(reply.reply_serial(), Some(peer.serial));
        assert_eq!(reply.body, vec![Value::Variant(crate::types::Variant::new(Value::Int32(21), "i"))]);

        let set = message::create_method_call(None, "/thermo", Some(PROPERTIES_INTERFACE), "Set")
            .add_arg("org.example.Thermo")
            .add_arg("Celsius")
            .add_arg(Value::Variant(crate::types::Variant::new(Value::Int32(30), "i")));
        peer.send(set);
        assert_eq!(peer.recv().error_name(), Some(names::PROPERTY_READ_ONLY));

        conn.emit_properties_changed("/thermo", "org.example.Thermo", vec![("Celsius".to_owned(), Value::Int32(22))], vec![])
            .unwrap();
        let sig = peer.recv();
        assert_eq!(sig.interface(), Some(PROPERTIES_INTERFACE));
        assert_eq!(sig.member(), Some("PropertiesChanged"));
        assert_eq!(sig.path(), Some("/thermo"));
        assert_eq!(sig.body[0], Value::from("org.example.Thermo"));
    }

    #[test]
    fn test_export_handle_drop_unexports() {
        let (conn, mut peer) = fake(ConnectionConfig::default());
        let handle = conn.export_object("/echo", echo_object()).unwrap();
        assert!(matches!(conn.export_object("/echo", echo_object()), Err(Error::Export(_))));
        drop(handle);
        peer.send(call("Echo").add_arg("hi"));
        assert_eq!(peer.recv().error_name(), Some(names::UNKNOWN_OBJECT));

        conn.export_object("/echo", echo_object()).unwrap().keep();
        peer.send(call("Echo").add_arg("hi"));
        assert_eq!(peer.recv().body, vec![Value::from("hi")]);
        assert!(conn.unexport("/echo"));
    }

    #[test]
    fn test_unmatched_replies() {
        let (conn, mut peer) = fake(ConnectionConfig::default());
        peer.send(message::create_method_return(4242));
        let answer = peer.recv();
        assert_eq!(answer.error_name(), Some(names::FAILED));
        assert_eq!(answer.reply_serial(), Some(peer.serial));

        peer.send(message::create_error("org.example.Error.Late", 4243, "too late"));
        let deadline = Instant::now() + WAIT;
        let err = loop {
            if let Some(e) = conn.get_error() {
                break e;
            }
            assert!(Instant::now() < deadline, "no queued error");
            thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(err.dbus_name(), "org.example.Error.Late");
        assert!(conn.get_error().is_none());
    }

    #[test]
    fn test_callback_and_no_reply_calls() {
        let (conn, mut peer) = fake(ConnectionConfig::default());
        let (tx, rx) = channel::bounded(1);
        conn.call_with_callback(call("Echo").add_arg("cb"), move |res| tx.send(res).unwrap()).unwrap();
        let c = peer.recv();
        peer.send(message::create_error("org.example.Error.Bad", c.serial, "bad"));
        match rx.recv_timeout(WAIT).unwrap() {
            Err(Error::Remote { name, message }) => {
                assert_eq!(name, "org.example.Error.Bad");
                assert_eq!(message, "bad");
            }
            other => panic!("unexpected {:?}", other),
        }

        conn.call_no_reply(call("Echo").add_arg("fire")).unwrap();
        let sent = peer.recv();
        assert!(!sent.expects_reply());
        assert!(matches!(conn.call_sync(call("Echo").add_flags(flags::NO_REPLY_EXPECTED)), Err(Error::InvalidMessage(_))));
    }

    #[test]
    fn test_resized_pool_keeps_serving() {
        let (conn, mut peer) = fake(ConnectionConfig::default().worker_threads(2));
        let _handle = conn.export_object("/echo", echo_object()).unwrap();
        conn.change_thread_count(1).unwrap();
        peer.send(call("Echo").add_arg("after"));
        assert_eq!(peer.recv().body, vec![Value::from("after")]);
        conn.disconnect();
        assert!(matches!(conn.change_thread_count(3), Err(Error::NotConnected)));
    }

    #[test]
    fn test_echo_over_unix_socket() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let address = format!("unix:path={}", dir.path().join("peer").display());
        let listener = Listener::bind(&address).unwrap();
        let server = thread::spawn(move || {
            let conn = listener.accept(ConnectionConfig::default()).unwrap();
            conn.export_object("/echo", echo_object()).unwrap().keep();
            conn
        });

        let client = Connection::connect_direct(&address).unwrap();
        let server = server.join().unwrap();
        assert!(client.guid().is_some());
        assert_eq!(client.guid(), server.guid());

        let reply = client.call_sync(call("Echo").add_arg("hi")).unwrap();
        assert_eq!(reply, vec![Value::from("hi")]);

        server.disconnect();
        let deadline = Instant::now() + WAIT;
        while client.is_connected() {
            assert!(Instant::now() < deadline, "client never saw the hangup");
            thread::sleep(Duration::from_millis(10));
        }
    }
}
