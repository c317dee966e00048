//! Outstanding method calls, keyed by serial.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::dispatch::message_types;
use crate::error::{names, Error, Result};
use crate::message::{self, Message, MESSAGE_TYPE_ERROR};
use crate::types::Value;

/// Runs once with the reply (or a synthesized error) of a call.
pub type ReplyCallback = Box<dyn FnOnce(Message) + Send>;

/// A slot a blocked caller waits on; filled exactly once.
#[derive(Default)]
pub struct ReplySlot {
    reply: Mutex<Option<Message>>,
    ready: Condvar,
}

impl ReplySlot {
    pub fn new() -> Self {
        Default::default()
    }

    /// Stores the reply. A second completion is ignored.
    pub fn complete(&self, msg: Message) {
        let mut reply = self.reply.lock();
        if reply.is_none() {
            *reply = Some(msg);
            self.ready.notify_all();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.reply.lock().is_some()
    }

    pub fn wait(&self) -> Message {
        let mut reply = self.reply.lock();
        loop {
            if let Some(msg) = reply.as_ref() {
                return msg.clone();
            }
            self.ready.wait(&mut reply);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut reply = self.reply.lock();
        loop {
            if let Some(msg) = reply.as_ref() {
                return Some(msg.clone());
            }
            if self.ready.wait_until(&mut reply, deadline).timed_out() {
                return reply.clone();
            }
        }
    }
}

pub enum Completion {
    Sync(Arc<ReplySlot>),
    Callback(ReplyCallback),
}

impl Completion {
    pub fn complete(self, msg: Message) {
        match self {
            Completion::Sync(slot) => slot.complete(msg),
            Completion::Callback(cb) => cb(msg),
        }
    }
}

/// Serial allocation plus the calls still waiting for a reply.
pub struct PendingCalls {
    calls: HashMap<u32, Completion>,
    last_serial: u32,
    closed: bool,
}

impl Default for PendingCalls {
    fn default() -> Self {
        PendingCalls { calls: HashMap::new(), last_serial: 0, closed: false }
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Default::default()
    }

    /// Next serial; skips 0 and anything still pending after wrap-around.
    pub fn allocate(&mut self) -> u32 {
        loop {
            self.last_serial = self.last_serial.wrapping_add(1);
            if self.last_serial != 0 && !self.calls.contains_key(&self.last_serial) {
                return self.last_serial;
            }
        }
    }

    pub fn register(&mut self, serial: u32, completion: Completion) -> Result<()> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        self.calls.insert(serial, completion);
        Ok(())
    }

    pub fn take(&mut self, serial: u32) -> Option<Completion> {
        self.calls.remove(&serial)
    }

    #[cfg(test)]
    pub fn contains(&self, serial: u32) -> bool {
        self.calls.contains_key(&serial)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Refuses further registrations and hands back everything outstanding.
    pub fn close(&mut self) -> Vec<(u32, Completion)> {
        self.closed = true;
        self.calls.drain().collect()
    }

    #[cfg(test)]
    pub(crate) fn set_last_serial(&mut self, serial: u32) {
        self.last_serial = serial;
    }
}

/// The error reply every call outstanding at disconnection receives.
pub fn disconnected_reply(serial: u32) -> Message {
    message::create_error(names::DISCONNECTED, serial, "Disconnected")
}

/// Failure reply for a call whose bytes never made it onto the transport.
pub fn send_failed_reply(serial: u32) -> Message {
    message::create_error(names::FAILED, serial, "message failed to send")
}

/// Body of a MethodReturn, or the fault carried by an Error.
pub fn reply_result(msg: Message) -> Result<Vec<Value>> {
    if msg.message_type == MESSAGE_TYPE_ERROR {
        let err = message_types::Error::new(msg)?;
        return Err(err.into_error());
    }
    Ok(msg.body)
}

/// Handle to a call whose reply arrives later.
#[derive(Clone)]
pub struct PendingReply {
    serial: u32,
    slot: Arc<ReplySlot>,
}

impl PendingReply {
    pub(crate) fn new(serial: u32, slot: Arc<ReplySlot>) -> Self {
        PendingReply { serial, slot }
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn has_reply(&self) -> bool {
        self.slot.is_complete()
    }

    /// Blocks until the reply arrives or the connection goes away.
    pub fn wait(&self) -> Result<Vec<Value>> {
        reply_result(self.slot.wait())
    }

    /// `None` when nothing arrived within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Vec<Value>>> {
        self.slot.wait_timeout(timeout).map(reply_result)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn test_serials_skip_zero_and_pending() {
        let mut pending = PendingCalls::new();
        pending.set_last_serial(u32::MAX - 1);
        let a = pending.allocate();
        assert_eq!(a, u32::MAX);
        pending.register(1, Completion::Sync(Arc::new(ReplySlot::new()))).unwrap();
        // wraps past 0 and the pending 1
        assert_eq!(pending.allocate(), 2);
    }

    #[test]
    fn test_close_refuses_and_drains() {
        let mut pending = PendingCalls::new();
        let slot = Arc::new(ReplySlot::new());
        pending.register(7, Completion::Sync(slot.clone())).unwrap();
        let outstanding = pending.close();
        assert_eq!(outstanding.len(), 1);
        for (serial, c) in outstanding {
            c.complete(disconnected_reply(serial));
        }
        assert!(matches!(reply_result(slot.wait()), Err(Error::NotConnected)));
        assert!(matches!(
            pending.register(8, Completion::Sync(Arc::new(ReplySlot::new()))),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_slot_wakes_waiter() {
        let slot = Arc::new(ReplySlot::new());
        let reply = PendingReply::new(3, slot.clone());
        assert!(!reply.has_reply());
        assert!(reply.wait_timeout(Duration::from_millis(10)).is_none());
        let t = thread::spawn(move || {
            slot.complete(message::create_method_return(3).add_arg("done"));
        });
        assert_eq!(reply.wait().unwrap(), vec![Value::from("done")]);
        t.join().unwrap();
        assert!(reply.has_reply());
    }

    #[test]
    fn test_remote_error_reply() {
        let err = reply_result(message::create_error("org.foo.Error.Bad", 4, "bad input")).unwrap_err();
        match err {
            Error::Remote { name, message } => {
                assert_eq!(name, "org.foo.Error.Bad");
                assert_eq!(message, "bad input");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
