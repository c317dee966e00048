//! Serialized outbound queue. Messages leave in enqueue order, one at a
//! time, through the single writer.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::message::Message;
use crate::transport::MessageWriter;

#[derive(Default)]
struct Queue {
    items: VecDeque<Message>,
    closed: bool,
}

pub struct SerialSender {
    queue: Mutex<Queue>,
    ready: Condvar,
    writer: Mutex<Option<Box<dyn MessageWriter>>>,
}

impl SerialSender {
    pub fn new(writer: Box<dyn MessageWriter>) -> Self {
        SerialSender { queue: Mutex::new(Queue::default()), ready: Condvar::new(), writer: Mutex::new(Some(writer)) }
    }

    pub fn enqueue(&self, msg: Message) -> Result<()> {
        let mut q = self.queue.lock();
        if q.closed {
            return Err(Error::NotConnected);
        }
        q.items.push_back(msg);
        self.ready.notify_one();
        Ok(())
    }

    /// Blocks for the next queued message and writes it. `None` once the
    /// queue is closed and empty.
    pub fn write_next(&self) -> Option<(Message, Result<()>)> {
        let mut q = self.queue.lock();
        let msg = loop {
            if let Some(msg) = q.items.pop_front() {
                break msg;
            }
            if q.closed {
                return None;
            }
            self.ready.wait(&mut q);
        };
        // writer lock is taken before the queue is released so writes
        // happen in dequeue order
        let mut writer = self.writer.lock();
        drop(q);
        let res = match writer.as_mut() {
            Some(w) => w.write_message(&msg),
            None => Err(Error::NotConnected),
        };
        Some((msg, res))
    }

    /// Refuses new messages, writes whatever is still queued, then closes
    /// the writer. Returns the outcome of each flushed message.
    pub fn close(&self) -> Vec<(Message, Result<()>)> {
        let mut q = self.queue.lock();
        q.closed = true;
        let rest: Vec<Message> = q.items.drain(..).collect();
        let mut writer = self.writer.lock();
        self.ready.notify_all();
        drop(q);

        let mut out = Vec::with_capacity(rest.len());
        for msg in rest {
            let res = match writer.as_mut() {
                Some(w) => w.write_message(&msg),
                None => Err(Error::NotConnected),
            };
            out.push((msg, res));
        }
        if let Some(mut w) = writer.take() {
            let _ = w.close();
        }
        out
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::create_signal;
    use std::sync::Arc;

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl MessageWriter for Recorder {
        fn write_message(&mut self, msg: &Message) -> Result<()> {
            self.0.lock().push(msg.member().unwrap_or("").to_owned());
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.0.lock().push("<closed>".to_owned());
            Ok(())
        }
    }

    #[test]
    fn test_order_and_close_flush() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sender = Arc::new(SerialSender::new(Box::new(Recorder(log.clone()))));
        sender.enqueue(create_signal("/a", "org.foo", "One")).unwrap();
        sender.enqueue(create_signal("/a", "org.foo", "Two")).unwrap();
        let (msg, res) = sender.write_next().unwrap();
        assert_eq!(msg.member(), Some("One"));
        assert!(res.is_ok());

        assert!(!sender.is_closed());
        let flushed = sender.close();
        assert_eq!(flushed.len(), 1);
        assert!(sender.is_closed());
        assert!(sender.write_next().is_none());
        assert!(matches!(sender.enqueue(create_signal("/a", "org.foo", "Three")), Err(Error::NotConnected)));
        assert_eq!(*log.lock(), vec!["One", "Two", "<closed>"]);
    }

    #[test]
    fn test_close_wakes_blocked_writer() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sender = Arc::new(SerialSender::new(Box::new(Recorder(log))));
        let s = sender.clone();
        let t = std::thread::spawn(move || s.write_next().is_none());
        std::thread::sleep(std::time::Duration::from_millis(20));
        sender.close();
        assert!(t.join().unwrap());
    }
}
