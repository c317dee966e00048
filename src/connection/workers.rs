//! Fixed-size pool running handler invocations off the reader thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

pub type Job = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Shared {
    alive: Mutex<usize>,
    exited: Condvar,
    ids: Mutex<Vec<ThreadId>>,
}

impl Shared {
    fn contains_current(&self) -> bool {
        let me = thread::current().id();
        self.ids.lock().contains(&me)
    }
}

pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    receiver: Receiver<Job>,
    shared: Arc<Shared>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` named workers.
    pub fn new(name: &str, size: usize) -> Result<WorkerPool> {
        let size = size.max(1);
        let (sender, receiver) = channel::unbounded::<Job>();
        let shared = Arc::new(Shared::default());
        for i in 0..size {
            let rx = receiver.clone();
            let sh = shared.clone();
            *shared.alive.lock() += 1;
            let spawned = thread::Builder::new().name(format!("{}-worker-{}", name, i)).spawn(move || {
                sh.ids.lock().push(thread::current().id());
                for job in rx.iter() {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("handler panicked on {:?}", thread::current().name());
                    }
                }
                let me = thread::current().id();
                sh.ids.lock().retain(|id| *id != me);
                let mut alive = sh.alive.lock();
                *alive -= 1;
                sh.exited.notify_all();
            });
            if let Err(e) = spawned {
                *shared.alive.lock() -= 1;
                return Err(e.into());
            }
        }
        debug!("started {} {} workers", size, name);
        Ok(WorkerPool { sender: Some(sender), receiver, shared, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// True when called from one of this pool's threads.
    pub fn in_worker(&self) -> bool {
        self.shared.contains_current()
    }

    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.sender {
            Some(tx) => tx.send(Box::new(job)).map_err(|_| Error::NotConnected),
            None => Err(Error::NotConnected),
        }
    }

    /// Stops taking jobs and moves every job not yet started onto `to`.
    /// The old workers finish what they are running and exit; nothing is
    /// joined. Returns how many jobs moved.
    pub fn migrate(mut self, to: &WorkerPool) -> usize {
        self.sender = None;
        let mut moved = 0;
        for job in self.receiver.try_iter() {
            if to.execute(job).is_ok() {
                moved += 1;
            }
        }
        moved
    }

    /// Stops taking jobs and waits up to `timeout` for queued work to finish.
    /// On expiry the remaining queue is discarded and `false` returned. A
    /// worker calling this does not wait for itself.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        self.sender = None;
        let own = usize::from(self.in_worker());
        let deadline = Instant::now() + timeout;
        let mut alive = self.shared.alive.lock();
        while *alive > own {
            if self.shared.exited.wait_until(&mut alive, deadline).timed_out() {
                break;
            }
        }
        if *alive <= own {
            return true;
        }
        drop(alive);
        let dropped = self.receiver.try_iter().count();
        warn!("worker shutdown timed out, discarded {} queued jobs", dropped);
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_queued_jobs_before_shutdown() {
        let pool = WorkerPool::new("test", 2).unwrap();
        let n = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let n = n.clone();
            pool.execute(move || {
                n.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert!(pool.shutdown(Duration::from_secs(5)));
        assert_eq!(n.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_panicking_job_keeps_worker() {
        let pool = WorkerPool::new("test", 1).unwrap();
        pool.execute(|| panic!("boom")).unwrap();
        let (tx, rx) = channel::bounded(1);
        pool.execute(move || tx.send(7).unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        assert!(pool.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn test_shutdown_timeout_discards_queue() {
        let pool = WorkerPool::new("test", 1).unwrap();
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        let ran = Arc::new(AtomicUsize::new(0));
        pool.execute(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        })
        .unwrap();
        let r = ran.clone();
        pool.execute(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(!pool.shutdown(Duration::from_millis(50)));
        drop(release_tx);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_shutdown_from_worker() {
        let pool = Arc::new(Mutex::new(Some(WorkerPool::new("test", 2).unwrap())));
        let (tx, rx) = channel::bounded(1);
        let p = pool.clone();
        let guard = pool.lock();
        guard
            .as_ref()
            .unwrap()
            .execute(move || {
                let taken = p.lock().take().unwrap();
                tx.send(taken.shutdown(Duration::from_secs(5))).unwrap();
            })
            .unwrap();
        drop(guard);
        assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn test_migrate_moves_unstarted_jobs() {
        let old = WorkerPool::new("old", 1).unwrap();
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        old.execute(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        })
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        let (done_tx, done_rx) = channel::unbounded();
        for i in 0..3 {
            let tx = done_tx.clone();
            old.execute(move || tx.send(i).unwrap()).unwrap();
        }
        let new = WorkerPool::new("new", 2).unwrap();
        assert_eq!(old.migrate(&new), 3);
        let mut got: Vec<i32> = (0..3).map(|_| done_rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        got.sort();
        assert_eq!(got, vec![0, 1, 2]);
        drop(release_tx);
        assert!(new.shutdown(Duration::from_secs(5)));
    }
}
