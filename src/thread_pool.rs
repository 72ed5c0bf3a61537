#[cfg(feature = "unstable-mpmc")]
use std::sync::mpmc as channel;
#[cfg(not(feature = "unstable-mpmc"))]
use std::sync::mpsc as channel;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, Builder, JoinHandle},
};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

pub const DEFAULT_POOL_CAPACITY: usize = 4;

/// Stable key deciding which worker runs a task.
///
/// Every task with the same key lands on the same worker and runs in push
/// order, which is how ticks for one connection never overlap.
pub trait Affinity {
    fn affinity(&self) -> u64;
}

enum WorkerMessage<T> {
    Task(T),
    Terminate,
}

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// A fixed set of worker threads, each draining its own FIFO queue.
///
/// `push` never blocks. Tasks are routed by [`Affinity`] to worker
/// `key % workers`. After [`stop`](Self::stop) new tasks are refused and
/// tasks still queued go through the discard callback instead of `run`.
pub struct WorkerPool<T: Send + 'static> {
    senders: Vec<channel::Sender<WorkerMessage<T>>>,
    workers: Mutex<Vec<Worker>>,
    stopped: Arc<AtomicBool>,
}

impl<T: Affinity + Send + 'static> WorkerPool<T> {
    pub fn new<R, D>(capacity: usize, run: R, discard: D) -> Result<Self>
    where
        R: Fn(T) + Send + Sync + 'static,
        D: Fn(T) + Send + Sync + 'static,
    {
        if capacity == 0 {
            return Err(Error::InvalidArgument("worker pool needs at least one worker"));
        }

        let run: Callback<T> = Arc::new(run);
        let discard: Callback<T> = Arc::new(discard);
        let stopped = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(capacity);
        let mut senders = Vec::with_capacity(capacity);

        for id in 0..capacity {
            let (sender, receiver) = channel::channel::<WorkerMessage<T>>();
            workers.push(Worker::spawn(
                id,
                receiver,
                Arc::clone(&run),
                Arc::clone(&discard),
                Arc::clone(&stopped),
            )?);
            senders.push(sender);
        }

        Ok(Self {
            senders,
            workers: Mutex::new(workers),
            stopped,
        })
    }

    /// Queues `task` on the worker its affinity key maps to.
    pub fn push(&self, task: T) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::PoolStopped);
        }
        let index = self.worker_for(task.affinity());
        self.senders[index]
            .send(WorkerMessage::Task(task))
            .map_err(|_| Error::PoolStopped)
    }

    pub fn worker_for(&self, key: u64) -> usize {
        (key % self.senders.len() as u64) as usize
    }

    pub fn workers_len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Refuses new tasks, discards queued ones and joins the workers.
    ///
    /// Safe to call more than once and from a worker thread; the calling
    /// worker is not joined.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::Terminate);
        }

        let current = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for mut worker in workers {
            let Some(handle) = worker.thread.take() else {
                continue;
            };
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(worker = worker.id, "worker thread panicked");
            }
        }
        debug!(workers = self.senders.len(), "worker pool stopped");
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn<T: Send + 'static>(
        id: usize,
        receiver: channel::Receiver<WorkerMessage<T>>,
        run: Callback<T>,
        discard: Callback<T>,
        stopped: Arc<AtomicBool>,
    ) -> Result<Self> {
        let thread = Builder::new()
            .name(format!("conn-worker-{id}"))
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        WorkerMessage::Task(task) if stopped.load(Ordering::Acquire) => {
                            discard(task)
                        }
                        WorkerMessage::Task(task) => run(task),
                        WorkerMessage::Terminate => break,
                    }
                }
                // tasks that raced with stop
                while let Ok(message) = receiver.try_recv() {
                    if let WorkerMessage::Task(task) = message {
                        discard(task);
                    }
                }
                trace!(worker = id, "worker exiting");
            })?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }
}
