//! Executors and strands.
//!
//! An [`Executor`] runs boxed functors on some pool of threads. A
//! [`Strand`] is a per-entity FIFO layered over an executor: functors
//! posted to the same strand run one at a time, in order, never
//! concurrently with each other, while different strands sharing the
//! executor proceed in parallel.

use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::warn;

/// A deferred unit of work.
pub type Functor = Box<dyn FnOnce() + Send + 'static>;

/// An ordered batch of deferred work.
pub type FunctorSequence = VecDeque<Functor>;

/// An interface to execute functions.
pub trait Executor: Send + Sync {
    /// Enqueue `functor` for execution.
    fn execute(&self, functor: Functor);

    /// Atomically enqueue the whole `sequence` followed by `trailing`.
    fn move_and_execute(&self, sequence: &mut FunctorSequence, trailing: Option<Functor>);
}

/// Shared handle to an executor.
pub type ExecutorRef = Arc<dyn Executor>;

fn run_guarded(functor: Functor) {
    if catch_unwind(AssertUnwindSafe(functor)).is_err() {
        warn!("functor panicked; executor thread continues");
    }
}

/// A fixed pool of worker threads draining a shared job channel.
pub struct ThreadPool {
    tx: Mutex<Option<flume::Sender<Functor>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Create a pool with one worker per available CPU.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_threads(num_cpus::get())
    }

    /// Create a pool with `num_threads` workers (at least one).
    #[must_use]
    pub fn with_threads(num_threads: usize) -> Arc<Self> {
        let (tx, rx) = flume::unbounded::<Functor>();
        let workers = (0..num_threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("keelson-exec-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            run_guarded(job);
                        }
                    })
                    .expect("failed to spawn executor thread")
            })
            .collect();

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Stop accepting work and wait for the workers to drain.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = std::thread::current().id();
        for worker in workers {
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }

    fn submit(&self, functor: Functor) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(functor);
        }
    }
}

impl Executor for ThreadPool {
    fn execute(&self, functor: Functor) {
        self.submit(functor);
    }

    fn move_and_execute(&self, sequence: &mut FunctorSequence, trailing: Option<Functor>) {
        for functor in sequence.drain(..) {
            self.submit(functor);
        }
        if let Some(functor) = trailing {
            self.submit(functor);
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // disconnect the channel; workers exit once drained
        self.tx.lock().take();
    }
}

thread_local! {
    static CURRENT_STRAND: Cell<usize> = const { Cell::new(0) };
}

struct StrandQueue {
    jobs: VecDeque<Functor>,
    draining: bool,
}

struct StrandInner {
    executor: ExecutorRef,
    queue: Mutex<StrandQueue>,
}

/// A serialized execution domain over a shared executor.
///
/// Guarantees: FIFO across all enqueues; at most one functor of this
/// strand runs at any instant; no ordering between distinct strands.
#[derive(Clone)]
pub struct Strand {
    inner: Arc<StrandInner>,
}

impl Strand {
    #[must_use]
    pub fn new(executor: ExecutorRef) -> Self {
        Self {
            inner: Arc::new(StrandInner {
                executor,
                queue: Mutex::new(StrandQueue {
                    jobs: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    /// The executor this strand schedules its drains on.
    #[must_use]
    pub fn executor(&self) -> ExecutorRef {
        self.inner.executor.clone()
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// True when the calling thread is currently draining this strand.
    #[must_use]
    pub fn is_running_in_current_thread(&self) -> bool {
        CURRENT_STRAND.with(|current| current.get() == self.id())
    }

    /// True when the calling thread is draining any strand.
    #[must_use]
    pub fn current_thread_in_strand() -> bool {
        CURRENT_STRAND.with(|current| current.get() != 0)
    }

    fn schedule_drain(&self) {
        let strand = self.clone();
        self.inner
            .executor
            .execute(Box::new(move || strand.drain()));
    }

    fn drain(&self) {
        let id = self.id();
        loop {
            let job = {
                let mut queue = self.inner.queue.lock();
                match queue.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            CURRENT_STRAND.with(|current| {
                let previous = current.replace(id);
                run_guarded(job);
                current.set(previous);
            });
        }
    }

    fn enqueue(&self, jobs: impl IntoIterator<Item = Functor>) {
        let schedule = {
            let mut queue = self.inner.queue.lock();
            queue.jobs.extend(jobs);
            if queue.draining {
                false
            } else {
                queue.draining = true;
                true
            }
        };
        if schedule {
            self.schedule_drain();
        }
    }
}

impl Executor for Strand {
    fn execute(&self, functor: Functor) {
        self.enqueue(std::iter::once(functor));
    }

    fn move_and_execute(&self, sequence: &mut FunctorSequence, trailing: Option<Functor>) {
        self.enqueue(sequence.drain(..).chain(trailing));
    }
}
