//! Per-CPU timed work queues
//!
//! A queue owns one worker thread bound to a CPU. Producers push
//! entries and choose a wake-up mode: `OnInsert` schedules the drain
//! immediately, `OnTimer` (re)arms a one-shot timer so bursts coalesce
//! into a single drain after the interval. Entries are delivered FIFO
//! to the queue's callback at the deferred dispatch level.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bpfrt_core::error::{BpfError, BpfResult};
use bpfrt_core::kdebug;
use crossbeam_queue::SegQueue;

use crate::platform;

/// When the queue's worker should run after an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupMode {
    /// Schedule the drain immediately.
    OnInsert,
    /// Arm (or re-arm) the timer to fire after the queue's interval.
    OnTimer,
}

struct WakeState {
    wake_now: bool,
    deadline: Option<Instant>,
}

struct Inner<T: Send> {
    cpu_id: usize,
    interval: Duration,
    entries: SegQueue<T>,
    callback: Box<dyn Fn(usize, T) + Send + Sync>,
    state: Mutex<WakeState>,
    wake: Condvar,
    shutdown: AtomicBool,
}

impl<T: Send> Inner<T> {
    fn drain(&self) {
        let _dispatch = platform::raise_to_dispatch();
        while let Some(entry) = self.entries.pop() {
            (self.callback)(self.cpu_id, entry);
        }
    }
}

/// Timed work queue bound to one CPU.
///
/// Dropping the queue stops the worker; entries not yet delivered are
/// dropped without running the callback.
pub struct TimedWorkQueue<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> TimedWorkQueue<T> {
    /// Create a queue whose worker prefers to run on `cpu_id` and
    /// whose timer fires `interval` after the arming insert.
    pub fn new<F>(cpu_id: usize, interval: Duration, callback: F) -> BpfResult<Self>
    where
        F: Fn(usize, T) + Send + Sync + 'static,
    {
        if cpu_id >= platform::cpu_count() || interval.is_zero() {
            return Err(BpfError::InvalidArgument);
        }

        let inner = Arc::new(Inner {
            cpu_id,
            interval,
            entries: SegQueue::new(),
            callback: Box::new(callback),
            state: Mutex::new(WakeState {
                wake_now: false,
                deadline: None,
            }),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name(format!("bpfrt-wq-{cpu_id}"))
            .spawn(move || worker_loop(worker_inner))
            .map_err(|_| BpfError::NoMemory)?;

        Ok(TimedWorkQueue {
            inner,
            worker: Some(worker),
        })
    }

    /// Queue an entry for the worker.
    pub fn insert(&self, entry: T, mode: WakeupMode) {
        self.inner.entries.push(entry);
        let mut state = match self.inner.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        match mode {
            WakeupMode::OnInsert => state.wake_now = true,
            WakeupMode::OnTimer => {
                state.deadline = Some(Instant::now() + self.inner.interval);
            }
        }
        drop(state);
        self.inner.wake.notify_one();
    }

    /// Drain the queue synchronously on the calling thread.
    pub fn flush(&self) {
        self.inner.drain();
    }

    /// Advisory emptiness check.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }
}

impl<T: Send + 'static> Drop for TimedWorkQueue<T> {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake.notify_one();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        let pending = self.inner.entries.len();
        if pending > 0 {
            kdebug!(
                "work_queue: cpu {} destroyed with {} undelivered entries",
                self.inner.cpu_id,
                pending
            );
        }
    }
}

fn worker_loop<T: Send>(inner: Arc<Inner<T>>) {
    // Best effort; the queue still works if the CPU pin fails.
    let _affinity = platform::pin_to_cpu(inner.cpu_id);

    let mut state = match inner.state.lock() {
        Ok(state) => state,
        Err(poisoned) => poisoned.into_inner(),
    };
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        let timer_fired = state.deadline.is_some_and(|deadline| deadline <= now);
        if state.wake_now || timer_fired {
            state.wake_now = false;
            state.deadline = None;
            drop(state);
            inner.drain();
            state = match inner.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            continue;
        }

        state = match state.deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(now);
                match inner.wake.wait_timeout(state, timeout) {
                    Ok((state, _)) => state,
                    Err(poisoned) => poisoned.into_inner().0,
                }
            }
            None => match inner.wake.wait(state) {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            },
        };
    }
}
