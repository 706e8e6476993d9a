//! Elastic worker pool.
//!
//! Tasks go through one shared unbounded channel. Workers are started on
//! demand while queued work exceeds the number of idle workers, up to the
//! configured limit, and exit by themselves after sitting idle for
//! `idle_timeout`. A manager thread joins the workers that retired.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

const RECV_INTERVAL: Duration = Duration::from_millis(100);
const AVAILABLE_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("worker pool is stopped")]
    Stopped,
    #[error("failed to start worker thread, {0}")]
    Spawn(std::io::Error),
}

#[derive(Default)]
struct State {
    live: usize,
    next_id: usize,
    handles: AHashMap<usize, JoinHandle<()>>,
}

struct Inner {
    name: String,
    max_workers: usize,
    idle_timeout: Duration,
    tx: Sender<Task>,
    rx: Receiver<Task>,
    idle: AtomicUsize,
    stopped: AtomicBool,
    state: Mutex<State>,
    available: Condvar,
    exited_tx: Sender<usize>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to a pool of worker threads.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// `max_workers` of 0 means unlimited.
    pub fn new(name: &str, max_workers: usize, idle_timeout: Duration) -> Result<Self, ExecError> {
        let (tx, rx) = unbounded();
        let (exited_tx, exited_rx) = unbounded();
        let inner = Arc::new(Inner {
            name: name.into(),
            max_workers,
            idle_timeout,
            tx,
            rx,
            idle: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            state: Mutex::new(State::default()),
            available: Condvar::new(),
            exited_tx,
            manager: Mutex::new(None),
        });

        let manager_inner = inner.clone();
        let manager = std::thread::Builder::new()
            .name(format!("{}-manager", name))
            .spawn(move || manager_inner.reap(exited_rx))
            .map_err(ExecError::Spawn)?;
        *inner.manager.lock() = Some(manager);

        Ok(WorkerPool { inner })
    }

    /// Queues `task`, starting a worker when none is idle and the limit allows.
    pub fn execute<F>(&self, task: F) -> Result<(), ExecError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stopped() {
            return Err(ExecError::Stopped);
        }
        self.inner.tx.send(Box::new(task)).map_err(|_| ExecError::Stopped)?;
        self.inner.ensure_worker()
    }

    /// Number of live worker threads
    #[inline]
    pub fn size(&self) -> usize {
        self.inner.state.lock().live
    }

    #[inline]
    pub fn idle_count(&self) -> usize {
        self.inner.idle.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn queued(&self) -> usize {
        self.inner.rx.len()
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stops accepting tasks and joins every worker. Idempotent; when called
    /// from inside a task the calling worker is left to exit on its own.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.available.notify_all();

        let current = std::thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.inner.state.lock().handles.drain().map(|(_, h)| h).collect();
        for h in handles {
            if h.thread().id() == current {
                continue;
            }
            if h.join().is_err() {
                log::error!("{} worker thread panicked", self.inner.name);
            }
        }

        let manager = self.inner.manager.lock().take();
        if let Some(manager) = manager {
            if manager.thread().id() != current && manager.join().is_err() {
                log::error!("{} manager thread panicked", self.inner.name);
            }
        }

        let mut dropped = 0;
        while self.inner.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::debug!("{} stopped, {} queued tasks dropped", self.inner.name, dropped);
        }
    }
}

impl Inner {
    fn ensure_worker(self: &Arc<Self>) -> Result<(), ExecError> {
        let mut state = self.state.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ExecError::Stopped);
        }
        if self.idle.load(Ordering::SeqCst) >= self.rx.len() {
            return Ok(());
        }
        if state.live > 0 {
            self.available.wait_for(&mut state, AVAILABLE_WAIT);
            if self.stopped.load(Ordering::SeqCst) {
                return Err(ExecError::Stopped);
            }
            if self.idle.load(Ordering::SeqCst) >= self.rx.len() {
                return Ok(());
            }
        }
        if self.max_workers > 0 && state.live >= self.max_workers {
            return Ok(());
        }

        let id = state.next_id;
        let inner = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-{}", self.name, id))
            .spawn(move || inner.run(id))
            .map_err(ExecError::Spawn)?;
        state.next_id += 1;
        state.live += 1;
        // Counted idle from the start so a burst does not spawn one thread per task
        self.idle.fetch_add(1, Ordering::SeqCst);
        state.handles.insert(id, handle);
        log::debug!("{} started worker {}, live: {}", self.name, id, state.live);
        Ok(())
    }

    fn run(&self, id: usize) {
        let mut idle_since = Instant::now();
        let mut retired = false;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            match self.rx.recv_timeout(RECV_INTERVAL) {
                Ok(task) => {
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                    if self.stopped.load(Ordering::SeqCst) {
                        self.idle.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    if let Err(e) = catch_unwind(AssertUnwindSafe(task)) {
                        log::error!("{} task panicked, {}", self.name, panic_message(&e));
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    self.available.notify_one();
                    idle_since = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if idle_since.elapsed() < self.idle_timeout {
                        continue;
                    }
                    let mut state = self.state.lock();
                    if self.rx.is_empty() {
                        state.live -= 1;
                        self.idle.fetch_sub(1, Ordering::SeqCst);
                        retired = true;
                        log::debug!("{} worker {} idle, retiring, live: {}", self.name, id, state.live);
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if !retired {
            let mut state = self.state.lock();
            state.live = state.live.saturating_sub(1);
            self.idle.fetch_sub(1, Ordering::SeqCst);
        }
        let _ = self.exited_tx.send(id);
    }

    fn reap(&self, exited: Receiver<usize>) {
        loop {
            match exited.recv_timeout(RECV_INTERVAL) {
                Ok(id) => {
                    let handle = self.state.lock().handles.remove(&id);
                    if let Some(handle) = handle {
                        if handle.join().is_err() {
                            log::error!("{} worker {} panicked", self.name, id);
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

fn panic_message(e: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = e.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = e.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn wait_until<F: Fn() -> bool>(timeout: Duration, f: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        f()
    }

    #[test]
    fn pool_bound_and_idle_eviction() {
        let pool = WorkerPool::new("test-pool", 2, Duration::from_millis(200)).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let running = running.clone();
            let peak = peak.clone();
            let done = done.clone();
            pool.execute(move || {
                let n = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(n, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(30));
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            assert!(pool.size() <= 2);
        }

        assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 10));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(pool.size() <= 2);
        assert!(wait_until(Duration::from_secs(5), || pool.size() == 0));
        pool.stop();
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new("test-panic", 1, Duration::from_secs(10)).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        pool.execute(|| panic!("boom")).unwrap();
        let d = done.clone();
        pool.execute(move || {
            d.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 1));
        assert_eq!(pool.size(), 1);
        pool.stop();
    }

    #[test]
    fn execute_after_stop_fails() {
        let pool = WorkerPool::new("test-stop", 0, Duration::from_secs(10)).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        pool.execute(move || {
            std::thread::sleep(Duration::from_millis(50));
            d.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(wait_until(Duration::from_secs(5), || pool.idle_count() == 0));
        pool.stop();
        // the in-flight task finished before stop returned
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(pool.size(), 0);
        assert!(matches!(pool.execute(|| {}), Err(ExecError::Stopped)));
        pool.stop();
    }
}
