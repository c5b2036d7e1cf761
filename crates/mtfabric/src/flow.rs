// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal dataflow plumbing consumed by the fabric.
//!
//! The fabric does not ship a dataflow engine; it requires only a narrow
//! capability set from its host: named sources and sinks, source fan-out,
//! a recurring clock importer, blocking-loop importers, and an exit
//! signal. This module provides that set over `crossbeam` channels and
//! long-lived named worker threads.
//!
//! Worker threads observe a [`StopFlag`] and exit within one poll period;
//! dropping a [`WorkerHandle`] stops and joins its thread.

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Receiving end of a flow edge.
pub type Source<T> = Receiver<T>;

/// Sending end of a flow edge.
pub type Sink<T> = Sender<T>;

/// Create an unbounded flow edge.
pub fn edge<T>() -> (Sink<T>, Source<T>) {
    unbounded()
}

// ===== Stop flag =====

/// Cooperative stop flag with a wakeup condvar.
///
/// Workers poll `is_stopped` or block in `wait_for`; `stop` wakes every
/// waiter so threads exit without waiting out their full poll period.
pub struct StopFlag {
    stopped: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Default for StopFlag {
    fn default() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }
}

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`, returning early if stopped.
    ///
    /// Returns `true` once the flag is set.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        let mut guard = self.lock.lock();
        if self.is_stopped() {
            return true;
        }
        self.cond.wait_for(&mut guard, timeout);
        self.is_stopped()
    }
}

// ===== Worker threads =====

/// Handle to a long-lived worker thread.
///
/// Dropping the handle stops the worker and joins it.
pub struct WorkerHandle {
    stop: Arc<StopFlag>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request the worker to stop without joining.
    pub fn stop(&self) {
        self.stop.stop();
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("[flow] worker thread panicked");
            }
        }
    }
}

/// Spawn a named worker that observes a stop flag.
pub fn spawn_worker<F>(name: &str, body: F) -> WorkerHandle
where
    F: FnOnce(&StopFlag) + Send + 'static,
{
    let stop = Arc::new(StopFlag::new());
    let stop_for_thread = Arc::clone(&stop);
    let thread = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(&stop_for_thread))
        .unwrap_or_else(|e| panic!("failed to spawn worker '{}': {}", name, e));
    WorkerHandle {
        stop,
        thread: Some(thread),
    }
}

/// Poll period for source-draining workers between stop-flag checks.
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Fan a source out to any number of sinks.
///
/// `crossbeam` receivers share consumption when cloned, so fan-out needs
/// an explicit copy loop. Disconnected sinks are dropped silently.
pub fn fanout<T>(name: &str, source: Source<T>, sinks: Vec<Sink<T>>) -> WorkerHandle
where
    T: Clone + Send + 'static,
{
    spawn_worker(name, move |stop| {
        while !stop.is_stopped() {
            match source.recv_timeout(DRAIN_POLL) {
                Ok(item) => {
                    for sink in &sinks {
                        let _ = sink.send(item.clone());
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    })
}

/// Recurring clock importer: emits the observed `Instant` every `period`.
pub fn recurring_clock(name: &str, period: Duration, sink: Sink<Instant>) -> WorkerHandle {
    spawn_worker(name, move |stop| {
        while !stop.wait_for(period) {
            if sink.send(Instant::now()).is_err() {
                break;
            }
        }
    })
}

// ===== Shutdown signal =====

/// Process-level exit signal.
///
/// The subscriber helper raises this when its subscription-ID map drains;
/// consumers treat it as normal termination.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<StopFlag>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_exit(&self) {
        self.inner.stop();
    }

    pub fn is_exited(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Block until exit is requested or `timeout` elapses.
    ///
    /// Returns `true` if exit was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.inner.wait_for(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_flag_wakes_waiter() {
        let flag = Arc::new(StopFlag::new());
        let waiter = Arc::clone(&flag);
        let handle = thread::spawn(move || {
            let start = Instant::now();
            assert!(waiter.wait_for(Duration::from_secs(10)));
            start.elapsed()
        });
        thread::sleep(Duration::from_millis(50));
        flag.stop();
        let waited = handle.join().expect("waiter should finish");
        assert!(waited < Duration::from_secs(5), "stop should wake early");
    }

    #[test]
    fn fanout_copies_to_all_sinks() {
        let (tx, rx) = edge::<u32>();
        let (a_tx, a_rx) = edge::<u32>();
        let (b_tx, b_rx) = edge::<u32>();
        let _worker = fanout("test-fanout", rx, vec![a_tx, b_tx]);

        tx.send(7).expect("send");
        tx.send(8).expect("send");

        for sink in [&a_rx, &b_rx] {
            assert_eq!(sink.recv_timeout(Duration::from_secs(2)), Ok(7));
            assert_eq!(sink.recv_timeout(Duration::from_secs(2)), Ok(8));
        }
    }

    #[test]
    fn recurring_clock_ticks() {
        let (tx, rx) = edge::<Instant>();
        let _clock = recurring_clock("test-clock", Duration::from_millis(10), tx);
        let first = rx.recv_timeout(Duration::from_secs(2)).expect("tick");
        let second = rx.recv_timeout(Duration::from_secs(2)).expect("tick");
        assert!(second >= first);
    }

    #[test]
    fn worker_joins_on_drop() {
        let worker = spawn_worker("test-idle", |stop| {
            while !stop.wait_for(Duration::from_millis(5)) {}
        });
        drop(worker); // must not hang
    }

    #[test]
    fn shutdown_signal_is_shared() {
        let signal = ShutdownSignal::new();
        let other = signal.clone();
        assert!(!other.is_exited());
        signal.request_exit();
        assert!(other.is_exited());
        assert!(other.wait_timeout(Duration::from_millis(1)));
    }
}
