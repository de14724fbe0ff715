// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The doorbell watcher worker thread.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Runs a tick function on a fixed interval.
///
/// The stop token is observed at the top of each tick, so work in flight
/// when a stop is requested completes before the thread exits.
pub struct TickWorker {
    shared: Arc<TickShared>,
    thread: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct TickShared {
    stop: AtomicBool,
    ticks: Mutex<u64>,
    tick_done: Condvar,
    wake: Condvar,
}

impl TickWorker {
    pub fn spawn(interval: Duration, mut tick: impl FnMut() + Send + 'static) -> Self {
        let shared = Arc::new(TickShared::default());
        let worker = shared.clone();
        let thread = std::thread::spawn(move || {
            while !worker.stop.load(Ordering::SeqCst) {
                tick();
                let mut ticks = worker.ticks.lock();
                *ticks += 1;
                worker.tick_done.notify_all();
                if !worker.stop.load(Ordering::SeqCst) {
                    worker.wake.wait_for(&mut ticks, interval);
                }
            }
        });
        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Blocks until a tick that began after this call has completed.
    ///
    /// Waiting for two tick boundaries guarantees a full pass even when a
    /// tick is already in flight, so state written before the call is
    /// observed by the pass waited on.
    pub fn wait_for_tick(&self) {
        if self.thread.is_none() {
            return;
        }
        let mut ticks = self.shared.ticks.lock();
        let target = *ticks + 2;
        // Wake the sleeper rather than waiting out its interval.
        self.shared.wake.notify_all();
        while *ticks < target {
            self.shared.tick_done.wait(&mut ticks);
            self.shared.wake.notify_all();
        }
    }

    /// Stops the worker and joins it.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::SeqCst);
        {
            let _ticks = self.shared.ticks.lock();
            self.shared.wake.notify_all();
        }
        if thread.join().is_err() {
            tracing::error!("doorbell watcher panicked");
        }
    }
}

impl Drop for TickWorker {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn ticks_run_and_rendezvous() {
        let count = Arc::new(AtomicU64::new(0));
        let seen = count.clone();
        let worker = TickWorker::spawn(Duration::from_millis(1), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        worker.wait_for_tick();
        let first = count.load(Ordering::SeqCst);
        assert!(first >= 2);
        worker.wait_for_tick();
        assert!(count.load(Ordering::SeqCst) > first);
        worker.stop();
    }

    #[test]
    fn stop_joins_deterministically() {
        let worker = TickWorker::spawn(Duration::from_secs(3600), || {});
        // The long interval does not delay shutdown; the sleeper is woken.
        worker.stop();
    }
}
