//! A named, independently start/stop-able periodic task.
//!
//! At most one loop is live per poller. `start` on a running poller aborts
//! the old loop before installing the new one; `stop` is a no-op when
//! nothing is running. Each loop checks its generation before every tick, so
//! once `stop` returns no further tick of the old loop begins.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    /// End this loop after the current tick. Used by ticks that decide to
    /// stop their own poller, since aborting from inside would cancel the
    /// tick mid-way.
    Stop,
}

struct RunningLoop {
    id: u64,
    period: Duration,
    handle: JoinHandle<()>,
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Poller {
    name: &'static str,
    next_id: AtomicU64,
    active: Arc<AtomicU64>,
    live: Arc<AtomicUsize>,
    current: Mutex<Option<RunningLoop>>,
}

impl Poller {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            active: Arc::new(AtomicU64::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
            current: Mutex::new(None),
        }
    }

    /// Runs `tick` every `period`, first after one full period. A tick that
    /// overruns the period delays the next one; missed ticks are skipped
    /// rather than bunched. Returns the id of the new loop.
    pub fn start<F, Fut>(&self, period: Duration, mut tick: F) -> u64
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickControl> + Send + 'static,
    {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.active.store(id, Ordering::SeqCst);

        if let Some(previous) = current.take() {
            previous.handle.abort();
            debug!(poller = self.name, old = previous.id, new = id, "poller: replaced");
        } else {
            debug!(poller = self.name, id, period_ms = period.as_millis() as u64, "poller: started");
        }

        let name = self.name;
        let active = Arc::clone(&self.active);
        let live = Arc::clone(&self.live);
        let handle = tokio::spawn(async move {
            let _guard = LiveGuard::enter(&live);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                interval.tick().await;
                if active.load(Ordering::SeqCst) != id {
                    break;
                }
                if tick().await == TickControl::Stop {
                    let _ = active.compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst);
                    debug!(poller = name, id, "poller: stopped by its own tick");
                    break;
                }
            }
        });

        *current = Some(RunningLoop { id, period, handle });
        id
    }

    /// Returns whether a loop was running.
    pub fn stop(&self) -> bool {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let was_active = self.active.swap(0, Ordering::SeqCst) != 0;
        if let Some(previous) = current.take() {
            previous.handle.abort();
            if was_active {
                debug!(poller = self.name, id = previous.id, "poller: stopped");
            }
        }
        was_active
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst) != 0
    }

    pub fn active_id(&self) -> Option<u64> {
        match self.active.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn period(&self) -> Option<Duration> {
        if !self.is_running() {
            return None;
        }
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| running.period)
    }

    /// Number of loop tasks not yet torn down, including aborted ones the
    /// runtime has not dropped yet.
    pub fn live_loops(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "tests/poller_tests.rs"]
mod tests;
