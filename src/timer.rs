// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Named, cancellable protocol timers.
//!
//! One background scheduler task owns all timer state; mutations arrive over
//! a command channel, so `add`/`restart`/`cancel` never wait on user
//! callbacks. The scheduler keeps a priority queue of pending expiries and
//! sleeps until the earliest one. Stale queue entries left behind by
//! restart/cancel/replace are skipped via per-timer generation counters.
//!
//! Callbacks run on the scheduler task after all bookkeeping for the expiry
//! is done; a panicking callback is caught and logged, and the scheduler
//! keeps running. Periodic timers re-arm before their callback is invoked,
//! one-shot timers are removed.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use log::{debug, error, trace};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Bound on timer-id types: cheap to copy, hashable, printable.
pub trait TimerId: Copy + Eq + Hash + fmt::Debug + Send + 'static {}

impl<T: Copy + Eq + Hash + fmt::Debug + Send + 'static> TimerId for T {}

/// Callback invoked on expiry, on the scheduler task.
pub type TimerCallback = Box<dyn Fn() + Send + 'static>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("timer manager is shut down")]
    Stopped,
}

enum Command<I> {
    Add {
        id: I,
        duration: Duration,
        periodic: bool,
        callback: TimerCallback,
    },
    Restart(I),
    Cancel(I),
    StopAll,
    Shutdown,
}

struct Entry {
    duration: Duration,
    periodic: bool,
    callback: TimerCallback,
    generation: u64,
}

struct Fire<I> {
    at: Instant,
    id: I,
    generation: u64,
}

impl<I> PartialEq for Fire<I> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl<I> Eq for Fire<I> {}

impl<I> PartialOrd for Fire<I> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<I> Ord for Fire<I> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at)
    }
}

/// Lightweight handle for scheduling timers; clonable, shared with every
/// connection.
pub struct TimerHandle<I: TimerId> {
    cmd_tx: mpsc::UnboundedSender<Command<I>>,
}

impl<I: TimerId> Clone for TimerHandle<I> {
    fn clone(&self) -> Self {
        TimerHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

impl<I: TimerId> TimerHandle<I> {
    /// Schedules a timer, replacing any existing timer with the same id.
    /// Fails only when the scheduler has shut down.
    pub fn add_timer(
        &self,
        id: I,
        duration: Duration,
        callback: TimerCallback,
        periodic: bool,
    ) -> Result<I, TimerError> {
        self.cmd_tx
            .send(Command::Add {
                id,
                duration,
                periodic,
                callback,
            })
            .map_err(|_| TimerError::Stopped)?;
        Ok(id)
    }

    /// Resets the expiry to now plus the original duration. No-op for an
    /// unknown id.
    pub fn restart_timer(&self, id: I) -> Result<(), TimerError> {
        self.cmd_tx
            .send(Command::Restart(id))
            .map_err(|_| TimerError::Stopped)
    }

    /// Cancels the timer with the given id. No-op for an unknown id.
    pub fn cancel_timer(&self, id: I) -> Result<(), TimerError> {
        self.cmd_tx
            .send(Command::Cancel(id))
            .map_err(|_| TimerError::Stopped)
    }

    /// Cancels every pending timer while keeping the scheduler alive.
    pub fn stop_all(&self) -> Result<(), TimerError> {
        self.cmd_tx
            .send(Command::StopAll)
            .map_err(|_| TimerError::Stopped)
    }
}

/// Owns the scheduler task. One instance per server; connections get
/// [`TimerHandle`]s.
pub struct TimerManager<I: TimerId> {
    cmd_tx: mpsc::UnboundedSender<Command<I>>,
    task: Option<JoinHandle<()>>,
}

impl<I: TimerId> TimerManager<I> {
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Scheduler::new(cmd_rx).run());
        TimerManager {
            cmd_tx,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> TimerHandle<I> {
        TimerHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub fn add_timer(
        &self,
        id: I,
        duration: Duration,
        callback: TimerCallback,
        periodic: bool,
    ) -> Result<I, TimerError> {
        self.handle().add_timer(id, duration, callback, periodic)
    }

    pub fn restart_timer(&self, id: I) -> Result<(), TimerError> {
        self.handle().restart_timer(id)
    }

    pub fn cancel_timer(&self, id: I) -> Result<(), TimerError> {
        self.handle().cancel_timer(id)
    }

    pub fn stop_all(&self) -> Result<(), TimerError> {
        self.handle().stop_all()
    }

    /// Stops the scheduler and waits for it to finish. Pending timers never
    /// fire afterwards.
    pub async fn shutdown(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl<I: TimerId> Default for TimerManager<I> {
    fn default() -> Self {
        TimerManager::new()
    }
}

impl<I: TimerId> Drop for TimerManager<I> {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

struct Scheduler<I: TimerId> {
    cmd_rx: mpsc::UnboundedReceiver<Command<I>>,
    entries: HashMap<I, Entry>,
    queue: BinaryHeap<std::cmp::Reverse<Fire<I>>>,
    next_generation: u64,
}

impl<I: TimerId> Scheduler<I> {
    fn new(cmd_rx: mpsc::UnboundedReceiver<Command<I>>) -> Self {
        Scheduler {
            cmd_rx,
            entries: HashMap::new(),
            queue: BinaryHeap::new(),
            next_generation: 0,
        }
    }

    async fn run(mut self) {
        debug!(target: "doip::timer", "timer scheduler started");
        loop {
            let deadline = self.queue.peek().map(|f| f.0.at);
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Add { id, duration, periodic, callback }) => {
                            self.add(id, duration, periodic, callback);
                        }
                        Some(Command::Restart(id)) => self.restart(id),
                        Some(Command::Cancel(id)) => {
                            self.entries.remove(&id);
                        }
                        Some(Command::StopAll) => {
                            self.entries.clear();
                            self.queue.clear();
                        }
                        Some(Command::Shutdown) | None => break,
                    }
                }
                _ = wait_until(deadline) => {
                    self.fire_expired(Instant::now());
                }
            }
        }
        debug!(target: "doip::timer", "timer scheduler stopped");
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn add(&mut self, id: I, duration: Duration, periodic: bool, callback: TimerCallback) {
        let generation = self.bump_generation();
        trace!(
            target: "doip::timer",
            "arm {:?} for {:?} (periodic={})",
            id,
            duration,
            periodic
        );
        self.entries.insert(
            id,
            Entry {
                duration,
                periodic,
                callback,
                generation,
            },
        );
        self.queue.push(std::cmp::Reverse(Fire {
            at: Instant::now() + duration,
            id,
            generation,
        }));
    }

    fn restart(&mut self, id: I) {
        let generation = self.bump_generation();
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.generation = generation;
        let at = Instant::now() + entry.duration;
        self.queue.push(std::cmp::Reverse(Fire { at, id, generation }));
    }

    fn fire_expired(&mut self, now: Instant) {
        while let Some(std::cmp::Reverse(next)) = self.queue.peek() {
            if next.at > now {
                break;
            }
            let fire = self.queue.pop().expect("peeked entry").0;
            let Some(entry) = self.entries.get(&fire.id) else {
                continue; // cancelled
            };
            if entry.generation != fire.generation {
                continue; // superseded by replace/restart
            }

            trace!(target: "doip::timer", "expired {:?}", fire.id);
            if entry.periodic {
                self.queue.push(std::cmp::Reverse(Fire {
                    at: fire.at + entry.duration,
                    id: fire.id,
                    generation: fire.generation,
                }));
                let entry = self.entries.get(&fire.id).expect("periodic entry");
                invoke(fire.id, &entry.callback);
            } else {
                let entry = self.entries.remove(&fire.id).expect("one-shot entry");
                invoke(fire.id, &entry.callback);
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn invoke<I: TimerId>(id: I, callback: &TimerCallback) {
    if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
        error!(target: "doip::timer", "timer {:?} callback panicked", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::advance;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestTimer {
        A,
        B,
    }

    fn counter_callback(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once() {
        let mut mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(
            TestTimer::A,
            Duration::from_millis(100),
            counter_callback(&fired),
            false,
        )
        .unwrap();
        settle().await;

        advance(Duration::from_millis(99)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        advance(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // One-shot: no further firings.
        advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_fires_repeatedly() {
        let mut mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(
            TestTimer::A,
            Duration::from_millis(50),
            counter_callback(&fired),
            true,
        )
        .unwrap();
        settle().await;

        advance(Duration::from_millis(175)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        mgr.cancel_timer(TestTimer::A).unwrap();
        settle().await;
        advance(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn add_replaces_timer_with_same_id() {
        let mut mgr = TimerManager::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(
            TestTimer::A,
            Duration::from_millis(50),
            counter_callback(&first),
            false,
        )
        .unwrap();
        settle().await;
        mgr.add_timer(
            TestTimer::A,
            Duration::from_millis(100),
            counter_callback(&second),
            false,
        )
        .unwrap();
        settle().await;

        advance(Duration::from_millis(60)).await;
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 0, "replaced timer must not fire");
        assert_eq!(second.load(Ordering::SeqCst), 0);

        advance(Duration::from_millis(50)).await;
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_extends_deadline() {
        let mut mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(
            TestTimer::A,
            Duration::from_millis(100),
            counter_callback(&fired),
            false,
        )
        .unwrap();
        settle().await;

        advance(Duration::from_millis(80)).await;
        settle().await;
        mgr.restart_timer(TestTimer::A).unwrap();
        settle().await;

        advance(Duration::from_millis(80)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "restart pushed expiry out");

        advance(Duration::from_millis(30)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Restarting an unknown id is a no-op.
        mgr.restart_timer(TestTimer::B).unwrap();
        settle().await;
        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_cancels_everything_but_scheduler_survives() {
        let mut mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(
            TestTimer::A,
            Duration::from_millis(50),
            counter_callback(&fired),
            false,
        )
        .unwrap();
        mgr.add_timer(
            TestTimer::B,
            Duration::from_millis(60),
            counter_callback(&fired),
            true,
        )
        .unwrap();
        settle().await;

        mgr.stop_all().unwrap();
        settle().await;
        advance(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Scheduler still accepts new timers.
        mgr.add_timer(
            TestTimer::A,
            Duration::from_millis(10),
            counter_callback(&fired),
            false,
        )
        .unwrap();
        settle().await;
        advance(Duration::from_millis(15)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_does_not_kill_scheduler() {
        let mut mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        mgr.add_timer(
            TestTimer::A,
            Duration::from_millis(10),
            Box::new(|| panic!("boom")),
            false,
        )
        .unwrap();
        mgr.add_timer(
            TestTimer::B,
            Duration::from_millis(20),
            counter_callback(&fired),
            false,
        )
        .unwrap();
        settle().await;

        advance(Duration::from_millis(30)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1, "survivor fired after panic");
        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_shutdown_fails() {
        let mut mgr: TimerManager<TestTimer> = TimerManager::new();
        mgr.shutdown().await;
        let err = mgr
            .add_timer(TestTimer::A, Duration::from_millis(10), Box::new(|| {}), false)
            .unwrap_err();
        assert_eq!(err, TimerError::Stopped);
    }
}
