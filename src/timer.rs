//! Rearmable one-shot timers for the async drivers.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// One-shot timers keyed by `T`, each expiring as a message on an internal
/// channel.
///
/// Aborting a sleeping task cannot recall an expiry it already queued, so
/// every arm gets a fresh generation and [`TimerSet::expired`] only yields
/// expiries whose generation is still the armed one.
pub struct TimerSet<T> {
    armed: HashMap<T, (u64, JoinHandle<()>)>,
    generation: u64,
    tx: mpsc::UnboundedSender<(T, u64)>,
    rx: mpsc::UnboundedReceiver<(T, u64)>,
}

impl<T> TimerSet<T>
where
    T: Copy + Eq + Hash + Debug + Send + 'static,
{
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            armed: HashMap::new(),
            generation: 0,
            tx,
            rx,
        }
    }

    /// Arms `timer`, replacing any earlier arming of it.
    pub fn arm(&mut self, timer: T, after: Duration) {
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send((timer, generation));
        });
        if let Some((_, previous)) = self.armed.insert(timer, (generation, handle)) {
            previous.abort();
        }
    }

    /// Disarms `timer`. Returns whether it was armed.
    pub fn halt(&mut self, timer: T) -> bool {
        match self.armed.remove(&timer) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, timer: T) -> bool {
        self.armed.contains_key(&timer)
    }

    /// Waits for the next expiry of a timer that is still armed.
    ///
    /// Cancel safe: a live expiry is only taken off the channel in the same
    /// poll that returns it.
    pub async fn expired(&mut self) -> T {
        loop {
            let Some((timer, generation)) = self.rx.recv().await else {
                // the sender lives in `self`
                return std::future::pending().await;
            };
            match self.armed.get(&timer) {
                Some((current, _)) if *current == generation => {
                    self.armed.remove(&timer);
                    return timer;
                }
                _ => debug!(timer = ?timer, generation, "stale timer expiry dropped"),
            }
        }
    }
}

impl<T> Default for TimerSet<T>
where
    T: Copy + Eq + Hash + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TimerSet<T> {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.armed.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Tick {
        Retry,
        Wait,
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_delivered_once() {
        let mut timers = TimerSet::new();
        timers.arm(Tick::Retry, Duration::from_millis(10));
        assert!(timers.is_armed(Tick::Retry));
        assert_eq!(timers.expired().await, Tick::Retry);
        assert!(!timers.is_armed(Tick::Retry));
        assert!(timeout(Duration::from_millis(100), timers.expired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_drops_queued_expiry() {
        let mut timers = TimerSet::new();
        timers.arm(Tick::Retry, Duration::from_millis(10));
        // let the first expiry land in the channel
        sleep(Duration::from_millis(15)).await;
        timers.arm(Tick::Retry, Duration::from_millis(50));

        assert!(timeout(Duration::from_millis(20), timers.expired()).await.is_err());
        assert_eq!(timers.expired().await, Tick::Retry);
        assert!(timeout(Duration::from_millis(100), timers.expired()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_drops_queued_expiry() {
        let mut timers = TimerSet::new();
        timers.arm(Tick::Retry, Duration::from_millis(10));
        timers.arm(Tick::Wait, Duration::from_millis(30));
        sleep(Duration::from_millis(15)).await;

        assert!(timers.halt(Tick::Retry));
        assert!(!timers.halt(Tick::Retry));
        assert_eq!(timers.expired().await, Tick::Wait);
    }
}
