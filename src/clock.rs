//! Time and shutdown plumbing.
//!
//! Wall time comes from `chrono::Utc`, monotonic time from `Instant`. Both
//! are reached through a `Clock` value so tests can pin "now". Background
//! workers share a `ShutdownSignal`; their loop shape is a `select!` between
//! the interval tick and the shutdown receiver.

use chrono::{DateTime, Utc};
use std::time::Instant;
use tokio::sync::watch;

/// Milliseconds since Unix epoch.
pub type Millis = i64;

/// Process clock. `offset_ms` lets tests shift wall time deterministically.
#[derive(Debug, Clone)]
pub struct Clock {
    offset_ms: i64,
}

impl Default for Clock {
    fn default() -> Self {
        Self { offset_ms: 0 }
    }
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test clock shifted by a fixed number of milliseconds.
    pub fn with_offset_ms(offset_ms: i64) -> Self {
        Self { offset_ms }
    }

    /// Current wall time.
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.offset_ms)
    }

    /// Current wall time as epoch milliseconds.
    pub fn now_millis(&self) -> Millis {
        self.now().timestamp_millis()
    }

    /// Monotonic instant for interval measurement.
    pub fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Cooperative shutdown signal for background workers.
///
/// The holder of the `ShutdownSignal` fires once; every `ShutdownReceiver`
/// observes it. Workers finish their in-flight cycle before returning.
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct ShutdownReceiver {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownReceiver {
        ShutdownReceiver { rx: self.tx.subscribe() }
    }

    /// Fire the signal. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownReceiver {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the signal fires. Also resolves if the sender is gone.
    pub async fn recv(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_offset() {
        let base = Clock::new();
        let shifted = Clock::with_offset_ms(60_000);
        let delta = shifted.now_millis() - base.now_millis();
        assert!((59_000..=61_000).contains(&delta));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_receiver() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        assert!(!rx.is_shutdown());

        let handle = tokio::spawn(async move {
            rx.recv().await;
            true
        });

        signal.shutdown();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_receiver_resolves_when_sender_dropped() {
        let signal = ShutdownSignal::new();
        let mut rx = signal.subscribe();
        drop(signal);
        // Must not hang.
        rx.recv().await;
    }
}
