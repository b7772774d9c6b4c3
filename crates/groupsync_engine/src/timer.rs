//! One-shot timers and cancellation.
//!
//! A [`Timer`] runs a callback after a delay unless it is cancelled first.
//! Callbacks never touch a machine directly: they post an event back
//! through the owner's [`Poster`](crate::mailbox::Poster).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A scheduled callback. Dropping the timer cancels it.
#[derive(Debug)]
pub struct Timer {
    name: &'static str,
    stop: CancellationToken,
    fired: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl Timer {
    /// Runs `callback` after `delay`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(name: &'static str, delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_flag = Arc::clone(&fired);
        trace!(timer = name, delay_ms = delay.as_millis() as u64, "scheduled");
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = stop_child.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    fired_flag.store(true, Ordering::SeqCst);
                    trace!(timer = name, "fired");
                    callback();
                }
            }
        });
        Self {
            name,
            stop,
            fired,
            task,
        }
    }

    /// Timer name, for diagnostics.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns true once the callback has run.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Cancels the timer. A no-op if it already fired.
    pub fn cancel(&self) {
        if !self.stop.is_cancelled() {
            trace!(timer = self.name, "cancelled");
            self.stop.cancel();
        }
    }

    /// Returns true once the timer task has finished, fired or not.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (count, cb) = counter();
        let timer = Timer::schedule("t", Duration::from_secs(5), cb);

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!timer.has_fired());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(timer.has_fired());
        assert_eq!(timer.name(), "t");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_callback() {
        let (count, cb) = counter();
        let timer = Timer::schedule("t", Duration::from_secs(1), cb);
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timer.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn drop_cancels() {
        let (count, cb) = counter();
        drop(Timer::schedule("t", Duration::from_secs(1), cb));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
