//! Single-slot cancellable timers for debounce and idle tracking.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// At most one pending timer per slot. Resetting cancels the pending one
/// before scheduling the next.
///
/// Every schedule gets a fresh generation number which is handed to the
/// fire callback. A fire that races with a reset carries a stale generation
/// and is rejected by [`TimerSlot::take_fired`].
#[derive(Debug, Default)]
pub struct TimerSlot {
    token: Option<CancellationToken>,
    generation: u64,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset<F, Fut>(&mut self, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => on_fire(generation).await,
            }
        });
        self.token = Some(token);
        generation
    }

    pub fn cancel(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.token.is_some()
    }

    /// Accept a fire notification. True only for the current schedule, which
    /// is then cleared.
    pub fn take_fired(&mut self, generation: u64) -> bool {
        if self.token.is_some() && generation == self.generation {
            self.token = None;
            true
        } else {
            false
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
