//! Trailing-edge debounce: every call cancels the pending one and restarts
//! the timer, so only the last call in a burst proceeds.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Pending>,
}

#[derive(Default)]
struct Pending {
    generation: u64,
    stop: Option<oneshot::Sender<()>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self { Self { delay, pending: Mutex::new(Pending::default()) } }

    pub fn delay(&self) -> Duration { self.delay }

    fn lock(&self) -> MutexGuard<'_, Pending> { self.pending.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Resolves `true` once the delay passes with no newer call, `false` when
    /// a newer call cancelled this one.
    pub async fn settle(&self) -> bool {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let generation = {
            let mut p = self.lock();
            // Cancel previous
            if let Some(prev) = p.stop.take() { let _ = prev.send(()); }
            p.generation = p.generation.wrapping_add(1);
            p.stop = Some(stop_tx);
            p.generation
        };
        if self.delay.is_zero() {
            self.release(generation);
            return true;
        }
        tokio::select! {
            _ = &mut stop_rx => false,
            _ = tokio::time::sleep(self.delay) => {
                self.release(generation);
                true
            }
        }
    }

    fn release(&self, generation: u64) {
        let mut p = self.lock();
        if p.generation == generation { p.stop = None; }
    }
}
