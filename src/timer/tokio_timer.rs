//! `tokio::time`-backed `Timer`. One `tokio::select!` between a sleep and a
//! cancellation channel per registration, so `cancel` never has to reach
//! into a running sleep — it just wins the race if it arrives first.

use crate::timer::{Timer, TimerId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

struct Inner {
    next_id: AtomicU64,
    cancels: DashMap<TimerId, oneshot::Sender<()>>,
}

#[derive(Clone)]
pub struct TokioTimer(Arc<Inner>);

impl TokioTimer {
    pub fn new() -> Self {
        Self(Arc::new(Inner {
            next_id: AtomicU64::new(0),
            cancels: DashMap::new(),
        }))
    }
}

impl Default for TokioTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for TokioTimer {
    fn register(&self, delay_ms: u64, callback: Box<dyn FnOnce() + Send>) -> TimerId {
        let id = TimerId(self.0.next_id.fetch_add(1, Ordering::Relaxed));
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.0.cancels.insert(id, cancel_tx);

        let inner = Arc::clone(&self.0);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                    inner.cancels.remove(&id);
                    callback();
                }
                _ = &mut cancel_rx => {}
            }
        });

        id
    }

    fn cancel(&self, id: TimerId) {
        if let Some((_, tx)) = self.0.cancels.remove(&id) {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn fires_after_delay() {
        let timer = TokioTimer::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        timer.register(10, Box::new(move || flag.store(true, Ordering::SeqCst)));

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_prevents_the_callback() {
        let timer = TokioTimer::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let id = timer.register(50, Box::new(move || flag.store(true, Ordering::SeqCst)));
        timer.cancel(id);

        tokio::time::sleep(StdDuration::from_millis(100)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancelling_twice_is_a_no_op() {
        let timer = TokioTimer::new();
        let id = timer.register(50, Box::new(|| {}));
        timer.cancel(id);
        timer.cancel(id);
    }
}
