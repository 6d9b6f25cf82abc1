//! The `Timer` capability (spec §5): one round-timeout alarm per meter
//! actor. Grounded in the original's `EventManager`/simulation clock, but
//! this is the real-time ambient implementation rather than the simulated
//! discrete-event one (`device.rs` keeps a lightweight stand-in of that
//! side for the simulated meter).

pub mod tokio_timer;

/// Opaque handle to a registered timer, returned by `register` and
/// consumed by `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// A single round-timeout alarm source. Implementations must make
/// `cancel` idempotent: cancelling an id that has already fired or was
/// never registered is a no-op, since the round driver cancels
/// optimistically whenever a round ends early (spec §5).
pub trait Timer: Send + Sync {
    /// Schedules `callback` to run after `delay_ms` milliseconds, returning
    /// a handle that can later be passed to `cancel`.
    fn register(&self, delay_ms: u64, callback: Box<dyn FnOnce() + Send>) -> TimerId;

    /// Cancels a previously registered timer. A no-op if it already fired
    /// or does not exist.
    fn cancel(&self, id: TimerId);
}
