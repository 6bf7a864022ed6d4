use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of an adapter bound to one RPC call.
///
/// `Created -> Subscribed` on the first subscribe, `Subscribed -> Active` on the first request,
/// and any state `-> Terminated` on the first terminal signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Lifecycle {
    Created = 0,
    Subscribed = 1,
    Active = 2,
    Terminated = 3,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Created,
            1 => Lifecycle::Subscribed,
            2 => Lifecycle::Active,
            _ => Lifecycle::Terminated,
        }
    }
}

/// A [`Lifecycle`] shared between callback contexts. Every transition is a compare-and-swap, so
/// two threads racing on the same transition see exactly one winner.
#[derive(Debug)]
pub struct AtomicLifecycle(AtomicU8);

impl AtomicLifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(Lifecycle::Created as u8))
    }

    pub fn load(&self) -> Lifecycle {
        Lifecycle::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_terminated(&self) -> bool {
        self.load() == Lifecycle::Terminated
    }

    /// `Created -> Subscribed`. Returns `false` if a subscriber was already attached or the
    /// adapter already terminated.
    pub fn subscribe(&self) -> bool {
        self.transition(Lifecycle::Created, Lifecycle::Subscribed)
    }

    /// `Subscribed -> Active`. A no-op in any other state.
    pub fn activate(&self) -> bool {
        self.transition(Lifecycle::Subscribed, Lifecycle::Active)
    }

    /// Move to `Terminated`. Returns `true` only for the call that performed the transition;
    /// every later caller gets `false` and must not signal a terminal.
    pub fn terminate(&self) -> bool {
        self.0.swap(Lifecycle::Terminated as u8, Ordering::AcqRel) != Lifecycle::Terminated as u8
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for AtomicLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
