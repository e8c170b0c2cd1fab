use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Cooperative control flags shared by a session's producer, consumer and
/// the control plane
#[derive(Debug, Default)]
pub struct ControlSignals {
    stop: AtomicBool,
    pause: AtomicBool,
    /// Last step number announced by the loop
    step: AtomicU64,
}

impl ControlSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Set the pause flag, returning its previous value
    pub fn pause(&self) -> bool {
        self.pause.swap(true, Ordering::SeqCst)
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    pub fn set_step(&self, step: u64) {
        self.step.store(step, Ordering::SeqCst);
    }

    pub fn step(&self) -> u64 {
        self.step.load(Ordering::SeqCst)
    }
}
