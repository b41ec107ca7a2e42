//! Run progress and ETA.

use std::fmt;
use std::time::{Duration, Instant};

/// Called after every update with the percentage and the current ETA.
pub type ProgressObserver = Box<dyn FnMut(f64, Option<Duration>)>;

pub struct ProgressTracker {
    total_steps: usize,
    current_step: usize,
    started: Option<Instant>,
    observer: Option<ProgressObserver>,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("total_steps", &self.total_steps)
            .field("current_step", &self.current_step)
            .field("started", &self.started)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(total_steps: usize) -> Self {
        ProgressTracker {
            total_steps,
            current_step: 0,
            started: None,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn set_observer(&mut self, observer: Option<ProgressObserver>) {
        self.observer = observer;
    }

    pub fn take_observer(&mut self) -> Option<ProgressObserver> {
        self.observer.take()
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Mark the start of the run; the ETA is measured from here.
    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    fn start_at(&mut self, now: Instant) {
        self.started = Some(now);
        self.current_step = 0;
    }

    /// Record `current_step` (clamped to the total) and notify the observer.
    /// Returns the new percentage.
    pub fn update_progress(&mut self, current_step: usize) -> f64 {
        self.update_progress_at(current_step, Instant::now())
    }

    fn update_progress_at(&mut self, current_step: usize, now: Instant) -> f64 {
        // Without an explicit start, time is counted from the first update.
        self.started.get_or_insert(now);
        self.current_step = current_step.min(self.total_steps);
        let pct = self.percentage();
        let eta = self.eta_at(now);
        if let Some(observer) = self.observer.as_mut() {
            observer(pct, eta);
        }
        pct
    }

    /// Completion in `[0, 100]`; an empty run counts as complete.
    pub fn percentage(&self) -> f64 {
        if self.total_steps == 0 {
            return 100.0;
        }
        self.current_step as f64 / self.total_steps as f64 * 100.0
    }

    pub fn get_eta(&self) -> Option<Duration> {
        self.eta_at(Instant::now())
    }

    /// Linear extrapolation of the remaining time as seen from `now`.
    pub fn eta_at(&self, now: Instant) -> Option<Duration> {
        let started = self.started?;
        if self.current_step == 0 {
            return None;
        }
        let elapsed = now.saturating_duration_since(started);
        let remaining = self.total_steps - self.current_step;
        Some(elapsed.mul_f64(remaining as f64 / self.current_step as f64))
    }
}
