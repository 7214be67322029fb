//! Job phases and monotonic progress reporting.

use std::panic::AssertUnwindSafe;

use serde::Serialize;
use tracing::warn;

use crate::transfer::panic_message;

/// Orchestrator state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Executing,
    Transferring,
    CleaningUp,
    Done,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Executing => "executing",
            Phase::Transferring => "transferring",
            Phase::CleaningUp => "cleaning_up",
            Phase::Done => "done",
        }
    }

    /// Percent range covered by this phase.
    fn band(&self) -> (f64, f64) {
        match self {
            Phase::Planning => (0.0, 10.0),
            Phase::Executing => (10.0, 80.0),
            Phase::Transferring => (80.0, 95.0),
            Phase::CleaningUp => (95.0, 95.0),
            Phase::Done => (100.0, 100.0),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Receives progress updates from the orchestrator.
///
/// All calls come from the task that called `submit`, one at a time.
pub trait ProgressObserver: Send {
    fn on_progress(&mut self, phase: Phase, percent: f64, message: &str);
}

impl<F> ProgressObserver for F
where
    F: FnMut(Phase, f64, &str) + Send,
{
    fn on_progress(&mut self, phase: Phase, percent: f64, message: &str) {
        self(phase, percent, message)
    }
}

/// Observer that ignores every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn on_progress(&mut self, _phase: Phase, _percent: f64, _message: &str) {}
}

/// Maps phase-relative progress onto the overall percentage and keeps it non-decreasing.
///
/// An observer that panics is muted for the rest of the job; the job itself
/// carries on.
pub struct ProgressReporter<'a> {
    observer: &'a mut dyn ProgressObserver,
    phase: Phase,
    last: f64,
    muted: bool,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(observer: &'a mut dyn ProgressObserver) -> Self {
        Self {
            observer,
            phase: Phase::Planning,
            last: 0.0,
            muted: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn percent(&self) -> f64 {
        self.last
    }

    /// Enter `phase` and report its starting percentage.
    pub fn enter(&mut self, phase: Phase, message: &str) {
        self.phase = phase;
        let (start, _) = phase.band();
        self.emit(start, message);
    }

    /// Report `done` of `total` units of the current phase.
    pub fn advance(&mut self, done: usize, total: usize, message: &str) {
        let (start, end) = self.phase.band();
        let fraction = if total == 0 {
            1.0
        } else {
            (done as f64 / total as f64).min(1.0)
        };
        self.emit(start + (end - start) * fraction, message);
    }

    /// Report the end of the current phase's band.
    pub fn finish_phase(&mut self, message: &str) {
        let (_, end) = self.phase.band();
        self.emit(end, message);
    }

    fn emit(&mut self, percent: f64, message: &str) {
        let percent = percent.clamp(0.0, 100.0).max(self.last);
        self.last = percent;
        if self.muted {
            return;
        }

        let phase = self.phase;
        let observer = &mut *self.observer;
        let call = std::panic::catch_unwind(AssertUnwindSafe(|| {
            observer.on_progress(phase, percent, message)
        }));
        if let Err(panic) = call {
            warn!(
                "Progress observer panicked at {} {:.1}%: {}; further updates dropped",
                phase,
                percent,
                panic_message(panic.as_ref())
            );
            self.muted = true;
        }
    }
}
