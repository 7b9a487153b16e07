use std::{
    path::PathBuf,
    sync::atomic::{AtomicU8, Ordering},
    thread,
    time::Duration,
};

use chrono::{DateTime, Utc};

/// Longest uninterrupted sleep inside `RunControl::pause`. Bounds how long a
/// loop can take to notice a stop request.
pub(crate) const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// Confidence of a GPS fix. Ordered so `quality >= FixQuality::Fix2d` reads as
/// "locked".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub(crate) enum FixQuality {
    #[default]
    NoFix,
    Fix2d,
    Fix3d,
}

impl FixQuality {
    /// gpsd reports 0 (unknown) and 1 (no fix) separately, neither is usable.
    pub(crate) fn from_gpsd_mode(mode: u64) -> Self {
        match mode {
            2 => FixQuality::Fix2d,
            3 => FixQuality::Fix3d,
            _ => FixQuality::NoFix,
        }
    }

    pub(crate) fn has_lock(&self) -> bool {
        *self >= FixQuality::Fix2d
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            FixQuality::NoFix => "none",
            FixQuality::Fix2d => "2d",
            FixQuality::Fix3d => "3d",
        }
    }
}

/**
 * One GPS reading. Fields gpsd did not report are `None`.
 * `utc` is kept as reported (RFC 3339) and only parsed when the clock is set.
 */
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Fix {
    pub(crate) latitude: Option<f64>,
    pub(crate) longitude: Option<f64>,
    pub(crate) altitude: Option<f64>,
    pub(crate) speed: Option<f64>,
    pub(crate) climb: Option<f64>,
    pub(crate) track: Option<f64>,
    pub(crate) utc: Option<String>,
    pub(crate) quality: FixQuality,
}

impl Fix {
    pub(crate) fn no_fix() -> Self {
        Self::default()
    }
}

/// Record of one photograph, handed to persistence as soon as it is built.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CaptureEvent {
    pub(crate) captured_at: DateTime<Utc>,
    pub(crate) image_path: PathBuf,
    pub(crate) fix: Fix,
}

/// Process lifecycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    Running,
    Stopping,
    Stopped,
}

const RUNNING: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/**
 * Shared cancellation signal for the fix stream, the capture cycle and the
 * shutdown path. Every loop polls `is_running()` at least once per iteration;
 * a stop request that lands just after a poll is seen on the next one, at most
 * one read or `PAUSE_SLICE` later.
 */
#[derive(Debug)]
pub(crate) struct RunControl {
    state: AtomicU8,
}

impl RunControl {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
        }
    }

    pub(crate) fn state(&self) -> RunState {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => RunState::Running,
            STOPPING => RunState::Stopping,
            _ => RunState::Stopped,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Moves RUNNING -> STOPPING. Returns true only for the caller that made
    /// the transition.
    pub(crate) fn request_stop(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Moves STOPPING -> STOPPED.
    pub(crate) fn mark_stopped(&self) -> bool {
        self.state
            .compare_exchange(STOPPING, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /**
     * Sleeps for `total` in slices of at most `PAUSE_SLICE`.
     * Returns false as soon as a stop request is observed, true if the full
     * duration elapsed while running.
     */
    pub(crate) fn pause(&self, total: Duration, pacer: &dyn Pacer) -> bool {
        let mut remaining = total;
        while !remaining.is_zero() {
            if !self.is_running() {
                return false;
            }
            let slice = remaining.min(PAUSE_SLICE);
            pacer.sleep(slice);
            remaining -= slice;
        }
        self.is_running()
    }
}

/// Where time passes. Indicator rendering and loop waits go through this so
/// their cost in wall-clock time is explicit.
pub(crate) trait Pacer: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}
