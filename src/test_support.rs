//! Fakes shared by the unit tests. Time is virtual: nothing here sleeps.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use palette::Srgb;

use crate::{
    camera_controller::{Camera, CaptureRequest},
    capture_cycle::EventSink,
    common::{CaptureEvent, Fix, FixQuality, Pacer, RunControl},
    error::{DashCamError, Result},
    gps_controller::FixProvider,
    led_controller::{Indicator, IndicatorHardware, IndicatorSignal},
    power_controller::PowerControl,
    shutdown_controller::BackgroundTask,
    time_sync::{ClockSetter, Reachability},
    track_logger::TrackLogger,
};

type Hook = Box<dyn FnOnce() + Send>;

/// Virtual clock. `sleep` advances it and fires any hooks that came due.
#[derive(Default)]
pub(crate) struct ManualPacer {
    elapsed: Mutex<Duration>,
    hooks: Mutex<Vec<(Duration, Option<Hook>)>>,
}

impl ManualPacer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap()
    }

    /// Runs `hook` once the virtual clock reaches `at`.
    pub(crate) fn at(&self, at: Duration, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().unwrap().push((at, Some(Box::new(hook))));
    }
}

impl Pacer for ManualPacer {
    fn sleep(&self, duration: Duration) {
        let now = {
            let mut elapsed = self.elapsed.lock().unwrap();
            *elapsed += duration;
            *elapsed
        };
        let due: Vec<Hook> = self
            .hooks
            .lock()
            .unwrap()
            .iter_mut()
            .filter(|(at, _)| *at <= now)
            .filter_map(|(_, hook)| hook.take())
            .collect();
        for hook in due {
            hook();
        }
    }
}

pub(crate) fn locked_fix(quality: FixQuality) -> Fix {
    Fix {
        latitude: Some(-37.8136),
        longitude: Some(144.9631),
        altitude: Some(31.0),
        speed: Some(16.7),
        climb: Some(0.0),
        track: Some(90.0),
        utc: Some("2024-05-01T10:00:00.000Z".to_string()),
        quality,
    }
}

/// Fix qualities laid out on the virtual clock: entry `i` holds from
/// `i * spacing`, the last entry holds forever.
pub(crate) struct ScriptedFixes {
    pacer: Arc<ManualPacer>,
    spacing: Duration,
    qualities: Vec<FixQuality>,
}

impl ScriptedFixes {
    pub(crate) fn new(pacer: Arc<ManualPacer>, spacing: Duration, qualities: Vec<FixQuality>) -> Self {
        Self {
            pacer,
            spacing,
            qualities,
        }
    }
}

impl FixProvider for ScriptedFixes {
    fn latest(&self) -> Fix {
        let idx = (self.pacer.elapsed().as_nanos() / self.spacing.as_nanos()) as usize;
        let quality = self.qualities[idx.min(self.qualities.len() - 1)];
        if quality.has_lock() {
            locked_fix(quality)
        } else {
            Fix::no_fix()
        }
    }
}

/// Indicator that records each signal and charges its duration to the clock.
pub(crate) struct RecordingIndicator {
    pacer: Arc<ManualPacer>,
    pub(crate) shown: Arc<Mutex<Vec<IndicatorSignal>>>,
    journal: Option<Journal>,
}

impl RecordingIndicator {
    pub(crate) fn new(pacer: Arc<ManualPacer>) -> Self {
        Self {
            pacer,
            shown: Arc::new(Mutex::new(Vec::new())),
            journal: None,
        }
    }

    pub(crate) fn journaled(pacer: Arc<ManualPacer>, journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new(pacer)
        }
    }

    pub(crate) fn count(&self, signal: &IndicatorSignal) -> usize {
        self.shown.lock().unwrap().iter().filter(|s| *s == signal).count()
    }
}

impl Indicator for RecordingIndicator {
    fn show(&mut self, signal: &IndicatorSignal) {
        if let Some(journal) = &self.journal {
            journal.record(format!("indicator:{}", signal.name));
        }
        self.shown.lock().unwrap().push(signal.clone());
        self.pacer.sleep(signal.duration());
    }
}

/// Pixel frames as the hardware received them.
#[derive(Clone, Default)]
pub(crate) struct RecordingHardware {
    pub(crate) frames: Arc<Mutex<Vec<(Vec<Srgb<u8>>, u8)>>>,
    pub(crate) fail: bool,
}

impl RecordingHardware {
    pub(crate) fn brightness_trace(&self) -> Vec<u8> {
        self.frames.lock().unwrap().iter().map(|(_, b)| *b).collect()
    }
}

impl IndicatorHardware for RecordingHardware {
    fn render(&mut self, pixels: &[Srgb<u8>], brightness: u8) -> Result<()> {
        self.frames.lock().unwrap().push((pixels.to_vec(), brightness));
        if self.fail {
            return Err(DashCamError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "dma busy",
            )));
        }
        Ok(())
    }
}

/// Camera that fails on chosen calls and can request a stop after N calls.
pub(crate) struct ScriptedCamera {
    pub(crate) calls: Arc<Mutex<Vec<CaptureRequest>>>,
    fail_on: Vec<usize>,
    stop_after: Option<(usize, Arc<RunControl>)>,
    journal: Option<Journal>,
}

impl ScriptedCamera {
    pub(crate) fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_on: Vec::new(),
            stop_after: None,
            journal: None,
        }
    }

    /// 1-based call numbers that raise a capture error.
    pub(crate) fn failing_on(mut self, calls: &[usize]) -> Self {
        self.fail_on = calls.to_vec();
        self
    }

    pub(crate) fn stopping_after(mut self, calls: usize, run: Arc<RunControl>) -> Self {
        self.stop_after = Some((calls, run));
        self
    }

    pub(crate) fn journaled(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }
}

impl Camera for ScriptedCamera {
    fn capture(&mut self, request: &CaptureRequest) -> Result<PathBuf> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len()
        };
        if let Some(journal) = &self.journal {
            journal.record("camera:capture");
        }
        if let Some((after, run)) = &self.stop_after {
            if call >= *after {
                run.request_stop();
            }
        }
        if self.fail_on.contains(&call) {
            return Err(DashCamError::Capture(format!("sensor timeout on call {}", call)));
        }
        Ok(PathBuf::from(format!("/tmp/dashcam/image-{}.jpg", call)))
    }
}

#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    pub(crate) events: Arc<Mutex<Vec<CaptureEvent>>>,
    pub(crate) pacer: Option<Arc<ManualPacer>>,
    pub(crate) recorded_at: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSink {
    pub(crate) fn timed(pacer: Arc<ManualPacer>) -> Self {
        Self {
            pacer: Some(pacer),
            ..Self::default()
        }
    }
}

impl EventSink for RecordingSink {
    fn record(&mut self, event: CaptureEvent) -> Result<()> {
        if let Some(pacer) = &self.pacer {
            self.recorded_at.lock().unwrap().push(pacer.elapsed());
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Ordered log of collaborator calls across fakes.
#[derive(Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub(crate) fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Entries with repeated neighbours collapsed.
    pub(crate) fn steps(&self) -> Vec<String> {
        let mut steps = self.entries();
        steps.dedup();
        steps
    }
}

pub(crate) struct FakeTask {
    pub(crate) journal: Journal,
    pub(crate) fail_stop: bool,
    pub(crate) fail_join: bool,
}

impl BackgroundTask for FakeTask {
    fn stop(&mut self) -> Result<()> {
        self.journal.record("fix_stream:stop");
        if self.fail_stop {
            return Err(DashCamError::ShutdownStep("stop refused".into()));
        }
        Ok(())
    }

    fn join(&mut self, _timeout: Duration) -> Result<()> {
        self.journal.record("fix_stream:join");
        if self.fail_join {
            return Err(DashCamError::ShutdownStep("join timed out".into()));
        }
        Ok(())
    }
}

pub(crate) struct FakeLogger {
    pub(crate) journal: Journal,
    pub(crate) fail: bool,
}

impl TrackLogger for FakeLogger {
    fn start(&mut self, _started_at: DateTime<Utc>) -> Result<()> {
        self.journal.record("logger:start");
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        self.journal.record("logger:terminate");
        if self.fail {
            return Err(DashCamError::ShutdownStep("pkill exited with 1".into()));
        }
        Ok(())
    }
}

pub(crate) struct FakePower {
    pub(crate) journal: Journal,
}

impl PowerControl for FakePower {
    fn power_off(&mut self) -> Result<()> {
        self.journal.record("power:off");
        Ok(())
    }
}

pub(crate) struct FakeProbe {
    pub(crate) reachable: bool,
    pub(crate) probes: Arc<Mutex<Vec<String>>>,
}

impl FakeProbe {
    pub(crate) fn new(reachable: bool) -> Self {
        Self {
            reachable,
            probes: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Reachability for FakeProbe {
    fn is_reachable(&self, host: &str) -> bool {
        self.probes.lock().unwrap().push(host.to_string());
        self.reachable
    }
}

#[derive(Clone, Default)]
pub(crate) struct RecordingClock {
    pub(crate) set_to: Arc<Mutex<Vec<DateTime<Utc>>>>,
}

impl RecordingClock {
    pub(crate) fn count(&self) -> usize {
        self.set_to.lock().unwrap().len()
    }
}

impl ClockSetter for RecordingClock {
    fn set_utc(&mut self, instant: DateTime<Utc>) -> Result<()> {
        self.set_to.lock().unwrap().push(instant);
        Ok(())
    }
}
