use std::{fs, path::PathBuf, sync::Arc};

use chrono::Utc;
use json::object;
use log::{error, info, warn};

use crate::{
    camera_controller::{Camera, CaptureRequest},
    common::{CaptureEvent, Fix, Pacer, RunControl},
    error::{DashCamError, Result},
    gps_controller::FixProvider,
    led_controller::{Indicator, IndicatorSignal},
    time_sync::TimeSync,
    user_config::CycleSettings,
};

/// Takes ownership of each capture event as soon as it exists.
pub(crate) trait EventSink {
    fn record(&mut self, event: CaptureEvent) -> Result<()>;
}

/// Writes `<image>.json` next to each photo with the time and fix it was taken at.
#[derive(Debug, Default)]
pub(crate) struct SidecarWriter;

impl EventSink for SidecarWriter {
    fn record(&mut self, event: CaptureEvent) -> Result<()> {
        let path = sidecar_path(&event.image_path);
        let body = capture_event_json(&event).pretty(2);
        fs::write(&path, body).map_err(|e| {
            DashCamError::Capture(format!("could not write {}: {}", path.display(), e))
        })
    }
}

pub(crate) fn sidecar_path(image_path: &std::path::Path) -> PathBuf {
    image_path.with_extension("json")
}

pub(crate) fn capture_event_json(event: &CaptureEvent) -> json::JsonValue {
    let fix = &event.fix;
    object! {
        captured_at: event.captured_at.to_rfc3339(),
        image: event.image_path.to_string_lossy().into_owned(),
        fix: object! {
            quality: fix.quality.as_str(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            altitude: fix.altitude,
            speed: fix.speed,
            climb: fix.climb,
            track: fix.track,
            utc: fix.utc.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CycleState {
    AwaitingFix,
    LockedIdle,
    Capturing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CycleStats {
    pub(crate) captures: u64,
    pub(crate) capture_failures: u64,
    pub(crate) searches: u64,
    pub(crate) locks: u64,
    pub(crate) gps_time_syncs: u64,
}

/**
 * The main loop. Each pass reads the freshest fix and either keeps searching,
 * announces a new lock, or takes a photo. It runs on the calling thread until
 * the run control leaves RUNNING and never captures on the pass that notices.
 */
pub(crate) struct CaptureCycle {
    settings: CycleSettings,
    fixes: Arc<dyn FixProvider>,
    camera: Box<dyn Camera>,
    sink: Box<dyn EventSink>,
    time_sync: TimeSync,
    run_control: Arc<RunControl>,
    pacer: Arc<dyn Pacer>,
    state: CycleState,
    stats: CycleStats,
}

impl CaptureCycle {
    pub(crate) fn new(
        settings: CycleSettings,
        fixes: Arc<dyn FixProvider>,
        camera: Box<dyn Camera>,
        sink: Box<dyn EventSink>,
        time_sync: TimeSync,
        run_control: Arc<RunControl>,
        pacer: Arc<dyn Pacer>,
    ) -> Self {
        Self {
            settings,
            fixes,
            camera,
            sink,
            time_sync,
            run_control,
            pacer,
            state: CycleState::AwaitingFix,
            stats: CycleStats::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> CycleState {
        self.state
    }

    pub(crate) fn run(&mut self, indicator: &mut dyn Indicator) -> CycleStats {
        let source = self.time_sync.decide(&self.fixes.latest());
        info!("Time source: {:?}", source);

        while self.run_control.is_running() {
            let fix = self.fixes.latest();
            let locked = fix.quality.has_lock();

            self.state = match (self.state, locked) {
                (CycleState::AwaitingFix, false) => {
                    self.stats.searches += 1;
                    indicator.show(&IndicatorSignal::searching());
                    self.run_control.pause(self.settings.poll_interval, self.pacer.as_ref());
                    CycleState::AwaitingFix
                }
                (CycleState::AwaitingFix, true) => {
                    info!("GPS locked! ({} fix)", fix.quality.as_str());
                    self.stats.locks += 1;
                    indicator.show(&IndicatorSignal::lock_acquired());
                    match self.time_sync.apply_gps_time(&fix) {
                        Ok(_) => self.stats.gps_time_syncs += 1,
                        Err(e) => warn!("Skipping GPS time sync until next lock: {}", e),
                    }
                    CycleState::LockedIdle
                }
                (CycleState::LockedIdle | CycleState::Capturing, true) => {
                    if !self.run_control.is_running() {
                        break;
                    }
                    self._capture(fix, indicator);
                    self.run_control.pause(self.settings.time_interval, self.pacer.as_ref());
                    CycleState::Capturing
                }
                (CycleState::LockedIdle | CycleState::Capturing, false) => {
                    info!("GPS fix lost, searching again.");
                    CycleState::AwaitingFix
                }
            };
        }

        info!(
            "Capture cycle stopped: {} captured, {} failed, {} lock(s)",
            self.stats.captures, self.stats.capture_failures, self.stats.locks
        );
        self.stats
    }

    fn _capture(&mut self, fix: Fix, indicator: &mut dyn Indicator) {
        let taken_at = Utc::now();
        let request = CaptureRequest {
            resolution: self.settings.resolution,
            orientation: self.settings.orientation,
            taken_at,
        };

        let image_path = match self.camera.capture(&request) {
            Ok(path) => path,
            Err(e) => {
                self.stats.capture_failures += 1;
                error!("Capture failed, continuing: {}", e);
                return;
            }
        };

        self.stats.captures += 1;
        let event = CaptureEvent {
            captured_at: taken_at,
            image_path,
            fix,
        };
        if let Err(e) = self.sink.record(event) {
            warn!("Capture metadata not stored: {}", e);
        }
        indicator.show(&IndicatorSignal::captured());
    }
}
