//! Keeps the system clock honest when the car has no network.
//!
//! Reachability of a well-known host is taken as proof that NTP is running.
//! Without it, the clock is set from the GPS UTC field at startup and again
//! every time a lock is (re)acquired.

use std::process::{Command, Stdio};

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::{
    common::Fix,
    error::{DashCamError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeSource {
    Network,
    Gps,
}

pub(crate) trait Reachability {
    fn is_reachable(&self, host: &str) -> bool;
}

pub(crate) trait ClockSetter {
    fn set_utc(&mut self, instant: DateTime<Utc>) -> Result<()>;
}

/// One ICMP echo with a short deadline.
#[derive(Debug, Default)]
pub(crate) struct PingProbe;

impl Reachability for PingProbe {
    fn is_reachable(&self, host: &str) -> bool {
        Command::new("ping")
            .args(["-c", "1", "-W", "2", host])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Sets the clock through `date -u`, leaving the timezone alone.
#[derive(Debug, Default)]
pub(crate) struct DateCommandClock;

impl ClockSetter for DateCommandClock {
    fn set_utc(&mut self, instant: DateTime<Utc>) -> Result<()> {
        let status = Command::new("date")
            .arg("-u")
            .arg(format!("--set={}", date_command_arg(&instant)))
            .stdout(Stdio::null())
            .status()
            .map_err(|e| DashCamError::TimeSync(format!("could not run date: {}", e)))?;
        if !status.success() {
            return Err(DashCamError::TimeSync(format!("date exited with {}", status)));
        }
        Ok(())
    }
}

pub(crate) fn date_command_arg(instant: &DateTime<Utc>) -> String {
    instant.format("%Y%m%d %H:%M:%S").to_string()
}

/// Parses the GPS UTC field. Empty or absent means no lock yet.
pub(crate) fn parse_gps_utc(fix: &Fix) -> Result<DateTime<Utc>> {
    let raw = fix
        .utc
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| DashCamError::TimeSync("fix carries no UTC time".to_string()))?;

    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DashCamError::TimeSync(format!("malformed GPS time '{}': {}", raw, e)))
}

pub(crate) struct TimeSync {
    host: String,
    probe: Box<dyn Reachability>,
    clock: Box<dyn ClockSetter>,
}

impl TimeSync {
    pub(crate) fn new(host: impl Into<String>, probe: Box<dyn Reachability>, clock: Box<dyn ClockSetter>) -> Self {
        Self {
            host: host.into(),
            probe,
            clock,
        }
    }

    /**
     * Startup decision. A reachable host means network time is assumed and
     * nothing is touched; otherwise the clock is set from `fix`. A failure to
     * set it is logged only, the next lock will try again.
     */
    pub(crate) fn decide(&mut self, fix: &Fix) -> TimeSource {
        info!("Checking for internet (and NTP) via {}", self.host);
        if self.probe.is_reachable(&self.host) {
            info!("{} is up, assuming NTP keeps the clock.", self.host);
            return TimeSource::Network;
        }

        info!("{} is down, using GPS for time.", self.host);
        if let Err(e) = self.apply_gps_time(fix) {
            warn!("GPS time not applied at startup: {}", e);
        }
        TimeSource::Gps
    }

    /// Sets the system clock to the fix's UTC instant.
    pub(crate) fn apply_gps_time(&mut self, fix: &Fix) -> Result<DateTime<Utc>> {
        let instant = parse_gps_utc(fix)?;
        info!("Setting system time to GPS time {}", instant.to_rfc3339());
        self.clock.set_utc(instant)?;
        Ok(instant)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{
        common::FixQuality,
        test_support::{locked_fix, FakeProbe, RecordingClock},
    };

    fn time_sync(reachable: bool) -> (TimeSync, RecordingClock) {
        let clock = RecordingClock::default();
        let sync = TimeSync::new("time.example", Box::new(FakeProbe::new(reachable)), Box::new(clock.clone()));
        (sync, clock)
    }

    #[test]
    fn reachable_host_leaves_the_clock_alone() {
        let (mut sync, clock) = time_sync(true);
        assert_eq!(sync.decide(&locked_fix(FixQuality::Fix3d)), TimeSource::Network);
        assert_eq!(clock.count(), 0);
    }

    #[test]
    fn unreachable_host_sets_the_clock_from_gps() {
        let (mut sync, clock) = time_sync(false);
        assert_eq!(sync.decide(&locked_fix(FixQuality::Fix3d)), TimeSource::Gps);
        assert_eq!(
            clock.set_to.lock().unwrap().clone(),
            vec![Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()]
        );
    }

    #[test]
    fn startup_without_a_fix_is_not_an_error() {
        let (mut sync, clock) = time_sync(false);
        assert_eq!(sync.decide(&Fix::no_fix()), TimeSource::Gps);
        assert_eq!(clock.count(), 0);
    }

    #[test]
    fn missing_or_malformed_utc_is_a_time_sync_error() {
        let (mut sync, clock) = time_sync(false);

        let mut fix = locked_fix(FixQuality::Fix2d);
        fix.utc = Some("  ".into());
        assert!(matches!(sync.apply_gps_time(&fix), Err(DashCamError::TimeSync(_))));

        fix.utc = Some("01/05/2024 10:00".into());
        assert!(matches!(sync.apply_gps_time(&fix), Err(DashCamError::TimeSync(_))));
        assert_eq!(clock.count(), 0);
    }

    #[test]
    fn the_configured_host_is_probed_once_per_decision() {
        let probe = FakeProbe::new(true);
        let probes = probe.probes.clone();
        let mut sync = TimeSync::new("google.com", Box::new(probe), Box::new(RecordingClock::default()));

        sync.decide(&Fix::no_fix());
        assert_eq!(probes.lock().unwrap().clone(), vec!["google.com".to_string()]);

        // Later syncs go straight to the clock.
        sync.apply_gps_time(&locked_fix(FixQuality::Fix3d)).unwrap();
        assert_eq!(probes.lock().unwrap().len(), 1);
    }

    #[test]
    fn offsets_are_normalised_to_utc() {
        let mut fix = locked_fix(FixQuality::Fix3d);
        fix.utc = Some("2024-05-01T20:00:00+10:00".into());
        assert_eq!(
            parse_gps_utc(&fix).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn date_argument_is_calendar_then_clock() {
        let at = Utc.with_ymd_and_hms(2013, 3, 16, 0, 37, 55).unwrap();
        assert_eq!(date_command_arg(&at), "20130316 00:37:55");
    }
}
