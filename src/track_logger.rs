use std::{
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use chrono::{DateTime, Utc};
use log::info;

use crate::error::{DashCamError, Result};

/// The external route recorder. The controller only starts it and asks it to
/// go away; it never waits on it.
pub(crate) trait TrackLogger {
    fn start(&mut self, started_at: DateTime<Utc>) -> Result<()>;
    fn terminate(&mut self) -> Result<()>;
}

/// `gpxlogger` from gpsd-clients, daemonised.
#[derive(Debug, Clone)]
pub(crate) struct GpxLogger {
    binary: String,
    log_dir: PathBuf,
    /// Metres moved before a new point is logged.
    min_move_m: u32,
    /// Seconds without a fix before the track is split.
    split_interval_s: u32,
}

impl GpxLogger {
    pub(crate) fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: "gpxlogger".to_string(),
            log_dir: log_dir.into(),
            min_move_m: 25,
            split_interval_s: 60,
        }
    }

    fn args(&self, started_at: &DateTime<Utc>) -> Vec<String> {
        vec![
            "-d".to_string(),
            "-f".to_string(),
            trip_log_path(&self.log_dir, started_at).display().to_string(),
            "-m".to_string(),
            self.min_move_m.to_string(),
            "-i".to_string(),
            self.split_interval_s.to_string(),
        ]
    }
}

pub(crate) fn trip_log_path(log_dir: &Path, started_at: &DateTime<Utc>) -> PathBuf {
    log_dir.join(format!("trip_log_{}.gpx", started_at.format("%Y-%m-%d-%H-%M")))
}

fn _run(program: &str, args: &[String], failed: fn(String) -> DashCamError) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .status()
        .map_err(|e| failed(format!("could not run {}: {}", program, e)))?;
    if !status.success() {
        return Err(failed(format!("{} exited with {}", program, status)));
    }
    Ok(())
}

impl TrackLogger for GpxLogger {
    fn start(&mut self, started_at: DateTime<Utc>) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir)?;
        info!("Starting GPS logger into {}", self.log_dir.display());
        _run(&self.binary, &self.args(&started_at), |msg| {
            DashCamError::Io(io::Error::new(io::ErrorKind::Other, msg))
        })
    }

    fn terminate(&mut self) -> Result<()> {
        _run("pkill", &[self.binary.clone()], DashCamError::ShutdownStep)?;
        info!("{} closed cleanly", self.binary);
        Ok(())
    }
}
