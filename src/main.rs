mod camera_controller;
mod capture_cycle;
mod common;
mod error;
mod gps_controller;
mod led_controller;
mod power_controller;
mod shutdown_controller;
mod time_sync;
mod track_logger;
mod user_config;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use log::{info, warn};

use crate::{
    camera_controller::open_v4l2_camera,
    capture_cycle::{CaptureCycle, SidecarWriter},
    common::{Pacer, RunControl, ThreadPacer},
    gps_controller::{start_fix_stream, GpsdSource},
    led_controller::{init_ws281x_strip, Indicator, IndicatorSignal, StatusIndicator},
    power_controller::{install_signal_handlers, watch_shutdown_button, CommandPowerOff},
    shutdown_controller::{start_shutdown_watchdog, ShutdownController},
    time_sync::{DateCommandClock, PingProbe, TimeSync},
    track_logger::{GpxLogger, TrackLogger},
    user_config::UserConfig,
};

fn main() -> anyhow::Result<()> {
    let config = UserConfig::read();

    let default_level = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    let pacer: Arc<dyn Pacer> = Arc::new(ThreadPacer);
    let run_control = Arc::new(RunControl::new());

    let strip = init_ws281x_strip(&config.indicator).context("status LED")?;
    let mut indicator = StatusIndicator::new(strip, config.indicator.pixel_count, pacer.clone());
    indicator.show(&IndicatorSignal::startup());

    let camera = open_v4l2_camera(&config.camera, config.cycle.orientation).context("camera")?;

    let gpsd = GpsdSource::new(config.gps.gpsd_addr.clone(), config.gps.read_timeout);
    let fix_stream = start_fix_stream(
        gpsd,
        run_control.clone(),
        pacer.clone(),
        config.gps.retry_interval,
    );
    let fixes = fix_stream.reader();
    info!("First GPS reading: {} fix", fix_stream.latest().quality.as_str());

    let mut logger = GpxLogger::new(config.trip_log_dir.clone());
    if let Err(e) = logger.start(Utc::now()) {
        warn!("Trip logging disabled: {}", e);
    }

    let _signal_thread = install_signal_handlers(run_control.clone());
    let _button_thread = match watch_shutdown_button(
        config.shutdown.button_pin,
        config.shutdown.hold,
        run_control.clone(),
    ) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Shutdown button unavailable, signals only: {}", e);
            None
        }
    };

    let watchdog = start_shutdown_watchdog(
        run_control.clone(),
        Box::new(CommandPowerOff::new(config.shutdown.power_off_cmd.clone())),
        config.shutdown.stall_deadline,
        pacer.clone(),
    );

    indicator.show(&IndicatorSignal::camera_ready());

    let time_sync = TimeSync::new(
        config.time_host.clone(),
        Box::new(PingProbe),
        Box::new(DateCommandClock),
    );
    let mut cycle = CaptureCycle::new(
        config.cycle.clone(),
        fixes.clone(),
        Box::new(camera),
        Box::new(SidecarWriter),
        time_sync,
        run_control.clone(),
        pacer,
    );
    let stats = cycle.run(&mut indicator);
    info!("{:?} after {} GPS readings", stats, fixes.readings());
    if watchdog.disarm() {
        warn!("Shutdown watchdog already powered off");
    }

    ShutdownController::new(
        run_control,
        Box::new(fix_stream),
        Box::new(logger),
        Box::new(CommandPowerOff::new(config.shutdown.power_off_cmd.clone())),
        config.shutdown.join_timeout,
    )
    .execute(&mut indicator);

    Ok(())
}
