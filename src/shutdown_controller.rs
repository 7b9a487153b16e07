use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::{error, info, warn};

use crate::{
    common::{Pacer, RunControl, PAUSE_SLICE},
    error::Result,
    gps_controller::FixStream,
    led_controller::{Indicator, IndicatorSignal},
    power_controller::PowerControl,
    track_logger::TrackLogger,
};

/// A background loop that can be asked to stop and waited on.
pub(crate) trait BackgroundTask {
    fn stop(&mut self) -> Result<()>;
    fn join(&mut self, timeout: Duration) -> Result<()>;
}

impl BackgroundTask for FixStream {
    fn stop(&mut self) -> Result<()> {
        FixStream::stop(self);
        Ok(())
    }

    fn join(&mut self, timeout: Duration) -> Result<()> {
        FixStream::join(self, timeout)
    }
}

/**
 * Ordered, best-effort shutdown:
 * stop requested -> fix stream stopped and joined -> logger terminated ->
 * shutdown signal rendered -> power off.
 * A failing step is logged and the next one runs anyway; power-off is always
 * attempted.
 */
pub(crate) struct ShutdownController {
    run_control: Arc<RunControl>,
    fix_stream: Box<dyn BackgroundTask>,
    logger: Box<dyn TrackLogger>,
    power: Box<dyn PowerControl>,
    join_timeout: Duration,
}

impl ShutdownController {
    pub(crate) fn new(
        run_control: Arc<RunControl>,
        fix_stream: Box<dyn BackgroundTask>,
        logger: Box<dyn TrackLogger>,
        power: Box<dyn PowerControl>,
        join_timeout: Duration,
    ) -> Self {
        Self {
            run_control,
            fix_stream,
            logger,
            power,
            join_timeout,
        }
    }

    /// Runs the protocol. Must be called after the capture loop has returned.
    pub(crate) fn execute(mut self, indicator: &mut dyn Indicator) {
        if self.run_control.request_stop() {
            info!("Stop requested by shutdown controller");
        }

        info!("Stopping GPS fix stream...");
        if let Err(e) = self.fix_stream.stop() {
            warn!("{}", e);
        }
        let stream_exited = match self.fix_stream.join(self.join_timeout) {
            Ok(()) => {
                info!("GPS fix stream closed.");
                true
            }
            Err(e) => {
                warn!("{}", e);
                false
            }
        };

        if let Err(e) = self.logger.terminate() {
            warn!("Track logger not terminated: {}", e);
        }
        // STOPPED means every loop has exited; a detached fix stream keeps us at STOPPING.
        if stream_exited {
            self.run_control.mark_stopped();
        }

        indicator.show(&IndicatorSignal::shutdown());
        indicator.show(&IndicatorSignal::dark());

        if let Err(e) = self.power.power_off() {
            warn!("Power off failed: {}", e);
        }
    }
}

/// Last resort for a main thread that never gets to `ShutdownController::execute`
/// (a wedged camera read, for one).
pub(crate) struct ShutdownWatchdog {
    disarmed: Arc<AtomicBool>,
    thread_handle: thread::JoinHandle<bool>,
}

/**
 * Once a stop has been requested, waits up to `deadline` for the watchdog to be
 * disarmed. If it is not, powers off directly. The thread returns whether it
 * had to fire.
 */
pub(crate) fn start_shutdown_watchdog(
    run_control: Arc<RunControl>,
    mut power: Box<dyn PowerControl + Send>,
    deadline: Duration,
    pacer: Arc<dyn Pacer>,
) -> ShutdownWatchdog {
    let disarmed = Arc::new(AtomicBool::new(false));
    let thread_disarmed = disarmed.clone();

    let thread_handle = thread::spawn(move || {
        while run_control.is_running() && !thread_disarmed.load(Ordering::SeqCst) {
            pacer.sleep(PAUSE_SLICE);
        }

        let mut waited = Duration::ZERO;
        while waited < deadline && !thread_disarmed.load(Ordering::SeqCst) {
            pacer.sleep(PAUSE_SLICE);
            waited += PAUSE_SLICE;
        }
        if thread_disarmed.load(Ordering::SeqCst) {
            return false;
        }

        error!("Shutdown stalled for {:?} after stop request, powering off", deadline);
        if let Err(e) = power.power_off() {
            error!("Power off failed: {}", e);
        }
        true
    });

    ShutdownWatchdog {
        disarmed,
        thread_handle,
    }
}

impl ShutdownWatchdog {
    /// Called once the main thread has reached the shutdown protocol. Returns
    /// true if the watchdog had already fired.
    pub(crate) fn disarm(self) -> bool {
        self.disarmed.store(true, Ordering::SeqCst);
        self.thread_handle.join().unwrap_or(false)
    }

    #[cfg(test)]
    fn join(self) -> bool {
        self.thread_handle.join().unwrap()
    }
}
