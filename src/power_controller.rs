use std::{
    io,
    process::{Command, Stdio},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{error, info, warn};
use rppal::gpio::{Gpio, InputPin, Level, Trigger};

use crate::{
    common::RunControl,
    error::{DashCamError, Result},
};

/// Longest the button thread sleeps between checks while the button is held.
const BUTTON_POLL: Duration = Duration::from_millis(100);

/// Last step of shutdown. Fire-and-forget: the process never sees it finish.
pub(crate) trait PowerControl {
    fn power_off(&mut self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub(crate) struct CommandPowerOff {
    argv: Vec<String>,
}

impl CommandPowerOff {
    pub(crate) fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl PowerControl for CommandPowerOff {
    fn power_off(&mut self) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| DashCamError::ShutdownStep("no power-off command configured".to_string()))?;
        info!("Shutting down: {}", self.argv.join(" "));
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|e| DashCamError::ShutdownStep(format!("could not run {}: {}", program, e)))
    }
}

/**
 * Turns raw button levels into a single long-press event. The press has to be
 * continuous: any release before `hold` starts the count again, which also
 * swallows contact bounce.
 */
#[derive(Debug)]
pub(crate) struct HoldDetector {
    hold: Duration,
    pressed_since: Option<Instant>,
    fired: bool,
}

impl HoldDetector {
    pub(crate) fn new(hold: Duration) -> Self {
        Self {
            hold,
            pressed_since: None,
            fired: false,
        }
    }

    /// Returns true exactly once per press, when it has lasted `hold`.
    pub(crate) fn observe(&mut self, pressed: bool, now: Instant) -> bool {
        if !pressed {
            self.pressed_since = None;
            self.fired = false;
            return false;
        }

        let since = *self.pressed_since.get_or_insert(now);
        if !self.fired && now.duration_since(since) >= self.hold {
            self.fired = true;
            return true;
        }
        false
    }
}

fn _gpio_error(e: rppal::gpio::Error) -> DashCamError {
    DashCamError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
}

/**
 * Watches the shutdown button (pull-up input, pressed = LOW) on its own
 * thread. A long press requests a stop; the main thread does the rest.
 */
pub(crate) fn watch_shutdown_button(
    pin: u8,
    hold: Duration,
    run_control: Arc<RunControl>,
) -> Result<JoinHandle<()>> {
    let mut input_pin = Gpio::new()
        .map_err(_gpio_error)?
        .get(pin)
        .map_err(_gpio_error)?
        .into_input_pullup();
    input_pin.set_interrupt(Trigger::Both).map_err(_gpio_error)?;

    Ok(thread::spawn(move || {
        info!("Watching shutdown button on pin {}...", pin);
        _main_button_loop(input_pin, hold, run_control);
    }))
}

fn _main_button_loop(mut input_pin: InputPin, hold: Duration, run_control: Arc<RunControl>) {
    let mut detector = HoldDetector::new(hold);
    while run_control.is_running() {
        // Wakes on every edge, and at least every BUTTON_POLL to time the hold.
        if let Err(e) = input_pin.poll_interrupt(false, Some(BUTTON_POLL)) {
            warn!("Shutdown button poll failed: {}", e);
            thread::sleep(BUTTON_POLL);
            continue;
        }

        let pressed = input_pin.read() == Level::Low;
        if detector.observe(pressed, Instant::now()) {
            info!("Shutdown button held for {:?}", hold);
            run_control.request_stop();
            break;
        }
    }
}

/**
 * SIGINT/SIGTERM request a stop, same as the button. Handled on a dedicated
 * thread with its own current-thread runtime.
 */
pub(crate) fn install_signal_handlers(run_control: Arc<RunControl>) -> JoinHandle<()> {
    thread::spawn(move || {
        use tokio::signal::unix::{signal, SignalKind};

        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("Failed to create signal handler runtime: {}", e);
                return;
            }
        };

        rt.block_on(async {
            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(term), Ok(int)) => (term, int),
                    (Err(e), _) | (_, Err(e)) => {
                        error!("Failed to install signal handlers: {}", e);
                        return;
                    }
                };

            // Stays registered for the whole run so repeats are logged, not lost.
            loop {
                let name = tokio::select! {
                    _ = sigterm.recv() => "SIGTERM",
                    _ = sigint.recv() => "SIGINT",
                };
                _on_signal(name, &run_control);
            }
        });
    })
}

/// First signal requests the stop. Later ones only report that shutdown is
/// already under way; the shutdown watchdog bounds how long that can take.
fn _on_signal(name: &str, run_control: &RunControl) -> bool {
    if run_control.request_stop() {
        warn!("Received {}, shutting down", name);
        true
    } else {
        warn!("Received {} again, shutdown already in progress ({:?})", name, run_control.state());
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOLD: Duration = Duration::from_secs(2);

    #[test]
    fn short_presses_do_not_fire() {
        let t0 = Instant::now();
        let mut detector = HoldDetector::new(HOLD);
        assert!(!detector.observe(true, t0));
        assert!(!detector.observe(true, t0 + Duration::from_millis(1900)));
        assert!(!detector.observe(false, t0 + Duration::from_millis(1950)));
        // The count restarts after a release.
        assert!(!detector.observe(true, t0 + Duration::from_millis(2100)));
        assert!(!detector.observe(true, t0 + Duration::from_millis(3000)));
    }

    #[test]
    fn held_press_fires_once() {
        let t0 = Instant::now();
        let mut detector = HoldDetector::new(HOLD);
        assert!(!detector.observe(true, t0));
        assert!(detector.observe(true, t0 + HOLD));
        assert!(!detector.observe(true, t0 + HOLD + BUTTON_POLL));

        assert!(!detector.observe(false, t0 + Duration::from_secs(3)));
        assert!(!detector.observe(true, t0 + Duration::from_secs(4)));
        assert!(detector.observe(true, t0 + Duration::from_secs(6)));
    }

    #[test]
    fn bounce_resets_the_hold() {
        let t0 = Instant::now();
        let mut detector = HoldDetector::new(HOLD);
        for ms in (0..1900).step_by(100) {
            detector.observe(ms % 300 != 200, t0 + Duration::from_millis(ms));
        }
        assert!(!detector.observe(true, t0 + Duration::from_millis(2000)));
    }

    #[test]
    fn only_the_first_signal_requests_the_stop() {
        let run = RunControl::new();
        assert!(_on_signal("SIGINT", &run));
        assert!(!_on_signal("SIGINT", &run));
        assert!(!_on_signal("SIGTERM", &run));
        assert_eq!(run.state(), crate::common::RunState::Stopping);
    }

    #[test]
    fn empty_power_off_command_is_rejected() {
        let err = CommandPowerOff::new(vec![]).power_off().unwrap_err();
        assert!(matches!(err, DashCamError::ShutdownStep(_)));
    }

    #[test]
    fn power_off_does_not_wait_for_the_command() {
        let started = Instant::now();
        CommandPowerOff::new(vec!["sleep".into(), "5".into()])
            .power_off()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_power_off_binary_is_a_shutdown_step_error() {
        let err = CommandPowerOff::new(vec!["no-such-poweroff-binary".into()])
            .power_off()
            .unwrap_err();
        assert!(matches!(err, DashCamError::ShutdownStep(_)));
    }
}
