use std::{io, sync::Arc, time::Duration};

use log::{debug, info};
use palette::Srgb;
use rs_ws281x::{ChannelBuilder, Controller, ControllerBuilder};

use crate::{
    common::Pacer,
    error::{DashCamError, Result},
    user_config::IndicatorSettings,
};

pub(crate) const MAX_BRIGHTNESS: u8 = 255;
/// Updates per half of a pulse.
const PULSE_STEPS: u32 = 32;

pub(crate) const BLACK: Srgb<u8> = Srgb::new(0, 0, 0);
pub(crate) const WHITE: Srgb<u8> = Srgb::new(255, 255, 255);
pub(crate) const RED: Srgb<u8> = Srgb::new(255, 0, 0);
pub(crate) const GREEN: Srgb<u8> = Srgb::new(0, 255, 0);
pub(crate) const BLUE: Srgb<u8> = Srgb::new(0, 0, 255);
pub(crate) const PURPLE: Srgb<u8> = Srgb::new(255, 0, 255);

/// Something that can put pixels on the light.
pub(crate) trait IndicatorHardware {
    fn render(&mut self, pixels: &[Srgb<u8>], brightness: u8) -> Result<()>;
}

/// Consumer-facing side of the status light. `show` blocks for
/// `signal.duration()`.
pub(crate) trait Indicator {
    fn show(&mut self, signal: &IndicatorSignal);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BrightnessCurve {
    Solid,
    Blink { brightness: u8 },
    Pulse { peak: u8 },
}

/**
 * One rendering request: a color, how its brightness moves, how long one
 * repetition lasts and how many repetitions to play.
 * For `Blink`, `duration_ms` is the length of each of the on and off halves.
 */
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IndicatorSignal {
    pub(crate) name: &'static str,
    pub(crate) color: Srgb<u8>,
    pub(crate) curve: BrightnessCurve,
    pub(crate) duration_ms: u64,
    pub(crate) repeat_count: u32,
}

impl IndicatorSignal {
    pub(crate) fn startup() -> Self {
        Self::blink("startup", WHITE, 250, MAX_BRIGHTNESS, 2)
    }

    pub(crate) fn camera_ready() -> Self {
        Self::blink("camera-ready", PURPLE, 500, MAX_BRIGHTNESS, 1)
    }

    pub(crate) fn searching() -> Self {
        Self::pulse("searching", RED, 80, 500, 1)
    }

    pub(crate) fn lock_acquired() -> Self {
        Self::pulse("lock-acquired", BLUE, 100, 250, 3)
    }

    pub(crate) fn captured() -> Self {
        Self::pulse("captured", GREEN, 40, 250, 1)
    }

    pub(crate) fn shutdown() -> Self {
        Self::blink("shutdown", RED, 250, MAX_BRIGHTNESS, 5)
    }

    /// Light off, no hold.
    pub(crate) fn dark() -> Self {
        Self {
            name: "dark",
            color: BLACK,
            curve: BrightnessCurve::Solid,
            duration_ms: 0,
            repeat_count: 1,
        }
    }

    fn blink(name: &'static str, color: Srgb<u8>, half_ms: u64, brightness: u8, times: u32) -> Self {
        Self {
            name,
            color,
            curve: BrightnessCurve::Blink { brightness },
            duration_ms: half_ms,
            repeat_count: times,
        }
    }

    fn pulse(name: &'static str, color: Srgb<u8>, peak: u8, total_ms: u64, times: u32) -> Self {
        Self {
            name,
            color,
            curve: BrightnessCurve::Pulse { peak },
            duration_ms: total_ms,
            repeat_count: times,
        }
    }

    /// Wall-clock time the signal takes to play in full.
    pub(crate) fn duration(&self) -> Duration {
        let once = match self.curve {
            BrightnessCurve::Blink { .. } => self.duration_ms * 2,
            _ => self.duration_ms,
        };
        Duration::from_millis(once * self.repeat_count as u64)
    }
}

/**
 * Renders signals onto the indicator. Every primitive blocks the caller for
 * its stated duration through the pacer. The only state kept is what is
 * currently lit.
 */
pub(crate) struct StatusIndicator<H: IndicatorHardware> {
    hardware: H,
    pixel_count: usize,
    pacer: Arc<dyn Pacer>,
    color: Srgb<u8>,
    brightness: u8,
}

impl<H: IndicatorHardware> StatusIndicator<H> {
    pub(crate) fn new(hardware: H, pixel_count: usize, pacer: Arc<dyn Pacer>) -> Self {
        Self {
            hardware,
            pixel_count: pixel_count.max(1),
            pacer,
            color: BLACK,
            brightness: 0,
        }
    }

    /// Color and brightness currently on the light.
    pub(crate) fn current(&self) -> (Srgb<u8>, u8) {
        (self.color, self.brightness)
    }

    /// Every pixel to `color` at full brightness, no delay.
    pub(crate) fn solid(&mut self, color: Srgb<u8>) {
        self._render(color, MAX_BRIGHTNESS);
    }

    pub(crate) fn off(&mut self) {
        self._render(BLACK, 0);
    }

    /// One on/off cycle. Blocks for `2 * duration`.
    pub(crate) fn blink(&mut self, color: Srgb<u8>, duration: Duration, brightness: u8) {
        self._render(color, brightness);
        self.pacer.sleep(duration);
        self._render(BLACK, brightness);
        self.pacer.sleep(duration);
    }

    /**
     * Linear ramp from `start` to `end` in `steps` updates spread over `total`.
     * Step `i` shows `start + (end - start) * i / steps`, so the last update
     * stops one step short of `end`. Blocks for `total`.
     */
    pub(crate) fn fade(&mut self, color: Srgb<u8>, start: u8, end: u8, steps: u32, total: Duration) {
        let steps = steps.max(1);
        let pause = total / steps;
        let delta = end as i32 - start as i32;
        for i in 0..steps {
            let level = start as i32 + delta * i as i32 / steps as i32;
            self._render(color, level.clamp(0, MAX_BRIGHTNESS as i32) as u8);
            self.pacer.sleep(pause);
        }
    }

    /// Fade up to `peak` over half of `total`, back down over the other half,
    /// then off.
    pub(crate) fn pulse(&mut self, color: Srgb<u8>, peak: u8, total: Duration) {
        self.fade(color, 0, peak, PULSE_STEPS, total / 2);
        self.fade(color, peak, 0, PULSE_STEPS, total / 2);
        self.off();
    }

    pub(crate) fn render_signal(&mut self, signal: &IndicatorSignal) {
        let (was, level) = self.current();
        debug!("Indicator: {} (was {:?} at {})", signal.name, was, level);
        let duration = Duration::from_millis(signal.duration_ms);
        for _ in 0..signal.repeat_count {
            match signal.curve {
                BrightnessCurve::Solid => {
                    self.solid(signal.color);
                    self.pacer.sleep(duration);
                }
                BrightnessCurve::Blink { brightness } => self.blink(signal.color, duration, brightness),
                BrightnessCurve::Pulse { peak } => self.pulse(signal.color, peak, duration),
            }
        }
    }

    fn _render(&mut self, color: Srgb<u8>, brightness: u8) {
        let pixels = vec![color; self.pixel_count];
        if let Err(e) = self.hardware.render(&pixels, brightness) {
            // Logged only; the caller's timing is unaffected.
            debug!("Indicator render failed: {}", e);
        }
        self.color = color;
        self.brightness = brightness;
    }
}

impl<H: IndicatorHardware> Indicator for StatusIndicator<H> {
    fn show(&mut self, signal: &IndicatorSignal) {
        self.render_signal(signal);
    }
}

/// WS2812 pixel(s) driven over PWM/DMA.
pub(crate) struct Ws281xStrip {
    controller: Controller,
}

/**
 * Brings up the ws281x controller. Failure here is fatal: without the
 * indicator the operator has no feedback at all.
 */
pub(crate) fn init_ws281x_strip(settings: &IndicatorSettings) -> Result<Ws281xStrip> {
    info!(
        "Starting LED indicator on pin {} ({} pixel(s))...",
        settings.control_pin, settings.pixel_count
    );
    let controller = ControllerBuilder::new()
        .freq(800_000)
        .dma(settings.dma_channel)
        .channel(
            0,
            ChannelBuilder::new()
                .pin(settings.control_pin)
                .count(settings.pixel_count as i32)
                .brightness(MAX_BRIGHTNESS)
                .strip_type(rs_ws281x::StripType::Ws2812)
                .build(),
        )
        .build()
        .map_err(|e| DashCamError::FatalInit(format!("ws281x controller: {:?}", e)))?;

    Ok(Ws281xStrip { controller })
}

impl IndicatorHardware for Ws281xStrip {
    fn render(&mut self, pixels: &[Srgb<u8>], brightness: u8) -> Result<()> {
        self.controller.set_brightness(0, brightness);
        let leds = self.controller.leds_mut(0);
        for (led, color) in leds.iter_mut().zip(pixels) {
            *led = [color.blue, color.green, color.red, 0];
        }
        self.controller
            .render()
            .map_err(|e| DashCamError::Io(io::Error::new(io::ErrorKind::Other, format!("{:?}", e))))
    }
}
