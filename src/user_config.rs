use std::{path::PathBuf, time::Duration};

use clap::{ArgAction, Parser};

use crate::camera_controller::Orientation;

const DEFAULT_PHOTO_DIR: &str = "/home/pi/DashCam/RawPhotos";
const DEFAULT_TRIP_LOG_DIR: &str = "/home/pi/DashCam/TripLogs";

/// Poll interval while waiting for a lock.
const FIX_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// gpsd socket read window; also bounds how long the fix stream takes to stop.
const GPSD_READ_TIMEOUT: Duration = Duration::from_secs(1);
const GPS_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const FIX_STREAM_JOIN_TIMEOUT: Duration = Duration::from_secs(3);
/// How long a stop request may go unanswered by the main loop before the
/// watchdog powers off on its own.
const SHUTDOWN_STALL_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug, Clone)]
#[command(version, about = "GPS-tagged time-lapse dash camera", long_about = None)]
pub(crate) struct Args {
    /// Seconds between pictures. Not exact: capture and indicator time is added on top.
    #[arg(long, default_value_t = 2)]
    time_interval: u64,

    /// Still resolution, WIDTHxHEIGHT
    #[arg(long, default_value = "1280x720", value_parser = parse_resolution)]
    resolution: (u32, u32),

    /// Flip the image vertically
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    vflip: bool,

    /// Flip the image horizontally
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    hflip: bool,

    /// V4L2 device of the camera
    #[arg(long, default_value = "/dev/video0")]
    camera_device: String,

    /// Frames thrown away before each still while exposure settles
    #[arg(long, default_value_t = 3)]
    warmup_frames: u32,

    /// Where photos are written
    #[arg(long, default_value = DEFAULT_PHOTO_DIR)]
    photo_dir: PathBuf,

    /// Where GPX trip logs are written
    #[arg(long, default_value = DEFAULT_TRIP_LOG_DIR)]
    trip_log_dir: PathBuf,

    /// gpsd host:port
    #[arg(long, default_value = "127.0.0.1:2947")]
    gpsd_addr: String,

    /// Host whose reachability implies network time is in sync
    #[arg(long, default_value = "google.com")]
    time_host: String,

    /// BCM pin of the shutdown button (active low)
    #[arg(long, default_value_t = 4)]
    shutdown_pin: u8,

    /// Seconds the shutdown button must be held
    #[arg(long, default_value_t = 2)]
    hold_secs: u64,

    /// BCM pin driving the status pixel (must support PWM)
    #[arg(long, default_value_t = 18)]
    led_pin: i32,

    /// Number of status pixels
    #[arg(long, default_value_t = 1)]
    led_count: usize,

    /// DMA channel for the ws281x driver
    #[arg(long, default_value_t = 10)]
    led_dma: i32,

    /// Command run as the last step of shutdown
    #[arg(long, default_value = "shutdown now")]
    power_off_cmd: String,

    /// Debug logging
    #[arg(short, long)]
    pub(crate) verbose: bool,
}

fn parse_resolution(raw: &str) -> Result<(u32, u32), String> {
    let (w, h) = raw
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", raw))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| format!("invalid dimension '{}' in '{}'", v, raw))
    };
    Ok((parse(w)?, parse(h)?))
}

#[derive(Debug, Clone)]
pub(crate) struct CameraSettings {
    pub(crate) device_path: String,
    pub(crate) warmup_frames: u32,
    pub(crate) photo_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub(crate) struct IndicatorSettings {
    pub(crate) control_pin: i32,
    pub(crate) pixel_count: usize,
    pub(crate) dma_channel: i32,
}

#[derive(Debug, Clone)]
pub(crate) struct CycleSettings {
    pub(crate) time_interval: Duration,
    pub(crate) poll_interval: Duration,
    pub(crate) resolution: (u32, u32),
    pub(crate) orientation: Orientation,
}

#[derive(Debug, Clone)]
pub(crate) struct GpsSettings {
    pub(crate) gpsd_addr: String,
    pub(crate) read_timeout: Duration,
    pub(crate) retry_interval: Duration,
}

#[derive(Debug, Clone)]
pub(crate) struct ShutdownSettings {
    pub(crate) button_pin: u8,
    pub(crate) hold: Duration,
    pub(crate) join_timeout: Duration,
    pub(crate) stall_deadline: Duration,
    pub(crate) power_off_cmd: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct UserConfig {
    pub(crate) camera: CameraSettings,
    pub(crate) indicator: IndicatorSettings,
    pub(crate) cycle: CycleSettings,
    pub(crate) gps: GpsSettings,
    pub(crate) time_host: String,
    pub(crate) trip_log_dir: PathBuf,
    pub(crate) shutdown: ShutdownSettings,
    pub(crate) verbose: bool,
}

impl UserConfig {
    /// Reads the command line. Exits with usage on bad flags.
    pub(crate) fn read() -> Self {
        Self::from(Args::parse())
    }
}

impl From<Args> for UserConfig {
    fn from(args: Args) -> Self {
        Self {
            camera: CameraSettings {
                device_path: args.camera_device,
                warmup_frames: args.warmup_frames,
                photo_dir: args.photo_dir,
            },
            indicator: IndicatorSettings {
                control_pin: args.led_pin,
                pixel_count: args.led_count,
                dma_channel: args.led_dma,
            },
            cycle: CycleSettings {
                time_interval: Duration::from_secs(args.time_interval),
                poll_interval: FIX_POLL_INTERVAL,
                resolution: args.resolution,
                orientation: Orientation {
                    vflip: args.vflip,
                    hflip: args.hflip,
                },
            },
            gps: GpsSettings {
                gpsd_addr: args.gpsd_addr,
                read_timeout: GPSD_READ_TIMEOUT,
                retry_interval: GPS_RETRY_INTERVAL,
            },
            time_host: args.time_host,
            trip_log_dir: args.trip_log_dir,
            shutdown: ShutdownSettings {
                button_pin: args.shutdown_pin,
                hold: Duration::from_secs(args.hold_secs),
                join_timeout: FIX_STREAM_JOIN_TIMEOUT,
                stall_deadline: SHUTDOWN_STALL_DEADLINE,
                power_off_cmd: args
                    .power_off_cmd
                    .split_whitespace()
                    .map(String::from)
                    .collect(),
            },
            verbose: args.verbose,
        }
    }
}
