use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{info, warn};
use rscam::{Config, CID_HFLIP, CID_VFLIP, FIELD_NONE};
use turbojpeg::{Decompressor, Image, PixelFormat, Subsamp};

use crate::{
    error::{DashCamError, Result},
    user_config::CameraSettings,
};

const LATEST_FILE: &str = "latest.jpg";
const JPEG_QUALITY: i32 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Orientation {
    pub(crate) vflip: bool,
    pub(crate) hflip: bool,
}

impl Orientation {
    /// Flips still needed after `applied` has already been done.
    fn remaining_after(self, applied: Orientation) -> Orientation {
        Orientation {
            vflip: self.vflip != applied.vflip,
            hflip: self.hflip != applied.hflip,
        }
    }

    fn is_identity(&self) -> bool {
        !self.vflip && !self.hflip
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CaptureRequest {
    pub(crate) resolution: (u32, u32),
    pub(crate) orientation: Orientation,
    pub(crate) taken_at: DateTime<Utc>,
}

/// Produces a still on disk and says where it went.
pub(crate) trait Camera {
    fn capture(&mut self, request: &CaptureRequest) -> Result<PathBuf>;
}

pub(crate) struct V4l2Camera {
    camera: rscam::Camera,
    settings: CameraSettings,
    /// Flips the sensor does for us.
    hardware_orientation: Orientation,
    decompressor: Decompressor,
}

/**
 * Opens the V4L2 device and prepares the photo directory. Any failure here is
 * fatal: there is no point driving around without a camera.
 * Orientation is pushed to the sensor when the driver supports the flip
 * controls; anything it refuses is done in software per frame.
 */
pub(crate) fn open_v4l2_camera(settings: &CameraSettings, orientation: Orientation) -> Result<V4l2Camera> {
    info!("Initialising camera {}...", settings.device_path);
    let mut camera = rscam::Camera::new(&settings.device_path).map_err(|e| {
        DashCamError::FatalInit(format!("could not open camera {}: {}", settings.device_path, e))
    })?;

    fs::create_dir_all(&settings.photo_dir).map_err(|e| {
        DashCamError::FatalInit(format!(
            "could not create {}: {}",
            settings.photo_dir.display(),
            e
        ))
    })?;

    let decompressor = Decompressor::new()
        .map_err(|e| DashCamError::FatalInit(format!("could not create JPEG decompressor: {}", e)))?;

    let hardware_orientation = Orientation {
        vflip: orientation.vflip && _set_flip_control(&mut camera, CID_VFLIP, "vflip"),
        hflip: orientation.hflip && _set_flip_control(&mut camera, CID_HFLIP, "hflip"),
    };

    Ok(V4l2Camera {
        camera,
        settings: settings.clone(),
        hardware_orientation,
        decompressor,
    })
}

fn _set_flip_control(camera: &mut rscam::Camera, id: u32, name: &str) -> bool {
    match camera.set_control(id, &1) {
        Ok(()) => true,
        Err(e) => {
            warn!("Camera refused {} control ({}), flipping in software", name, e);
            false
        }
    }
}

impl Camera for V4l2Camera {
    fn capture(&mut self, request: &CaptureRequest) -> Result<PathBuf> {
        let config = Config {
            interval: (1, 30),
            resolution: request.resolution,
            format: b"MJPG",
            field: FIELD_NONE,
            nbuffers: 2,
        };
        self.camera
            .start(&config)
            .map_err(|e| DashCamError::Capture(format!("could not start stream: {:?}", e)))?;

        let frame = self._grab_settled_frame();
        if let Err(e) = self.camera.stop() {
            warn!("Camera did not stop cleanly: {}", e);
        }
        let mut jpeg = frame?;

        let flips = request.orientation.remaining_after(self.hardware_orientation);
        if !flips.is_identity() {
            jpeg = _reorient_jpeg(&jpeg, flips, &mut self.decompressor)?;
        }

        let path = self.settings.photo_dir.join(image_file_name(&request.taken_at));
        _store_image(&jpeg, &path, &self.settings.photo_dir.join(LATEST_FILE))?;
        info!("Taken image at {}", path.display());
        Ok(path)
    }
}

impl V4l2Camera {
    /// Drops the first frames while auto exposure settles, returns the next one.
    fn _grab_settled_frame(&mut self) -> Result<Vec<u8>> {
        let grab_failed = |e: std::io::Error| DashCamError::Capture(format!("frame capture failed: {}", e));
        for _ in 0..self.settings.warmup_frames {
            self.camera.capture().map_err(grab_failed)?;
        }
        let frame = self.camera.capture().map_err(grab_failed)?;
        Ok(frame[..].to_vec())
    }
}

pub(crate) fn image_file_name(taken_at: &DateTime<Utc>) -> String {
    format!("image-{}.jpg", taken_at.format("%Y-%m-%d-%H-%M-%S"))
}

/// Writes the still, then refreshes the `latest.jpg` copy next to it.
fn _store_image(jpeg: &[u8], path: &Path, latest: &Path) -> Result<()> {
    let write_failed = |e: std::io::Error| {
        DashCamError::Capture(format!("could not write {}: {}", path.display(), e))
    };
    fs::write(path, jpeg).map_err(write_failed)?;
    if let Err(e) = fs::copy(path, latest) {
        warn!("Could not refresh {}: {}", latest.display(), e);
    }
    Ok(())
}

/**
 * Decodes an MJPEG frame, flips it and encodes it again. Only used when the
 * sensor cannot flip on its own.
 */
fn _reorient_jpeg(jpeg: &[u8], flips: Orientation, decompressor: &mut Decompressor) -> Result<Vec<u8>> {
    let codec = |e: turbojpeg::Error| DashCamError::Capture(format!("JPEG re-orientation failed: {}", e));

    let header = decompressor.read_header(jpeg).map_err(codec)?;
    let (width, height) = (header.width, header.height);
    let pitch = width * PixelFormat::RGB.size();
    let mut pixels = vec![0 as u8; pitch * height];

    decompressor
        .decompress(
            jpeg,
            Image {
                pixels: &mut pixels[..],
                width,
                pitch,
                height,
                format: PixelFormat::RGB,
            },
        )
        .map_err(codec)?;

    flip_rgb(&mut pixels, width, height, flips);

    let encoded = turbojpeg::compress(
        Image {
            pixels: &pixels[..],
            width,
            pitch,
            height,
            format: PixelFormat::RGB,
        },
        JPEG_QUALITY,
        Subsamp::Sub2x2,
    )
    .map_err(codec)?;
    Ok(encoded.to_vec())
}

/// Flips a packed RGB buffer in place.
pub(crate) fn flip_rgb(pixels: &mut [u8], width: usize, height: usize, flips: Orientation) {
    let bpp = PixelFormat::RGB.size();
    let pitch = width * bpp;

    if flips.vflip {
        for row in 0..height / 2 {
            let (top, bottom) = pixels.split_at_mut((height - 1 - row) * pitch);
            top[row * pitch..(row + 1) * pitch].swap_with_slice(&mut bottom[..pitch]);
        }
    }

    if flips.hflip {
        for line in pixels.chunks_exact_mut(pitch) {
            for col in 0..width / 2 {
                let (left, right) = (col * bpp, (width - 1 - col) * bpp);
                for k in 0..bpp {
                    line.swap(left + k, right + k);
                }
            }
        }
    }
}
