//! Error taxonomy for the dash camera.
//!
//! Only `FatalInit` is allowed to escape `main`. Every other class is
//! recovered where it happens: GPS hiccups are retried by the fix stream,
//! capture and time-sync failures are logged by the capture cycle, and
//! shutdown step failures are logged while the protocol moves on.

use thiserror::Error;

pub(crate) type Result<T> = std::result::Result<T, DashCamError>;

#[derive(Error, Debug)]
pub(crate) enum DashCamError {
    #[error("GPS acquisition error: {0}")]
    TransientAcquisition(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Time sync error: {0}")]
    TimeSync(String),

    #[error("Shutdown step failed: {0}")]
    ShutdownStep(String),

    #[error("Initialisation failed: {0}")]
    FatalInit(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
