use crate::{
    config::CameraBackend,
    frame::{FrameError, RgbFrame},
};
use image::ImageFormat;
use opencv::{
    core::{Mat, CV_8UC3},
    prelude::*,
    videoio,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Malformed image: {0}")]
    MalformedImage(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Unable to access the camera. Try switching camera input.")]
    CameraUnavailable { index: i32 },
    #[error("Failed to capture from camera.")]
    CaptureFailed { index: i32 },
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// Decodes an uploaded JPEG or PNG into three-channel RGB, dropping alpha and
/// expanding grayscale.
pub fn decode_upload(bytes: &[u8]) -> Result<RgbFrame, InputError> {
    if bytes.is_empty() {
        return Err(InputError::MalformedImage("empty upload".to_string()));
    }
    let format = image::guess_format(bytes)
        .map_err(|e| InputError::MalformedImage(e.to_string()))?;
    if !matches!(format, ImageFormat::Jpeg | ImageFormat::Png) {
        return Err(InputError::MalformedImage(format!(
            "unsupported format {:?}, expected JPEG or PNG",
            format
        )));
    }

    let image = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| InputError::MalformedImage(e.to_string()))?;
    Ok(RgbFrame::try_from(image.to_rgb8())?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraSource {
    /// Built-in or default webcam.
    Primary,
    /// Externally connected camera.
    Secondary,
}

impl CameraSource {
    pub fn index(&self) -> i32 {
        match self {
            CameraSource::Primary => 0,
            CameraSource::Secondary => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CameraSource::Primary => "primary",
            CameraSource::Secondary => "secondary",
        }
    }
}

/// An open camera handle.
pub trait CaptureDevice: Send {
    /// One synchronous read. `None` when the device returned no frame.
    fn read_frame(&mut self) -> Result<Option<RgbFrame>, InputError>;
    fn release(&mut self) -> Result<(), InputError>;
}

pub trait CaptureBackend: Send + Sync + 'static {
    /// `None` when the device at `index` cannot be opened.
    fn open(&self, index: i32) -> Result<Option<Box<dyn CaptureDevice>>, InputError>;
}

/// Releases the wrapped device when dropped, on every exit path.
struct DeviceGuard {
    index: i32,
    device: Box<dyn CaptureDevice>,
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        match self.device.release() {
            Ok(()) => tracing::debug!("Released camera {}", self.index),
            Err(e) => tracing::warn!("Failed to release camera {}: {}", self.index, e),
        }
    }
}

/// Opens the camera, reads exactly one frame and releases the device.
#[instrument(skip(backend), fields(camera = source.as_str()))]
pub fn snapshot(
    backend: &dyn CaptureBackend,
    source: CameraSource,
) -> Result<RgbFrame, InputError> {
    let index = source.index();
    let device = match backend.open(index) {
        Ok(Some(device)) => device,
        Ok(None) => return Err(InputError::CameraUnavailable { index }),
        Err(e) => {
            tracing::warn!("Opening camera {} failed: {}", index, e);
            return Err(InputError::CameraUnavailable { index });
        }
    };
    let mut guard = DeviceGuard { index, device };

    match guard.device.read_frame() {
        Ok(Some(frame)) => {
            tracing::info!(
                "Captured {}x{} frame from camera {}",
                frame.width(),
                frame.height(),
                index
            );
            Ok(frame)
        }
        Ok(None) => Err(InputError::CaptureFailed { index }),
        Err(e) => {
            tracing::warn!("Reading camera {} failed: {}", index, e);
            Err(InputError::CaptureFailed { index })
        }
    }
}

pub struct OpenCvBackend {
    api_preference: i32,
}

impl OpenCvBackend {
    pub fn new(backend: CameraBackend) -> Self {
        let api_preference = match backend {
            CameraBackend::Any => videoio::CAP_ANY,
            CameraBackend::V4l2 => videoio::CAP_V4L2,
            CameraBackend::Dshow => videoio::CAP_DSHOW,
            CameraBackend::Msmf => videoio::CAP_MSMF,
            CameraBackend::Avfoundation => videoio::CAP_AVFOUNDATION,
        };
        Self { api_preference }
    }
}

impl CaptureBackend for OpenCvBackend {
    fn open(&self, index: i32) -> Result<Option<Box<dyn CaptureDevice>>, InputError> {
        let capture = videoio::VideoCapture::new(index, self.api_preference)?;
        if !capture.is_opened()? {
            return Ok(None);
        }
        Ok(Some(Box::new(OpenCvDevice { capture })))
    }
}

struct OpenCvDevice {
    capture: videoio::VideoCapture,
}

impl CaptureDevice for OpenCvDevice {
    fn read_frame(&mut self) -> Result<Option<RgbFrame>, InputError> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }
        if frame.typ() != CV_8UC3 {
            return Err(InputError::MalformedImage(format!(
                "camera returned OpenCV type {}, expected 8-bit BGR",
                frame.typ()
            )));
        }
        let frame = if frame.is_continuous() {
            frame
        } else {
            frame.try_clone()?
        };

        let bgr = frame.data_bytes()?.to_vec();
        Ok(Some(RgbFrame::from_bgr(
            frame.cols() as u32,
            frame.rows() as u32,
            bgr,
        )?))
    }

    fn release(&mut self) -> Result<(), InputError> {
        self.capture.release()?;
        Ok(())
    }
}
