use image::{ImageBuffer, ImageFormat, RgbImage};
use ndarray::Array3;
use std::io::Cursor;
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Frame has no pixels ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("Buffer length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

/// Dense 8-bit RGB pixel grid, row-major, validated at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbFrame {
    width: u32,
    height: u32,
    data: Box<[u8]>,
}

fn expected_len(width: u32, height: u32) -> Result<usize, FrameError> {
    if width == 0 || height == 0 {
        return Err(FrameError::Empty { width, height });
    }
    Ok(width as usize * height as usize * RGB_CHANNELS)
}

impl RgbFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
        let expected = expected_len(width, height)?;
        if data.len() != expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            width,
            height,
            data: data.into_boxed_slice(),
        })
    }

    /// Builds a frame from a blue-green-red buffer, as delivered by capture devices.
    pub fn from_bgr(width: u32, height: u32, mut bgr: Vec<u8>) -> Result<Self, FrameError> {
        let expected = expected_len(width, height)?;
        if bgr.len() != expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: bgr.len(),
            });
        }
        for pixel in bgr.chunks_exact_mut(RGB_CHANNELS) {
            pixel.swap(0, 2);
        }

        Self::new(width, height, bgr)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * RGB_CHANNELS;
        Some([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ])
    }

    /// Channel-first `[3, H, W]` tensor with values scaled to `[0, 1]`.
    pub fn to_chw_tensor(&self) -> Array3<f32> {
        let (width, height) = (self.width as usize, self.height as usize);
        Array3::from_shape_fn((RGB_CHANNELS, height, width), |(c, y, x)| {
            self.data[(y * width + x) * RGB_CHANNELS + c] as f32 / 255.
        })
    }

    pub fn to_rgb_image(&self) -> Result<RgbImage, FrameError> {
        let actual = self.data.len();
        ImageBuffer::from_raw(self.width, self.height, self.data.to_vec()).ok_or(
            FrameError::LengthMismatch {
                expected: self.width as usize * self.height as usize * RGB_CHANNELS,
                actual,
            },
        )
    }

    pub fn encode_png(&self) -> Result<Vec<u8>, FrameError> {
        let image = self.to_rgb_image()?;
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png)?;
        Ok(buffer.into_inner())
    }
}

impl TryFrom<RgbImage> for RgbFrame {
    type Error = FrameError;

    fn try_from(image: RgbImage) -> Result<Self, Self::Error> {
        let (width, height) = image.dimensions();
        Self::new(width, height, image.into_raw())
    }
}
