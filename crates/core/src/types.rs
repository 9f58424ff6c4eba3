use crate::error::{Result, UpscaleError};

/// Every buffer in the pipeline is 3-channel RGB.
pub const CHANNELS: usize = 3;

/// Decoded image as interleaved RGB float32, row-major, values in 0–255.
///
/// The pipeline moves buffers from stage to stage; nothing holds a second
/// reference to one.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBuffer {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl ImageBuffer {
    /// Wrap interleaved RGB samples. Fails if `data` does not hold exactly
    /// `width * height * 3` values.
    pub fn new(width: u32, height: u32, data: Vec<f32>) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(UpscaleError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn zeros(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width as usize * height as usize * CHANNELS],
        }
    }

    /// Build from 8-bit interleaved RGB.
    pub fn from_rgb8(width: u32, height: u32, rgb: &[u8]) -> Result<Self> {
        Self::new(width, height, rgb.iter().map(|&v| v as f32).collect())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// RGB triple at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }
}

/// Composited 8-bit output canvas, interleaved RGB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbCanvas {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl RgbCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * CHANNELS],
        }
    }

    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(UpscaleError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }
}

/// Float sample → byte: truncate toward zero, clamp to 0–255. NaN maps to 0.
#[inline]
pub fn sample_to_u8(value: f32) -> u8 {
    value.clamp(0.0, 255.0) as u8
}
