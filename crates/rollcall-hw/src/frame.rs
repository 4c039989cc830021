//! Frame type and pixel-format conversion to packed RGB.

use image::RgbImage;

/// A captured camera frame in packed RGB8.
#[derive(Clone)]
pub struct Frame {
    /// RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn from_rgb_image(image: RgbImage, sequence: u32) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    pub fn into_rgb_image(self) -> Result<RgbImage, FrameError> {
        let expected = (self.width * self.height * 3) as usize;
        let actual = self.data.len();
        RgbImage::from_raw(self.width, self.height, self.data)
            .ok_or(FrameError::InvalidLength { expected, actual })
    }
}

/// Convert packed YUYV (4:2:2) to RGB with BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: yuyv.len() });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0], chunk[2]] {
            let y = y as f32;
            rgb.push(clamp_u8(y + 1.402 * v));
            rgb.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(clamp_u8(y + 1.772 * u));
        }
    }
    Ok(rgb)
}

/// Replicate 8-bit grayscale into RGB.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height) as usize;
    if gray.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: gray.len() });
    }
    Ok(gray[..expected].iter().flat_map(|&g| [g, g, g]).collect())
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPEG decode failed: {0}")]
    Decode(#[from] image::ImageError),
}
