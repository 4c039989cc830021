//! A frame source that replays prepared images, for tests without a camera.

use crate::camera::{CameraError, FrameSource};
use crate::frame::Frame;
use image::RgbImage;
use std::collections::VecDeque;

/// Replays frames in order, then fails every read like a dead camera.
pub struct ScriptedSource {
    frames: VecDeque<RgbImage>,
    sequence: u32,
}

impl ScriptedSource {
    pub fn new(frames: Vec<RgbImage>) -> Self {
        Self { frames: frames.into(), sequence: 0 }
    }
}

impl FrameSource for ScriptedSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let image = self
            .frames
            .pop_front()
            .ok_or_else(|| CameraError::CaptureFailed("script exhausted".into()))?;
        self.sequence += 1;
        Ok(Frame::from_rgb_image(image, self.sequence))
    }
}
