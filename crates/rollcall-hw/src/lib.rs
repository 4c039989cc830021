//! rollcall-hw: Camera capture for live attendance.
//!
//! Provides V4L2-based capture converted to RGB frames, and a lease that
//! gives one stream at a time exclusive use of the camera.

pub mod camera;
pub mod frame;
pub mod lease;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use camera::{Camera, CameraError, FrameSource, PixelFormat};
pub use frame::Frame;
pub use lease::{CameraLease, CameraSlot};
