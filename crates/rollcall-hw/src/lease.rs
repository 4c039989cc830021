//! Exclusive, scoped access to the process-wide camera.

use crate::camera::{CameraError, FrameSource};
use crate::frame::Frame;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Holds the one opened camera. Clones share the same device.
#[derive(Clone)]
pub struct CameraSlot {
    inner: Arc<Mutex<Box<dyn FrameSource>>>,
}

impl CameraSlot {
    pub fn new(source: impl FrameSource + 'static) -> Self {
        Self { inner: Arc::new(Mutex::new(Box::new(source))) }
    }

    /// Take the camera without waiting. Fails with [`CameraError::DeviceBusy`]
    /// while another lease is alive.
    pub fn try_acquire(&self) -> Result<CameraLease, CameraError> {
        let guard = self.inner.clone().try_lock_owned().map_err(|_| CameraError::DeviceBusy)?;
        tracing::debug!("camera lease acquired");
        Ok(CameraLease { guard })
    }

    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Exclusive use of the camera; dropping it hands the camera back.
pub struct CameraLease {
    guard: OwnedMutexGuard<Box<dyn FrameSource>>,
}

impl CameraLease {
    pub fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.guard.read_frame()
    }
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        tracing::debug!("camera lease released");
    }
}
