//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Frame(#[from] FrameError),
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Motion JPEG, one JPEG image per buffer.
    Mjpg,
    /// 8-bit grayscale.
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpg),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

/// Anything that hands out frames one at a time. Read failures end a stream.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

/// Mmap buffers queued on the driver while a capture stream is running.
const STREAM_BUFFERS: u32 = 4;

/// V4L2 camera device handle.
///
/// The capture stream starts on the first read and stays up across reads.
/// A failed read tears it down; the next read starts a fresh one.
pub struct Camera {
    device: Device,
    stream: Option<MmapStream<'static>>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and request
    /// `width` x `height`. The driver may settle on a different size.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, MJPG, or GREY)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            stream: None,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Capture the next frame from the running stream, converted to RGB.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let (format, width, height) = (self.pixel_format, self.width, self.height);
        let device = &self.device;
        let (data, sequence) = pull(
            &mut self.stream,
            || {
                tracing::debug!(buffers = STREAM_BUFFERS, "starting capture stream");
                MmapStream::with_buffers(device, BufType::VideoCapture, STREAM_BUFFERS)
                    .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))
            },
            |stream| {
                let (buf, meta) = stream
                    .next()
                    .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
                Ok((buf_to_rgb(format, width, height, buf)?, meta.sequence))
            },
        )?;

        Ok(Frame { data, width, height, timestamp: std::time::Instant::now(), sequence })
    }
}

/// Read one item from the stream in `slot`, opening it first if needed.
/// Any error drops the stream.
fn pull<S, T>(
    slot: &mut Option<S>,
    open: impl FnOnce() -> Result<S, CameraError>,
    read: impl FnOnce(&mut S) -> Result<T, CameraError>,
) -> Result<T, CameraError> {
    let mut stream = match slot.take() {
        Some(stream) => stream,
        None => open()?,
    };
    let result = read(&mut stream);
    if result.is_ok() {
        *slot = Some(stream);
    }
    result
}

fn buf_to_rgb(format: PixelFormat, width: u32, height: u32, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
    let rgb = match format {
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height)?,
        PixelFormat::Grey => frame::grey_to_rgb(buf, width, height)?,
        PixelFormat::Mjpg => {
            let decoded = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
                .map_err(FrameError::from)?
                .into_rgb8();
            if decoded.dimensions() != (width, height) {
                return Err(CameraError::CaptureFailed(format!(
                    "MJPEG frame is {:?}, expected {width}x{height}",
                    decoded.dimensions()
                )));
            }
            decoded.into_raw()
        }
    };
    Ok(rgb)
}

impl FrameSource for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"H264")), None);
    }

    #[test]
    fn test_open_missing_device() {
        let err = Camera::open("/dev/rollcall-no-such-camera", 640, 480).err();
        assert!(matches!(err, Some(CameraError::DeviceNotFound(_))));
    }

    /// Stand-in stream; each read hands out the next number.
    struct Counter {
        next: u32,
        fail_at: Option<u32>,
    }

    fn read(stream: &mut Counter) -> Result<u32, CameraError> {
        stream.next += 1;
        if Some(stream.next) == stream.fail_at {
            return Err(CameraError::CaptureFailed("dequeue".into()));
        }
        Ok(stream.next)
    }

    #[test]
    fn test_stream_is_started_once_and_reused() {
        let mut slot = None;
        let mut starts = 0;
        for expected in 1..=5 {
            let got = pull(
                &mut slot,
                || {
                    starts += 1;
                    Ok(Counter { next: 0, fail_at: None })
                },
                read,
            )
            .unwrap();
            assert_eq!(got, expected);
        }
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_failed_read_drops_stream() {
        let mut slot = Some(Counter { next: 0, fail_at: Some(2) });
        assert_eq!(pull(&mut slot, || unreachable!(), read).unwrap(), 1);
        assert!(pull(&mut slot, || unreachable!(), read).is_err());
        assert!(slot.is_none());

        let restarted = pull(&mut slot, || Ok(Counter { next: 10, fail_at: None }), read).unwrap();
        assert_eq!(restarted, 11);
    }

    #[test]
    fn test_failed_start_leaves_no_stream() {
        let mut slot: Option<Counter> = None;
        let err = pull(&mut slot, || Err(CameraError::StreamingNotSupported), read);
        assert!(matches!(err, Err(CameraError::StreamingNotSupported)));
        assert!(slot.is_none());
    }

    #[test]
    fn test_grey_buffer_expands_to_rgb() {
        let rgb = buf_to_rgb(PixelFormat::Grey, 2, 1, &[10, 200]).unwrap();
        assert_eq!(rgb, vec![10, 10, 10, 200, 200, 200]);
    }
}
