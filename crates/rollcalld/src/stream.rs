//! The live recognition stream: camera frames in, annotated JPEG parts out.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageError, RgbImage};
use rollcall_core::{FaceEngine, FrameRecognizer, Gallery};
use rollcall_hw::CameraLease;
use rollcall_store::{EmbeddingStore, SessionController};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Multipart boundary token used between frames.
pub const BOUNDARY: &str = "frame";
pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Everything a stream needs besides the camera lease. Cheap to clone.
#[derive(Clone)]
pub struct StreamContext {
    pub engine: Arc<Mutex<FaceEngine>>,
    pub recognizer: Arc<FrameRecognizer>,
    pub embeddings: EmbeddingStore,
    pub controller: SessionController,
    pub jpeg_quality: u8,
}

impl StreamContext {
    /// Load the embedding of every enrolled student. Done once per stream.
    pub fn load_gallery(&self) -> Result<Gallery, rollcall_store::StoreError> {
        let students = self.controller.store().list_students()?;
        Ok(self.embeddings.load_all(&students))
    }
}

/// A lazy, non-restartable sequence of multipart parts for one session.
///
/// Ends when the camera fails, the session is closed, or the iterator is
/// dropped. Dropping it releases the camera.
pub struct FrameStream {
    lease: CameraLease,
    ctx: StreamContext,
    gallery: Gallery,
    session_id: i64,
    frames: u64,
}

impl FrameStream {
    pub fn new(lease: CameraLease, ctx: StreamContext, gallery: Gallery, session_id: i64) -> Self {
        Self { lease, ctx, gallery, session_id, frames: 0 }
    }

    fn session_open(&self) -> bool {
        match self.ctx.controller.is_closed(self.session_id) {
            Ok(closed) => !closed,
            Err(error) => {
                tracing::warn!(session = self.session_id, %error, "session lookup failed; ending stream");
                false
            }
        }
    }

    /// Recognize faces in `frame`, annotate it, and fold the results into
    /// the session. Returns `false` when the engine is unusable.
    fn process(&mut self, frame: &mut RgbImage) -> bool {
        let outcome = {
            let Ok(mut engine) = self.ctx.engine.lock() else {
                tracing::error!(session = self.session_id, "face engine lock poisoned; ending stream");
                return false;
            };
            self.ctx.recognizer.recognize(&mut engine, frame, &self.gallery)
        };

        match outcome {
            Ok(recognition) => {
                for student in recognition.recognized {
                    if let Err(error) = self.ctx.controller.on_recognized(self.session_id, student) {
                        tracing::warn!(session = self.session_id, student, %error, "failed to mark present");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(session = self.session_id, %error, "detection failed; sending raw frame");
            }
        }
        true
    }
}

impl Iterator for FrameStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            if !self.session_open() {
                tracing::info!(session = self.session_id, frames = self.frames, "session closed; ending stream");
                return None;
            }

            let frame = match self.lease.read_frame() {
                Ok(frame) => frame,
                Err(error) => {
                    tracing::warn!(session = self.session_id, %error, "camera read failed; ending stream");
                    return None;
                }
            };
            let mut image = match frame.into_rgb_image() {
                Ok(image) => image,
                Err(error) => {
                    tracing::warn!(session = self.session_id, %error, "bad frame from camera; ending stream");
                    return None;
                }
            };

            if !self.process(&mut image) {
                return None;
            }
            self.frames += 1;

            match encode_jpeg(&image, self.ctx.jpeg_quality) {
                Ok(jpeg) => return Some(multipart_part(&jpeg)),
                Err(error) => {
                    tracing::warn!(session = self.session_id, %error, "jpeg encoding failed; skipping frame");
                }
            }
        }
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode(
        image.as_raw(),
        image.width(),
        image.height(),
        ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

/// Frame one JPEG as a `multipart/x-mixed-replace` part.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let head = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = Vec::with_capacity(head.len() + jpeg.len() + 2);
    part.extend_from_slice(head.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

/// Run a session's stream on its own thread, handing parts to the returned
/// receiver. The thread stops at the end of the stream or as soon as the
/// receiver is dropped.
pub fn spawn_stream(
    ctx: StreamContext,
    lease: CameraLease,
    session_id: i64,
) -> std::io::Result<mpsc::Receiver<Vec<u8>>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(1);

    std::thread::Builder::new()
        .name("rollcall-stream".into())
        .spawn(move || {
            let gallery = match ctx.load_gallery() {
                Ok(gallery) => gallery,
                Err(error) => {
                    tracing::error!(session = session_id, %error, "cannot load gallery; stream not started");
                    return;
                }
            };
            tracing::info!(session = session_id, known = gallery.len(), "stream started");

            let mut stream = FrameStream::new(lease, ctx, gallery, session_id);
            for part in stream.by_ref() {
                if tx.blocking_send(part).is_err() {
                    tracing::info!(session = session_id, "client disconnected");
                    break;
                }
            }
            let frames = stream.frames;
            drop(stream);
            tracing::info!(session = session_id, frames, "stream finished; camera released");
        })?;

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::testing::{engine, paint};
    use rollcall_core::{Annotator, Embedding, RecognitionConfig};
    use rollcall_hw::testing::ScriptedSource;
    use rollcall_hw::CameraSlot;
    use rollcall_store::{NewStudent, Status, Store};

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: StreamContext,
        students: Vec<i64>,
        classroom: i64,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let classroom = store.create_classroom("CSE-1").unwrap().id;
        let embeddings = EmbeddingStore::new(dir.path(), "mean_rgb");
        let students = [("A", [1.0, 0.0, 0.0]), ("B", [0.0, 1.0, 0.0])]
            .iter()
            .map(|(roll, v)| {
                let s = store
                    .create_student(&NewStudent {
                        roll_no: roll.to_string(),
                        name: roll.to_string(),
                        classroom_id: classroom,
                        photo: None,
                    })
                    .unwrap();
                embeddings.upsert(s.id, &Embedding::new(v.to_vec())).unwrap();
                s.id
            })
            .collect();
        let ctx = StreamContext {
            engine: Arc::new(Mutex::new(engine())),
            recognizer: Arc::new(FrameRecognizer::new(RecognitionConfig::default(), Annotator::default())),
            embeddings,
            controller: SessionController::new(store),
            jpeg_quality: 80,
        };
        Fixture { _dir: dir, ctx, students, classroom }
    }

    fn face(color: [u8; 3]) -> RgbImage {
        let mut img = RgbImage::new(32, 24);
        paint(&mut img, 4, 4, 8, 8, color);
        img
    }

    #[test]
    fn test_part_framing() {
        let part = multipart_part(b"JPEG");
        assert_eq!(part, b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n".to_vec());
    }

    #[test]
    fn test_encode_jpeg_produces_jpeg() {
        let jpeg = encode_jpeg(&RgbImage::new(8, 8), 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_stream_marks_present_and_ends_with_camera() {
        let fx = fixture();
        let session = fx.ctx.controller.start(fx.classroom, "jdoe").unwrap();
        let slot = CameraSlot::new(ScriptedSource::new(vec![
            face([255, 0, 0]),
            RgbImage::new(32, 24),
            face([0, 255, 0]),
        ]));
        let gallery = fx.ctx.load_gallery().unwrap();
        let stream = FrameStream::new(slot.try_acquire().unwrap(), fx.ctx.clone(), gallery, session.id);

        let parts: Vec<_> = stream.collect();
        assert_eq!(parts.len(), 3);
        assert!(!slot.is_busy());

        let records = fx.ctx.controller.records(session.id).unwrap();
        assert!(records.iter().all(|r| r.status == Status::Present));
        assert_eq!(records.len(), fx.students.len());
    }

    #[test]
    fn test_stream_stops_when_session_closed() {
        let fx = fixture();
        let session = fx.ctx.controller.start(fx.classroom, "jdoe").unwrap();
        let slot = CameraSlot::new(ScriptedSource::new(vec![face([255, 0, 0]); 5]));
        let mut stream = FrameStream::new(slot.try_acquire().unwrap(), fx.ctx.clone(), Gallery::new(), session.id);

        assert!(stream.next().is_some());
        fx.ctx.controller.close(session.id).unwrap();
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_spawned_stream_releases_camera_on_disconnect() {
        let fx = fixture();
        let session = fx.ctx.controller.start(fx.classroom, "jdoe").unwrap();
        let slot = CameraSlot::new(ScriptedSource::new(vec![face([255, 0, 0]); 50]));

        let mut rx = spawn_stream(fx.ctx.clone(), slot.try_acquire().unwrap(), session.id).unwrap();
        assert!(rx.blocking_recv().is_some());
        drop(rx);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while slot.is_busy() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(!slot.is_busy());
    }
}
