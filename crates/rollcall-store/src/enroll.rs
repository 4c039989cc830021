//! Building embeddings from student photos, and the roster operations that
//! trigger a build.

use crate::db::{Store, StoreError};
use crate::embeddings::{EmbeddingError, EmbeddingStore};
use crate::roster::{NewStudent, Student, StudentUpdate};
use rollcall_core::{EngineError, FaceEngine};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Directory under the media root that holds student photos.
pub const PHOTO_DIR: &str = "student_photos";

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("student {0} has no photo")]
    NoPhoto(i64),
    #[error("cannot read photo {path}: {source}")]
    Photo {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("extractor returned no embedding")]
    NoEmbedding,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Store(#[from] EmbeddingError),
    #[error("face engine lock poisoned")]
    EnginePoisoned,
}

/// Runs the extractor over a student's photo and stores the result.
#[derive(Clone)]
pub struct EmbeddingBuilder {
    engine: Arc<Mutex<FaceEngine>>,
    embeddings: EmbeddingStore,
    media_root: PathBuf,
}

impl EmbeddingBuilder {
    pub fn new(engine: Arc<Mutex<FaceEngine>>, embeddings: EmbeddingStore, media_root: impl Into<PathBuf>) -> Self {
        Self { engine, embeddings, media_root: media_root.into() }
    }

    pub fn embeddings(&self) -> &EmbeddingStore {
        &self.embeddings
    }

    /// Extract and write the embedding for `student`, overwriting any prior file.
    pub fn build(&self, student: &Student) -> Result<PathBuf, BuildError> {
        let photo = student.photo.as_deref().ok_or(BuildError::NoPhoto(student.id))?;
        let path = self.media_root.join(photo);
        let image = image::open(&path)
            .map_err(|source| BuildError::Photo { path: path.clone(), source })?
            .into_rgb8();

        let embedding = {
            let mut engine = self.engine.lock().map_err(|_| BuildError::EnginePoisoned)?;
            engine.represent(&image)?
        }
        .ok_or(BuildError::NoEmbedding)?;

        Ok(self.embeddings.upsert(student.id, &embedding)?)
    }

    /// [`build`](Self::build), with any failure logged and dropped. The
    /// student row is already saved by the time this runs.
    pub fn rebuild_quietly(&self, student: &Student) -> Option<PathBuf> {
        match self.build(student) {
            Ok(path) => Some(path),
            Err(error) => {
                tracing::warn!(student = student.id, roll_no = %student.roll_no, %error, "embedding build failed");
                None
            }
        }
    }
}

/// Save a new student, then build its embedding when it has a photo.
pub fn register_student(store: &Store, builder: &EmbeddingBuilder, new: &NewStudent) -> Result<Student, StoreError> {
    let student = store.create_student(new)?;
    if student.photo.is_some() {
        builder.rebuild_quietly(&student);
    }
    Ok(student)
}

/// Apply `update`, then rebuild the embedding when a new photo came with it.
pub fn edit_student(
    store: &Store,
    builder: &EmbeddingBuilder,
    id: i64,
    update: &StudentUpdate,
) -> Result<Student, StoreError> {
    let student = store.update_student(id, update)?;
    if update.photo.is_some() {
        builder.rebuild_quietly(&student);
    }
    Ok(student)
}

/// Delete a student. The embedding file stays behind.
pub fn remove_student(store: &Store, embeddings: &EmbeddingStore, id: i64) -> Result<(), StoreError> {
    store.delete_student(id)?;
    let orphan = embeddings.path_for(id);
    if orphan.exists() {
        tracing::warn!(student = id, path = %orphan.display(), "embedding file left orphaned");
    }
    Ok(())
}

/// Copy `source` into the photo directory under a fresh name
/// `student_<id>_<random>.<ext>` and return the path relative to
/// `media_root`. Existing files are never overwritten.
pub fn store_photo(media_root: &Path, student_id: i64, source: &Path) -> std::io::Result<String> {
    let ext = source
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "jpg".to_string());

    let dir = media_root.join(PHOTO_DIR);
    std::fs::create_dir_all(&dir)?;
    let mut reader = File::open(source)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!("student_{student_id}_"))
        .suffix(&format!(".{ext}"))
        .tempfile_in(&dir)?;
    std::io::copy(&mut reader, tmp.as_file_mut())?;
    let (_, dest) = tmp.keep().map_err(|e| e.error)?;

    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "non-utf8 photo name"))?;
    tracing::debug!(from = %source.display(), to = %dest.display(), "photo stored");
    Ok(format!("{PHOTO_DIR}/{name}"))
}

/// Give a saved student a new photo copied from `source`.
///
/// The copy happens only once the row is known to exist, and the row
/// points at the new file before the previous one is removed. With a
/// builder the embedding is rebuilt as well.
pub fn attach_photo(
    store: &Store,
    builder: Option<&EmbeddingBuilder>,
    media_root: &Path,
    id: i64,
    source: &Path,
) -> Result<Student, StoreError> {
    let previous = store.get_student(id)?.photo;
    let relative = store_photo(media_root, id, source)?;
    let update = StudentUpdate { photo: Some(relative.clone()), ..Default::default() };

    let saved = match builder {
        Some(builder) => edit_student(store, builder, id, &update),
        None => store.update_student(id, &update),
    };
    let student = match saved {
        Ok(student) => student,
        Err(error) => {
            discard_photo(media_root, &relative);
            return Err(error);
        }
    };

    if let Some(old) = previous.filter(|old| *old != relative && old.starts_with(&format!("{PHOTO_DIR}/"))) {
        discard_photo(media_root, &old);
    }
    Ok(student)
}

/// Save a new student, copying `photo` in only after the insert succeeds.
pub fn enroll_student(
    store: &Store,
    builder: Option<&EmbeddingBuilder>,
    media_root: &Path,
    new: &NewStudent,
    photo: Option<&Path>,
) -> Result<Student, StoreError> {
    if let Some(source) = photo {
        std::fs::metadata(source)?;
    }
    let student = match builder {
        Some(builder) => register_student(store, builder, new)?,
        None => store.create_student(new)?,
    };
    match photo {
        Some(source) => attach_photo(store, builder, media_root, student.id, source),
        None => Ok(student),
    }
}

/// Apply `update`, then attach `photo` once the update has been accepted.
pub fn revise_student(
    store: &Store,
    builder: Option<&EmbeddingBuilder>,
    media_root: &Path,
    id: i64,
    update: &StudentUpdate,
    photo: Option<&Path>,
) -> Result<Student, StoreError> {
    if let Some(source) = photo {
        std::fs::metadata(source)?;
    }
    let student = match builder {
        Some(builder) => edit_student(store, builder, id, update)?,
        None => store.update_student(id, update)?,
    };
    match photo {
        Some(source) => attach_photo(store, builder, media_root, id, source),
        None => Ok(student),
    }
}

fn discard_photo(media_root: &Path, relative: &str) {
    let path = media_root.join(relative);
    if let Err(error) = std::fs::remove_file(&path) {
        if error.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), %error, "cannot remove photo");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use rollcall_core::testing::{engine, paint};

    struct Fixture {
        _dir: tempfile::TempDir,
        media: PathBuf,
        store: Store,
        builder: EmbeddingBuilder,
        classroom: i64,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("media");
        let store = Store::open_in_memory().unwrap();
        let classroom = store.create_classroom("CSE-1").unwrap().id;
        let builder = EmbeddingBuilder::new(
            Arc::new(Mutex::new(engine())),
            EmbeddingStore::new(media.join("encodings"), "mean_rgb"),
            &media,
        );
        Fixture { _dir: dir, media, store, builder, classroom }
    }

    /// A photo outside the media root, as an operator would pass it.
    fn source_photo(fx: &Fixture, file: &str, color: [u8; 3]) -> PathBuf {
        let mut img = RgbImage::new(20, 20);
        paint(&mut img, 4, 4, 8, 8, color);
        let path = fx.media.parent().unwrap().join(format!("{file}.png"));
        img.save(&path).unwrap();
        path
    }

    /// A photo already in place under the media root.
    fn placed_photo(fx: &Fixture, file: &str, color: [u8; 3]) -> String {
        let relative = format!("{PHOTO_DIR}/{file}.png");
        std::fs::create_dir_all(fx.media.join(PHOTO_DIR)).unwrap();
        let mut img = RgbImage::new(20, 20);
        paint(&mut img, 4, 4, 8, 8, color);
        img.save(fx.media.join(&relative)).unwrap();
        relative
    }

    fn new_student(fx: &Fixture, roll_no: &str, photo: Option<String>) -> NewStudent {
        NewStudent { roll_no: roll_no.into(), name: roll_no.into(), classroom_id: fx.classroom, photo }
    }

    fn photo_files(fx: &Fixture) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(fx.media.join(PHOTO_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn red_dominant(fx: &Fixture, id: i64) -> bool {
        let v = fx.builder.embeddings().load(id).unwrap().unwrap().values;
        v[0] > v[1] && v[0] > v[2]
    }

    #[test]
    fn test_register_with_photo_builds_embedding() {
        let fx = fixture();
        let photo = placed_photo(&fx, "a1", [200, 10, 10]);
        let student = register_student(&fx.store, &fx.builder, &new_student(&fx, "A1", Some(photo))).unwrap();

        let gallery = fx.builder.embeddings().load_all(&[student.clone()]);
        assert_eq!(gallery.ids().collect::<Vec<_>>(), vec![student.id]);
        assert_eq!(gallery.get(0).unwrap().embedding.dim(), 3);
    }

    #[test]
    fn test_build_without_photo_fails() {
        let fx = fixture();
        let student = fx.store.create_student(&new_student(&fx, "A1", None)).unwrap();
        assert!(matches!(fx.builder.build(&student), Err(BuildError::NoPhoto(_))));
    }

    #[test]
    fn test_unreadable_photo_does_not_block_save() {
        let fx = fixture();
        let new = new_student(&fx, "A1", Some("student_photos/missing.png".into()));
        let student = register_student(&fx.store, &fx.builder, &new).unwrap();

        assert!(matches!(fx.builder.build(&student), Err(BuildError::Photo { .. })));
        assert!(fx.builder.embeddings().load(student.id).unwrap().is_none());
        assert_eq!(fx.store.get_student(student.id).unwrap().roll_no, "A1");
    }

    #[test]
    fn test_extractor_without_result_writes_nothing() {
        let fx = fixture();
        // all-white photo: the fake extractor reports no embedding
        let src = fx.media.parent().unwrap().join("white.png");
        RgbImage::from_pixel(10, 10, image::Rgb([255, 255, 255])).save(&src).unwrap();

        let student = enroll_student(&fx.store, Some(&fx.builder), &fx.media, &new_student(&fx, "W", None), Some(src.as_path()))
            .unwrap();
        assert!(student.photo.is_some());
        assert!(matches!(fx.builder.build(&student), Err(BuildError::NoEmbedding)));
        assert!(fx.builder.embeddings().load(student.id).unwrap().is_none());
    }

    #[test]
    fn test_new_photo_on_update_rebuilds() {
        let fx = fixture();
        let first = source_photo(&fx, "first", [200, 10, 10]);
        let student =
            enroll_student(&fx.store, Some(&fx.builder), &fx.media, &new_student(&fx, "A1", None), Some(first.as_path()))
                .unwrap();
        let before = fx.builder.embeddings().load(student.id).unwrap().unwrap();

        let second = source_photo(&fx, "second", [10, 10, 200]);
        let updated = attach_photo(&fx.store, Some(&fx.builder), &fx.media, student.id, &second).unwrap();

        let after = fx.builder.embeddings().load(student.id).unwrap().unwrap();
        assert_ne!(before.values, after.values);
        assert_eq!(std::fs::read_dir(fx.builder.embeddings().dir()).unwrap().count(), 1);
        // the replaced photo is gone, the new one is what the row points at
        assert_eq!(photo_files(&fx).len(), 1);
        assert!(fx.media.join(updated.photo.unwrap()).exists());
    }

    #[test]
    fn test_remove_student_leaves_embedding() {
        let fx = fixture();
        let photo = placed_photo(&fx, "a1", [200, 10, 10]);
        let student = register_student(&fx.store, &fx.builder, &new_student(&fx, "A1", Some(photo))).unwrap();
        remove_student(&fx.store, fx.builder.embeddings(), student.id).unwrap();

        assert!(fx.builder.embeddings().path_for(student.id).exists());
        assert!(matches!(fx.store.get_student(student.id), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn test_store_photo_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("media");
        let src = dir.path().join("in.JPG");
        std::fs::write(&src, b"x").unwrap();

        let first = store_photo(&media, 7, &src).unwrap();
        let second = store_photo(&media, 7, &src).unwrap();
        assert_ne!(first, second);
        for rel in [&first, &second] {
            assert!(rel.starts_with("student_photos/student_7_"));
            assert!(rel.ends_with(".jpg"));
            assert_eq!(std::fs::read(media.join(rel)).unwrap(), b"x");
        }
    }

    #[test]
    fn test_colliding_roll_numbers_keep_their_own_photos() {
        let fx = fixture();
        let red = source_photo(&fx, "red", [200, 10, 10]);
        let blue = source_photo(&fx, "blue", [10, 10, 200]);

        let slash =
            enroll_student(&fx.store, Some(&fx.builder), &fx.media, &new_student(&fx, "A/1", None), Some(red.as_path())).unwrap();
        let underscore =
            enroll_student(&fx.store, Some(&fx.builder), &fx.media, &new_student(&fx, "A_1", None), Some(blue.as_path()))
                .unwrap();

        assert_ne!(slash.photo, underscore.photo);
        assert_eq!(photo_files(&fx).len(), 2);

        // a later rebuild still sees each student's own face
        fx.builder.build(&fx.store.get_student(slash.id).unwrap()).unwrap();
        assert!(red_dominant(&fx, slash.id));
        assert!(!red_dominant(&fx, underscore.id));
    }

    #[test]
    fn test_failed_duplicate_add_leaves_existing_photo() {
        let fx = fixture();
        let red = source_photo(&fx, "red", [200, 10, 10]);
        let blue = source_photo(&fx, "blue", [10, 10, 200]);
        let original =
            enroll_student(&fx.store, Some(&fx.builder), &fx.media, &new_student(&fx, "R1", None), Some(red.as_path())).unwrap();
        let bytes = std::fs::read(fx.media.join(original.photo.as_deref().unwrap())).unwrap();

        let err = enroll_student(&fx.store, Some(&fx.builder), &fx.media, &new_student(&fx, "R1", None), Some(blue.as_path()))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        assert_eq!(photo_files(&fx).len(), 1);
        assert_eq!(std::fs::read(fx.media.join(original.photo.as_deref().unwrap())).unwrap(), bytes);
        assert_eq!(fx.store.get_student(original.id).unwrap(), original);
        assert!(red_dominant(&fx, original.id));
    }

    #[test]
    fn test_update_to_taken_roll_no_copies_nothing() {
        let fx = fixture();
        let red = source_photo(&fx, "red", [200, 10, 10]);
        let blue = source_photo(&fx, "blue", [10, 10, 200]);
        let a = enroll_student(&fx.store, Some(&fx.builder), &fx.media, &new_student(&fx, "A", None), Some(red.as_path())).unwrap();
        let b = fx.store.create_student(&new_student(&fx, "B", None)).unwrap();

        let update = StudentUpdate { roll_no: Some("A".into()), ..Default::default() };
        let err = revise_student(&fx.store, Some(&fx.builder), &fx.media, b.id, &update, Some(blue.as_path())).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        assert_eq!(photo_files(&fx).len(), 1);
        assert_eq!(fx.store.get_student(b.id).unwrap().photo, None);
        assert!(red_dominant(&fx, a.id));
    }

    #[test]
    fn test_missing_source_saves_nothing() {
        let fx = fixture();
        let missing = fx.media.parent().unwrap().join("nope.png");
        let err = enroll_student(&fx.store, None, &fx.media, &new_student(&fx, "A1", None), Some(missing.as_path())).unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(fx.store.list_students().unwrap().is_empty());
    }
}
