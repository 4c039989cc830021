//! On-disk embedding files, one per (student, model).
//!
//! Files are NumPy `.npy` arrays of little-endian `f32` with shape `(D,)`,
//! named `student_<id>_<model>.npy`. Writes land in a temporary file in the
//! same directory and are renamed into place, so a concurrent reader sees
//! either the previous vector or the new one.

use crate::roster::Student;
use npyz::WriterBuilder;
use rollcall_core::{Embedding, Gallery, KnownFace, SubjectId};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} is not a 1-D vector (shape {shape:?})")]
    BadShape { path: PathBuf, shape: Vec<u64> },
    #[error("refusing to write an empty embedding")]
    Empty,
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> EmbeddingError + '_ {
    move |source| EmbeddingError::Io { path: path.to_path_buf(), source }
}

#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    dir: PathBuf,
    model_name: String,
}

impl EmbeddingStore {
    pub fn new(dir: impl Into<PathBuf>, model_name: impl Into<String>) -> Self {
        Self { dir: dir.into(), model_name: model_name.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn file_name(&self, subject_id: SubjectId) -> String {
        format!("student_{subject_id}_{}.npy", self.model_name)
    }

    pub fn path_for(&self, subject_id: SubjectId) -> PathBuf {
        self.dir.join(self.file_name(subject_id))
    }

    /// Write `embedding` for `subject_id`, replacing any previous file.
    pub fn upsert(&self, subject_id: SubjectId, embedding: &Embedding) -> Result<PathBuf, EmbeddingError> {
        if embedding.values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        std::fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let path = self.path_for(subject_id);

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err(&self.dir))?;
        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            let mut writer = npyz::WriteOptions::new()
                .default_dtype()
                .shape(&[embedding.dim() as u64])
                .writer(&mut out)
                .begin_nd()
                .map_err(io_err(&path))?;
            writer.extend(embedding.values.iter().copied()).map_err(io_err(&path))?;
            writer.finish().map_err(io_err(&path))?;
            out.flush().map_err(io_err(&path))?;
        }
        tmp.as_file().sync_all().map_err(io_err(&path))?;
        tmp.persist(&path).map_err(|e| EmbeddingError::Io { path: path.clone(), source: e.error })?;

        tracing::info!(subject_id, dim = embedding.dim(), path = %path.display(), "embedding written");
        Ok(path)
    }

    /// Read the embedding for `subject_id`. A missing file is `Ok(None)`.
    pub fn load(&self, subject_id: SubjectId) -> Result<Option<Embedding>, EmbeddingError> {
        let path = self.path_for(subject_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        let npy = npyz::NpyFile::new(BufReader::new(file)).map_err(io_err(&path))?;
        let shape = npy.shape().to_vec();
        if shape.len() != 1 || shape[0] == 0 {
            return Err(EmbeddingError::BadShape { path, shape });
        }
        let values = npy.into_vec::<f32>().map_err(io_err(&path))?;
        Ok(Some(Embedding { values, model_name: Some(self.model_name.clone()) }))
    }

    /// Build the in-memory gallery for `students`, in the order given.
    ///
    /// Students without a file, or with an unreadable one, are left out.
    /// So are vectors whose length differs from the most common one, which
    /// happens when a file from another model was saved under this name.
    pub fn load_all(&self, students: &[Student]) -> Gallery {
        let mut loaded = Vec::with_capacity(students.len());
        for student in students {
            match self.load(student.id) {
                Ok(Some(embedding)) => loaded.push((student, embedding)),
                Ok(None) => {
                    tracing::debug!(student = student.id, "no embedding on disk; skipping");
                }
                Err(error) => {
                    tracing::warn!(student = student.id, %error, "unreadable embedding; skipping");
                }
            }
        }

        let dim = common_dim(loaded.iter().map(|(_, e)| e.dim()));
        let gallery: Gallery = loaded
            .into_iter()
            .filter(|(student, embedding)| {
                let keep = Some(embedding.dim()) == dim;
                if !keep {
                    tracing::warn!(
                        student = student.id,
                        dim = embedding.dim(),
                        expected = dim.unwrap_or_default(),
                        "embedding dimension mismatch; skipping"
                    );
                }
                keep
            })
            .map(|(student, embedding)| KnownFace { subject_id: student.id, name: student.name.clone(), embedding })
            .collect();
        tracing::info!(known = gallery.len(), enrolled = students.len(), model = %self.model_name, "gallery loaded");
        gallery
    }
}

/// Most frequent value, earliest seen on a tie.
fn common_dim(dims: impl Iterator<Item = usize>) -> Option<usize> {
    let mut counts: Vec<(usize, usize)> = Vec::new();
    for dim in dims {
        match counts.iter_mut().find(|(d, _)| *d == dim) {
            Some((_, n)) => *n += 1,
            None => counts.push((dim, 1)),
        }
    }
    counts.iter().rev().max_by_key(|(_, n)| *n).map(|(d, _)| *d)
}
