//! Deployment configuration.
//!
//! Built-in defaults, overlaid by an optional TOML file, overlaid by
//! `ROLLCALL_*` environment variables.

use rollcall_core::{ArcFaceExtractor, EngineError, FaceEngine, RecognitionConfig, ScrfdDetector};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

pub const CONFIG_ENV: &str = "ROLLCALL_CONFIG";
const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: PathBuf,
    /// Root for stored photos; student photo paths are relative to it.
    pub media_root: PathBuf,
    /// Defaults to `<media_root>/encodings`.
    pub encodings_dir: Option<PathBuf>,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    pub bind_addr: String,
    pub jpeg_quality: u8,
    /// TTF/OTF used for frame labels. Without one, only boxes are drawn.
    pub label_font: Option<PathBuf>,
    pub recognition: RecognitionConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            db_path: data_dir.join("rollcall.db"),
            media_root: data_dir.join("media"),
            encodings_dir: None,
            model_dir: data_dir.join("models"),
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            bind_addr: "127.0.0.1:8000".to_string(),
            jpeg_quality: 80,
            label_font: None,
            recognition: RecognitionConfig::default(),
        }
    }
}

impl Config {
    /// Load from `file` (or `$ROLLCALL_CONFIG`) and the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let file = file.map(Path::to_path_buf).or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));
        let mut config = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config =
            toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Overlay `ROLLCALL_*` variables looked up through `var`. Values that
    /// do not parse are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let path = |key: &str| var(key).map(PathBuf::from);

        if let Some(v) = path("ROLLCALL_DB_PATH") {
            self.db_path = v;
        }
        if let Some(v) = path("ROLLCALL_MEDIA_ROOT") {
            self.media_root = v;
        }
        if let Some(v) = path("ROLLCALL_ENCODINGS_DIR") {
            self.encodings_dir = Some(v);
        }
        if let Some(v) = path("ROLLCALL_MODEL_DIR") {
            self.model_dir = v;
        }
        if let Some(v) = var("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("ROLLCALL_BIND") {
            self.bind_addr = v;
        }
        if let Some(v) = path("ROLLCALL_LABEL_FONT") {
            self.label_font = Some(v);
        }
        if let Some(v) = var("ROLLCALL_MODEL_NAME") {
            self.recognition.model_name = v;
        }
        parsed(&var, "ROLLCALL_CAMERA_WIDTH", &mut self.camera_width);
        parsed(&var, "ROLLCALL_CAMERA_HEIGHT", &mut self.camera_height);
        parsed(&var, "ROLLCALL_JPEG_QUALITY", &mut self.jpeg_quality);
        parsed(&var, "ROLLCALL_DISTANCE_THRESHOLD", &mut self.recognition.distance_threshold);
        parsed(&var, "ROLLCALL_DETECTOR_CONFIDENCE", &mut self.recognition.detector.confidence_threshold);
    }

    pub fn encodings_dir(&self) -> PathBuf {
        self.encodings_dir.clone().unwrap_or_else(|| self.media_root.join("encodings"))
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(DETECTOR_MODEL_FILE)
    }

    /// Path to the recognition model, named after `recognition.model_name`.
    pub fn extractor_model_path(&self) -> PathBuf {
        self.model_dir.join(format!("{}.onnx", self.recognition.model_name))
    }

    /// Load both ONNX models into a [`FaceEngine`].
    pub fn load_engine(&self) -> Result<FaceEngine, EngineError> {
        let detector = ScrfdDetector::load(&self.detector_model_path(), self.recognition.detector.clone())?;
        let extractor = ArcFaceExtractor::load(&self.extractor_model_path(), &self.recognition.model_name)?;
        tracing::info!(model = %self.recognition.model_name, dir = %self.model_dir.display(), "face engine loaded");
        Ok(FaceEngine::new(Box::new(detector), Box::new(extractor)))
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = var(key) else { return };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment value"),
    }
}
