use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture resolution.
    pub frame_width: u32,
    pub frame_height: u32,
    /// Path to the ONNX feature extraction model.
    pub model_path: PathBuf,
    /// Square model input edge in pixels.
    pub input_size: u32,
    /// Embedding dimensionality produced by the model.
    pub embedding_dim: usize,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity a match must strictly exceed.
    pub similarity_threshold: f32,
    /// Number of warmup frames to discard when a camera session starts.
    pub warmup_frames: usize,
    /// Raw frames tried per capture before giving up on dark frames.
    pub capture_attempts: usize,
    /// Whether recognition may overwrite a manually entered attendance row.
    pub overwrite_manual: bool,
    /// How many recently marked names a session remembers.
    pub recent_marks: usize,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_path = std::env::var("ROLLCALL_MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models").join("feature_extractor.onnx"));

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("rollcall.db"));

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            frame_width: env_parse("ROLLCALL_FRAME_WIDTH", 640),
            frame_height: env_parse("ROLLCALL_FRAME_HEIGHT", 480),
            model_path,
            input_size: env_parse("ROLLCALL_INPUT_SIZE", 224),
            embedding_dim: env_parse("ROLLCALL_EMBEDDING_DIM", 768),
            db_path,
            similarity_threshold: checked_threshold(env_parse(
                "ROLLCALL_SIMILARITY_THRESHOLD",
                rollcall_core::DEFAULT_THRESHOLD,
            )),
            warmup_frames: env_parse("ROLLCALL_WARMUP_FRAMES", 4),
            capture_attempts: env_parse("ROLLCALL_CAPTURE_ATTEMPTS", 5),
            overwrite_manual: env_flag("ROLLCALL_OVERWRITE_MANUAL", true),
            recent_marks: env_parse("ROLLCALL_RECENT_MARKS", 5),
            system_bus: env_flag("ROLLCALL_SYSTEM_BUS", false),
        }
    }

    pub fn extractor_config(&self) -> rollcall_core::OnnxExtractorConfig {
        let mut config = rollcall_core::OnnxExtractorConfig::new(&self.model_path);
        config.input_size = self.input_size;
        config.embedding_dim = self.embedding_dim;
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Cosine similarity lies in [-1, 1]; a threshold outside [-1, 1) (or NaN)
/// could never be exceeded.
fn checked_threshold(value: f32) -> f32 {
    if (-1.0..1.0).contains(&value) {
        value
    } else {
        tracing::warn!(
            value,
            default = rollcall_core::DEFAULT_THRESHOLD,
            "ROLLCALL_SIMILARITY_THRESHOLD out of range; using default"
        );
        rollcall_core::DEFAULT_THRESHOLD
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
