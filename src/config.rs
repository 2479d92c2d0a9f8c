use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::detect::IdMode;
use crate::encode::DEFAULT_JPEG_QUALITY;
use crate::ingest::SourceSpec;
use crate::select::SelectionPolicy;

const DEFAULT_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_SOURCE: &str = "stub://demo?fps=15";
const DEFAULT_ENGINE: &str = "stub";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Deserialize, Default)]
struct LockstreamConfigFile {
    addr: Option<String>,
    upload_dir: Option<PathBuf>,
    default_source: Option<String>,
    max_upload_bytes: Option<u64>,
    detection: Option<DetectionConfigFile>,
    selection: Option<SelectionConfigFile>,
    stream: Option<StreamConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    engine: Option<String>,
    model_path: Option<PathBuf>,
    id_mode: Option<IdMode>,
}

#[derive(Debug, Deserialize, Default)]
struct SelectionConfigFile {
    policy: Option<SelectionPolicy>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct LockstreamConfig {
    pub addr: String,
    pub upload_dir: PathBuf,
    pub default_source: String,
    pub max_upload_bytes: u64,
    pub detection: DetectionSettings,
    pub selection_policy: SelectionPolicy,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub engine: String,
    pub model_path: Option<PathBuf>,
    pub id_mode: IdMode,
}

impl Default for LockstreamConfig {
    fn default() -> Self {
        Self::from_file(LockstreamConfigFile::default())
    }
}

impl LockstreamConfig {
    /// Defaults, then the JSON file named by `LOCKSTREAM_CONFIG`, then env.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("LOCKSTREAM_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like `load`, with an explicit config file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: LockstreamConfigFile) -> Self {
        let detection = DetectionSettings {
            engine: file
                .detection
                .as_ref()
                .and_then(|d| d.engine.clone())
                .unwrap_or_else(|| DEFAULT_ENGINE.to_string()),
            model_path: file.detection.as_ref().and_then(|d| d.model_path.clone()),
            id_mode: file
                .detection
                .as_ref()
                .and_then(|d| d.id_mode)
                .unwrap_or_default(),
        };
        Self {
            addr: file.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            upload_dir: file
                .upload_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            default_source: file
                .default_source
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            max_upload_bytes: file.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            detection,
            selection_policy: file
                .selection
                .and_then(|s| s.policy)
                .unwrap_or_default(),
            jpeg_quality: file
                .stream
                .and_then(|s| s.jpeg_quality)
                .unwrap_or(DEFAULT_JPEG_QUALITY),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("LOCKSTREAM_ADDR") {
            self.addr = addr;
        }
        if let Some(dir) = non_empty_env("LOCKSTREAM_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(source) = non_empty_env("LOCKSTREAM_DEFAULT_SOURCE") {
            self.default_source = source;
        }
        if let Some(engine) = non_empty_env("LOCKSTREAM_ENGINE") {
            self.detection.engine = engine;
        }
        if let Some(path) = non_empty_env("LOCKSTREAM_MODEL_PATH") {
            self.detection.model_path = Some(PathBuf::from(path));
        }
        if let Some(mode) = non_empty_env("LOCKSTREAM_ID_MODE") {
            self.detection.id_mode = mode.parse()?;
        }
        if let Some(policy) = non_empty_env("LOCKSTREAM_SELECTION_POLICY") {
            self.selection_policy = policy.parse()?;
        }
        if let Some(quality) = non_empty_env("LOCKSTREAM_JPEG_QUALITY") {
            self.jpeg_quality = quality
                .parse()
                .map_err(|_| anyhow!("LOCKSTREAM_JPEG_QUALITY must be an integer in 1..=100"))?;
        }
        if let Some(bytes) = non_empty_env("LOCKSTREAM_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = bytes
                .parse()
                .map_err(|_| anyhow!("LOCKSTREAM_MAX_UPLOAD_BYTES must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| anyhow!("invalid listen address '{}': {}", self.addr, e))?;
        SourceSpec::parse(&self.default_source)
            .map_err(|e| anyhow!("invalid default_source: {}", e))?;
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be within 1..=100"));
        }
        if self.max_upload_bytes == 0 {
            return Err(anyhow!("max_upload_bytes must be greater than zero"));
        }
        self.detection.engine = self.detection.engine.trim().to_lowercase();
        if self.detection.engine == "tract" && self.detection.model_path.is_none() {
            return Err(anyhow!(
                "engine 'tract' requires detection.model_path (or LOCKSTREAM_MODEL_PATH)"
            ));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<LockstreamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
