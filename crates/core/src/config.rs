use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::ModelSource;
use crate::geometry::{TileProfile, DEFAULT_HALO, DEFAULT_SCALE, DEFAULT_TILE_SIZE};
use crate::job::UpscaleSettings;
use crate::ort_backend::{InferenceBackend, InputRange, OrtRuntimeConfig, TensorLayout};

const CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_DATA_DIR: &str = "TILESCALE_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub model: ModelConfig,
    pub tiling: TilingConfig,
    pub inference: InferenceConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub output_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// File name under `paths.models_dir`, or an absolute path.
    pub file: PathBuf,
    pub input_range: InputRange,
    pub layout: TensorLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TilingConfig {
    pub scale: u32,
    pub tile_size: u32,
    pub halo: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InferenceConfig {
    pub prefer_accelerator: bool,
    pub accelerator: InferenceBackend,
    /// CPU intra-op threads; 0 means `max(available_parallelism, 2)`.
    pub baseline_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            output_dir: PathBuf::from("output"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("realesrgan_x4_288.onnx"),
            input_range: InputRange::Unit,
            layout: TensorLayout::Nchw,
        }
    }
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            scale: DEFAULT_SCALE,
            tile_size: DEFAULT_TILE_SIZE,
            halo: DEFAULT_HALO,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            prefer_accelerator: true,
            accelerator: InferenceBackend::Cuda,
            baseline_threads: 0,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "127.0.0.1".to_string(),
        }
    }
}

/// Paths from [`PathsConfig`] resolved against the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPaths {
    pub models_dir: PathBuf,
    pub output_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
    pub model_file: PathBuf,
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn tile_profile(&self) -> crate::error::Result<TileProfile> {
        TileProfile::new(self.tiling.scale, self.tiling.tile_size, self.tiling.halo)
    }

    pub fn resolve_paths(&self, data_dir: &Path) -> ResolvedPaths {
        let models_dir = resolve_relative_to(data_dir, &self.paths.models_dir);
        let model_file = resolve_relative_to(&models_dir, &self.model.file);
        ResolvedPaths {
            output_dir: resolve_relative_to(data_dir, &self.paths.output_dir),
            trt_cache_dir: resolve_relative_to(data_dir, &self.paths.trt_cache_dir),
            models_dir,
            model_file,
        }
    }

    pub fn ort_runtime_config(&self, data_dir: &Path) -> Result<OrtRuntimeConfig> {
        let paths = self.resolve_paths(data_dir);
        Ok(OrtRuntimeConfig {
            accelerator: self.inference.accelerator,
            baseline_threads: self.inference.baseline_threads,
            trt_cache_dir: Some(paths.trt_cache_dir),
            input_range: self.model.input_range,
            layout: self.model.layout,
            profile: self.tile_profile()?,
        })
    }

    pub fn upscale_settings(&self, data_dir: &Path) -> Result<UpscaleSettings> {
        let paths = self.resolve_paths(data_dir);
        Ok(UpscaleSettings {
            model: ModelSource::Path(paths.model_file),
            profile: self.tile_profile()?,
            prefer_accelerator: self.inference.prefer_accelerator,
        })
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TILESCALE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Absolute paths are returned as-is, relative ones are joined to `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.output_dir, PathBuf::from("output"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.tiling.scale, 4);
        assert_eq!(cfg.tiling.tile_size, 256);
        assert_eq!(cfg.tiling.halo, 16);
        assert!(cfg.inference.prefer_accelerator);
        assert_eq!(cfg.inference.accelerator, InferenceBackend::Cuda);
        assert_eq!(cfg.inference.baseline_threads, 0);
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.tile_profile().unwrap(), TileProfile::REFERENCE);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let raw = r#"
[model]
layout = "nhwc"
input_range = "pixel"

[tiling]
tile_size = 128

[inference]
accelerator = "tensorrt"
"#;
        let cfg: AppConfig = toml::from_str(raw).expect("parse partial config");
        assert_eq!(cfg.model.layout, TensorLayout::Nhwc);
        assert_eq!(cfg.model.input_range, InputRange::Pixel);
        assert_eq!(cfg.tiling.tile_size, 128);
        assert_eq!(cfg.tiling.scale, 4);
        assert_eq!(cfg.inference.accelerator, InferenceBackend::Tensorrt);
        assert!(cfg.inference.prefer_accelerator);
        assert_eq!(cfg.server, ServerConfig::default());
    }

    #[test]
    fn invalid_tiling_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.tiling.scale = 0;
        assert!(cfg.tile_profile().is_err());
        assert!(cfg.upscale_settings(Path::new("/data")).is_err());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("temp dir");
        let loaded = AppConfig::load_from_path(&temp.path().join("missing.toml"))
            .expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[tiling\nscale = ").expect("write config");
        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config TOML"));
    }

    #[test]
    fn data_dir_resolution_order() {
        assert_eq!(
            data_dir(Some(Path::new("/custom"))),
            PathBuf::from("/custom")
        );

        let previous = env::var_os(ENV_DATA_DIR);
        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);
        if let Some(value) = previous {
            env::set_var(ENV_DATA_DIR, value);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        assert_eq!(
            config_path(Path::new("/data")),
            PathBuf::from("/data/config.toml")
        );
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let root = temp.path().join("nested").join("data");
        initialize_data_dir(&root).expect("initialize data dir");

        assert!(root.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&root)).expect("reload");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn resolve_paths_uses_data_dir_and_models_dir() {
        let mut cfg = AppConfig::default();
        cfg.model.file = PathBuf::from("x4.onnx");
        let paths = cfg.resolve_paths(Path::new("/srv/tilescale"));
        assert_eq!(paths.models_dir, PathBuf::from("/srv/tilescale/models"));
        assert_eq!(paths.model_file, PathBuf::from("/srv/tilescale/models/x4.onnx"));
        assert_eq!(paths.output_dir, PathBuf::from("/srv/tilescale/output"));

        cfg.model.file = PathBuf::from("/opt/models/x4.onnx");
        cfg.paths.output_dir = PathBuf::from("/tmp/out");
        let paths = cfg.resolve_paths(Path::new("/srv/tilescale"));
        assert_eq!(paths.model_file, PathBuf::from("/opt/models/x4.onnx"));
        assert_eq!(paths.output_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn runtime_config_carries_model_and_profile() {
        let mut cfg = AppConfig::default();
        cfg.inference.baseline_threads = 6;
        let runtime = cfg.ort_runtime_config(Path::new("/d")).expect("runtime config");
        assert_eq!(runtime.baseline_threads, 6);
        assert_eq!(runtime.layout, TensorLayout::Nchw);
        assert_eq!(runtime.trt_cache_dir, Some(PathBuf::from("/d/trt_cache")));
        assert_eq!(runtime.profile.context_size(), 288);
    }

    #[test]
    fn resolve_relative_to_handles_absolute_and_relative() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }
}
