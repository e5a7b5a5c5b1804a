//! TOML-backed configuration for the segmentation backend.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize, de::Error as SerdeDeError};
use thiserror::Error;

use crate::app_dirs;
use crate::layers::{LayerEntry, default_layers};
use crate::ml::logreg::TrainOptions;
use crate::render::DEFAULT_COLOR_MAP;

/// Default filename used to store the configuration.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Aggregate configuration loaded from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Root that relative layer and seed paths are resolved against.
    #[serde(default)]
    pub data_root: Option<PathBuf>,
    #[serde(default)]
    pub inference: InferenceSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub augment: TrainOptions,
    #[serde(default)]
    pub render: RenderSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default = "default_layers")]
    pub layers: Vec<LayerEntry>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            inference: InferenceSettings::default(),
            session: SessionSettings::default(),
            augment: TrainOptions::default(),
            render: RenderSettings::default(),
            logging: LoggingSettings::default(),
            data_root: None,
            layers: default_layers(),
        }
    }
}

/// Sliding-window inference parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSettings {
    /// Side length of the square model input window.
    #[serde(default = "default_input_size")]
    pub input_size: usize,
    #[serde(default = "default_stride")]
    pub stride_y: usize,
    #[serde(default = "default_stride")]
    pub stride_x: usize,
    /// Offset of the heavily weighted central band inside each window.
    #[serde(default = "default_down_weight_padding")]
    pub down_weight_padding: usize,
    /// Number of windows handed to the network per call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Network output channels, including the background channel.
    #[serde(default = "default_output_channels")]
    pub output_channels: usize,
    /// Width of the per-pixel feature vector produced by the network.
    #[serde(default = "default_output_features")]
    pub output_features: usize,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            stride_y: default_stride(),
            stride_x: default_stride(),
            down_weight_padding: default_down_weight_padding(),
            batch_size: default_batch_size(),
            output_channels: default_output_channels(),
            output_features: default_output_features(),
        }
    }
}

impl InferenceSettings {
    /// Check that the window geometry is usable for stitching.
    pub fn validate(&self) -> Result<(), String> {
        if self.input_size == 0 {
            return Err("input_size must be > 0".to_string());
        }
        if self.stride_y == 0 || self.stride_x == 0 {
            return Err("strides must be > 0".to_string());
        }
        if self.stride_y > self.input_size || self.stride_x > self.input_size {
            return Err(format!(
                "strides ({}, {}) must not exceed input_size {}",
                self.stride_y, self.stride_x, self.input_size
            ));
        }
        let band_end = self.down_weight_padding + self.stride_y.max(self.stride_x);
        if band_end > self.input_size {
            return Err(format!(
                "down_weight_padding {} + stride exceeds input_size {}",
                self.down_weight_padding, self.input_size
            ));
        }
        if self.output_channels < 2 {
            return Err("output_channels must include background plus one class".to_string());
        }
        if self.output_features == 0 {
            return Err("output_features must be > 0".to_string());
        }
        Ok(())
    }

    /// Number of class channels left after dropping the background channel.
    pub fn class_channels(&self) -> usize {
        self.output_channels.saturating_sub(1)
    }
}

/// Online retraining policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Classes the augment head predicts.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Distinct labelled classes required before a retrain is attempted.
    #[serde(default = "default_min_retrain_classes")]
    pub min_retrain_classes: usize,
    /// Retrain on the seed set as part of every reset.
    #[serde(default)]
    pub use_seed_data: bool,
    #[serde(default)]
    pub seed_features: Option<PathBuf>,
    #[serde(default)]
    pub seed_labels: Option<PathBuf>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            num_classes: default_num_classes(),
            min_retrain_classes: default_min_retrain_classes(),
            use_seed_data: false,
            seed_features: None,
            seed_labels: None,
        }
    }
}

/// Prediction colouring for the front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderSettings {
    #[serde(default = "default_color_map")]
    pub color_map: Vec<[f32; 3]>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            color_map: default_color_map(),
        }
    }
}

/// Log output preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            max_log_files: default_max_log_files(),
        }
    }
}

/// Errors that may occur while loading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to create config directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config at {path}: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config to TOML at {path}: {source}")]
    SerializeToml {
        path: PathBuf,
        source: toml::ser::Error,
    },
    #[error("Invalid inference settings in {path}: {message}")]
    InvalidInference { path: PathBuf, message: String },
    #[error("No suitable config directory found")]
    NoConfigDir,
}

/// Resolve the configuration file path, ensuring the parent directory exists.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    let dir = app_dirs::app_root_dir().map_err(map_app_dir_error)?;
    Ok(dir.join(CONFIG_FILE_NAME))
}

/// Load the configuration from the app directory, returning defaults if missing.
pub fn load_or_default() -> Result<ToolConfig, ConfigError> {
    load_from(&config_path()?)
}

/// Load configuration from a specific file, returning defaults if it is missing.
pub fn load_from(path: &Path) -> Result<ToolConfig, ConfigError> {
    if !path.exists() {
        return Ok(ToolConfig::default());
    }
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8(bytes).map_err(|source| ConfigError::ParseToml {
        path: path.to_path_buf(),
        source: SerdeDeError::custom(source),
    })?;
    let config: ToolConfig = toml::from_str(&text).map_err(|source| ConfigError::ParseToml {
        path: path.to_path_buf(),
        source,
    })?;
    config
        .inference
        .validate()
        .map_err(|message| ConfigError::InvalidInference {
            path: path.to_path_buf(),
            message,
        })?;
    Ok(config)
}

/// Save configuration to a specific path, creating parent directories as needed.
pub fn save_to_path(config: &ToolConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let data = toml::to_string_pretty(config).map_err(|source| ConfigError::SerializeToml {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(path, data).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })
}

impl ToolConfig {
    /// Check that the sections agree with each other.
    ///
    /// The network's class channels must match the augment head's classes and
    /// the colour map needs one entry per class.
    pub fn validate(&self) -> Result<(), String> {
        self.inference.validate()?;
        let classes = self.session.num_classes;
        if self.inference.class_channels() != classes {
            return Err(format!(
                "inference produces {} class channels but session.num_classes is {}",
                self.inference.class_channels(),
                classes
            ));
        }
        if self.session.min_retrain_classes == 0 || self.session.min_retrain_classes > classes {
            return Err(format!(
                "session.min_retrain_classes must be within 1..={classes}, got {}",
                self.session.min_retrain_classes
            ));
        }
        if self.render.color_map.len() < classes {
            return Err(format!(
                "render.color_map has {} colours for {} classes",
                self.render.color_map.len(),
                classes
            ));
        }
        if self.augment.epochs == 0 || self.augment.batch_size == 0 {
            return Err("augment.epochs and augment.batch_size must be > 0".to_string());
        }
        Ok(())
    }

    /// Resolve a possibly relative path against `data_root`.
    pub fn resolve_data_path(&self, path: &Path) -> PathBuf {
        match &self.data_root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

fn map_app_dir_error(error: app_dirs::AppDirError) -> ConfigError {
    match error {
        app_dirs::AppDirError::NoBaseDir => ConfigError::NoConfigDir,
        app_dirs::AppDirError::CreateDir { path, source } => ConfigError::CreateDir { path, source },
    }
}

fn default_input_size() -> usize {
    240
}

fn default_stride() -> usize {
    160
}

fn default_down_weight_padding() -> usize {
    40
}

fn default_batch_size() -> usize {
    32
}

fn default_output_channels() -> usize {
    5
}

fn default_output_features() -> usize {
    64
}

fn default_num_classes() -> usize {
    4
}

fn default_min_retrain_classes() -> usize {
    4
}

fn default_color_map() -> Vec<[f32; 3]> {
    DEFAULT_COLOR_MAP.to_vec()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.inference.input_size, 240);
        assert_eq!(config.session.min_retrain_classes, 4);
        assert!(!config.session.use_seed_data);
        assert!(!config.layers.is_empty());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "[inference]\nbatch_size = 8\n\n[session]\nuse_seed_data = true\n",
        )
        .unwrap();
        let config = load_from(&path).unwrap();
        assert_eq!(config.inference.batch_size, 8);
        assert_eq!(config.inference.stride_x, 160);
        assert!(config.session.use_seed_data);
        assert_eq!(config.render.color_map.len(), 4);
    }

    #[test]
    fn rejects_stride_larger_than_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[inference]\ninput_size = 64\nstride_y = 128\n").unwrap();
        let err = load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInference { .. }));
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let mut config = ToolConfig::default();
        config.inference.output_features = 16;
        config.session.seed_features = Some(PathBuf::from("seed/x.npy"));
        save_to_path(&config, &path).unwrap();
        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded.inference.output_features, 16);
        assert_eq!(
            loaded.session.seed_features.as_deref(),
            Some(Path::new("seed/x.npy"))
        );
        assert_eq!(loaded.layers.len(), config.layers.len());
    }

    #[test]
    fn default_sections_agree() {
        assert!(ToolConfig::default().validate().is_ok());
    }

    #[test]
    fn cross_section_mismatches_are_reported() {
        let mut config = ToolConfig::default();
        config.session.num_classes = 5;
        assert!(config.validate().unwrap_err().contains("class channels"));

        let mut config = ToolConfig::default();
        config.render.color_map.truncate(2);
        assert!(config.validate().unwrap_err().contains("color_map"));

        let mut config = ToolConfig::default();
        config.session.min_retrain_classes = 6;
        assert!(config.validate().unwrap_err().contains("min_retrain_classes"));
    }

    #[test]
    fn relative_paths_resolve_against_data_root() {
        let mut config = ToolConfig::default();
        config.data_root = Some(PathBuf::from("/srv/web_tool"));
        assert_eq!(
            config.resolve_data_path(Path::new("tiles/a.tif")),
            PathBuf::from("/srv/web_tool/tiles/a.tif")
        );
        assert_eq!(
            config.resolve_data_path(Path::new("/abs/b.tif")),
            PathBuf::from("/abs/b.tif")
        );
    }
}
