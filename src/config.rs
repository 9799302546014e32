use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    pub output_dir: PathBuf,
    pub frame_rate: f64,
    pub raw_ext: String,
    pub tuning_file: PathBuf,
    #[serde(default = "default_client_start_delay")]
    pub client_start_delay_s: f64,
    #[serde(default = "default_drop_tolerance")]
    pub drop_tolerance_s: f64,
}

fn default_client_start_delay() -> f64 {
    5.0
}

fn default_drop_tolerance() -> f64 {
    0.001
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorsConfig {
    pub output_dir: PathBuf,
    #[serde(default = "default_transfer_count")]
    pub transfer_count: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_transfer_count() -> usize {
    32
}

fn default_buffer_size() -> usize {
    64
}

/// Fixed per-rig camera properties exported alongside each frame.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraProfile {
    pub make: String,
    pub model_prefix: String,
    pub aperture: f64,
    pub focal_length_mm: f64,
    pub iso_base: u32,
    pub image_width: u32,
    pub image_height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraName {
    pub ordinal: u8,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelateConfig {
    pub altitude_gate_m: f64,
    pub raw_ext: String,
    pub raw_format: String,
    pub target_ext: String,
    pub utc_offset: String,
    pub profile: CameraProfile,
    #[serde(default, rename = "camera")]
    pub cameras: Vec<CameraName>,
}

impl CorrelateConfig {
    pub fn camera_name(&self, ordinal: u8) -> Option<&str> {
        self.cameras
            .iter()
            .find(|c| c.ordinal == ordinal)
            .map(|c| c.name.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub sensors: SensorsConfig,
    pub correlate: CorrelateConfig,
}

impl AppConfig {
    pub fn load_default() -> anyhow::Result<Self> {
        let default = include_str!("../config/default.toml");
        let cfg: AppConfig = toml::from_str(default)?;
        Ok(cfg)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let p = path.into();
        let s = fs::read_to_string(&p)?;
        let cfg: AppConfig = toml::from_str(&s)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_parses() {
        let cfg = AppConfig::load_default().unwrap();
        assert_eq!(cfg.sensors.transfer_count, 32);
        assert_eq!(cfg.correlate.altitude_gate_m, 190.0);
        assert_eq!(
            cfg.correlate.camera_name(2).unwrap(),
            "v2 sony imx477c2 3032 4056 brown 0.8298"
        );
        assert!(cfg.correlate.camera_name(7).is_none());
    }

    #[test]
    fn test_bad_config_is_an_error() {
        let result: Result<AppConfig, _> = toml::from_str("[capture]\nframe_rate = \"fast\"");
        assert!(result.is_err());
    }
}
