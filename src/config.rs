use std::fs;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, span, trace, Level};

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub simulator: SimulatorConfig,
    pub scenario: ScenarioConfig,
    pub vehicle: VehicleConfig,
    pub camera: CameraConfig,
    pub perception: PerceptionConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize)]
pub struct SimulatorConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub home: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScenarioConfig {
    pub map: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct VehicleConfig {
    pub id: String,
    pub model: String,
    pub license: String,
    pub pos: [f32; 3],
    pub rot_quat: Option<[f32; 4]>,
    pub rot_euler_deg: Option<[f32; 3]>,
    #[serde(default)]
    pub traffic: bool,
}

#[derive(Debug, Deserialize)]
pub struct CameraConfig {
    #[serde(default)]
    pub enabled: bool,
    pub name: String,
    pub pos: [f32; 3],
    pub dir: [f32; 3],
    pub fov_deg: f32,
    pub resolution: [u32; 2],
}

#[derive(Debug, Deserialize)]
pub struct PerceptionConfig {
    #[serde(default)]
    pub enabled: bool,
    pub execution: String,
    pub detector: DetectorConfig,
    pub segmenter: SegmenterConfig,
}

#[derive(Debug, Deserialize)]
pub struct DetectorConfig {
    pub onnx_path: String,
    pub conf_thresh: f32,
    pub nms_thresh: f32,
    pub input_size: [u32; 2],
}

#[derive(Debug, Deserialize)]
pub struct SegmenterConfig {
    pub onnx_path: String,
    pub input_size: [u32; 2],
}

#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    pub log_path: String,
    pub frame_dir: Option<String>,
    #[serde(default)]
    pub display: bool,
    pub font_path: String,
    #[serde(default = "default_mask_alpha")]
    pub mask_alpha: f32,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    25252
}

fn default_mask_alpha() -> f32 {
    0.4
}

impl AppConfig {
    pub fn from_file<P>(file_path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Debug,
    {
        let span = span!(Level::TRACE, "AppConfig::from_file");
        let _enter = span.enter();

        trace!("Reading content from file {:?}...", file_path);
        let config_content =
            fs::read_to_string(file_path).context("Failed to read config from file")?;

        trace!("Deserializing content to AppConfig...");
        let config: Self = toml::from_str(&config_content)
            .context("Failed to deserialize content to AppConfig")?;

        config.validate()?;

        debug!("Configurations: {:#?}", config);
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.vehicle.rot_quat.is_some() && self.vehicle.rot_euler_deg.is_some() {
            bail!("Vehicle rotation must be given as rot_quat or rot_euler_deg, not both");
        }
        if self.camera.enabled && (self.camera.resolution[0] == 0 || self.camera.resolution[1] == 0)
        {
            bail!(
                "Camera resolution must be non-zero, got {}x{}",
                self.camera.resolution[0],
                self.camera.resolution[1]
            );
        }
        if self.perception.enabled && !self.camera.enabled {
            bail!("Perception requires the camera to be enabled");
        }
        if !(0.0..=1.0).contains(&self.output.mask_alpha) {
            bail!(
                "Mask alpha must lie in [0, 1], got {}",
                self.output.mask_alpha
            );
        }
        Ok(())
    }
}
