use std::path::{Path, PathBuf};
use std::{fs, time::Duration};

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::error;

pub mod config;
pub mod output;
pub mod perception;
pub mod sim;

use config::{OutputConfig, PerceptionConfig};
use perception::Perceptor;

/// Creates the directories the run writes into: the parent of the
/// detection log and, when configured, the annotated frame dump.
pub fn create_output_dirs(output: &OutputConfig) -> Result<()> {
    if let Some(parent) = Path::new(&output.log_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                error!("Failed to create directory {:?}: {e}", parent);
                e
            })?;
        }
    }

    if let Some(frame_dir) = &output.frame_dir {
        fs::create_dir_all(frame_dir).map_err(|e| {
            error!("Failed to create directory {:?}: {e}", frame_dir);
            e
        })?;
    }

    Ok(())
}

/// Builds both ONNX sessions behind a terminal spinner; model compilation
/// can take a while on the slower execution providers.
pub fn build_perceptor(config: &PerceptionConfig) -> Result<Perceptor> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .map_err(|e| {
                error!("Failed to set spinner template: {e}");
                e
            })?,
    );
    spinner.set_message("Building detection and segmentation models...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let perceptor = Perceptor::from_config(config).map_err(|e| {
        error!("Failed to build models: {e}");
        spinner.finish_with_message("Failed to build models.");
        e
    })?;

    spinner.finish_with_message("Finished building models.");
    Ok(perceptor)
}

/// Path of the annotated dump of a frame inside the configured directory.
pub fn annotated_frame_path(frame_dir: &str, frame_id: u64) -> PathBuf {
    Path::new(frame_dir).join(format!("{frame_id:06}.png"))
}
