use anyhow::{anyhow, Result};
use image::RgbImage;
use ndarray::{s, ArrayView3};
use ort::{inputs, Session};
use rayon::prelude::*;
use tracing::{debug, error, span, trace, Level};

use super::detect::{build_session, Execution};
use super::preprocess_rgb;

/// Per-pixel class index map at model resolution. Indices refer to
/// [`super::SurfaceClass`] values; unknown indices are tolerated and
/// rendered as unclassified by the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentationMap {
    width: u32,
    height: u32,
    classes: Vec<u8>,
}

impl SegmentationMap {
    /// Argmaxes `(classes, height, width)` logits into a class index per
    /// pixel. Class counts that do not fit an index byte are rejected.
    pub fn from_logits(logits: ArrayView3<f32>) -> Result<Self> {
        let span = span!(Level::TRACE, "SegmentationMap::from_logits");
        let _enter = span.enter();

        let (class_count, height, width) = logits.dim();
        if class_count == 0 {
            return Err(anyhow!("Segmentation output has no class channel"));
        }
        if class_count > 255 {
            return Err(anyhow!(
                "Segmentation output has {class_count} classes, index byte overflow"
            ));
        }

        trace!("Argmaxing {class_count} classes over {width}x{height} pixels");
        let classes: Vec<u8> = (0..height * width)
            .into_par_iter()
            .map(|index| {
                let y = index / width;
                let x = index % width;

                let mut best_class = 0u8;
                let mut best_score = f32::NEG_INFINITY;
                for class in 0..class_count {
                    let score = logits[[class, y, x]];
                    if score > best_score {
                        best_score = score;
                        best_class = class as u8;
                    }
                }
                best_class
            })
            .collect();

        Ok(Self {
            width: width as u32,
            height: height as u32,
            classes,
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Class index at map coordinates. Callers must stay in bounds.
    #[inline]
    pub fn class_at(&self, x: u32, y: u32) -> u8 {
        self.classes[(y * self.width + x) as usize]
    }
}

/// Semantic segmentation model on ONNX Runtime. [`Segmenter::infer`]
/// returns the per-pixel class map at model resolution.
pub struct Segmenter {
    input_size: (u32, u32),
    session: Session,
}

impl Segmenter {
    pub fn from_file(onnx_path: &str, input_size: (u32, u32), execution: Execution) -> Result<Self> {
        let span = span!(Level::TRACE, "Segmenter::from_file");
        let _enter = span.enter();

        debug!("Initializing segmenter: input_size={input_size:?}, onnx_path={onnx_path}");
        let session = build_session(onnx_path, execution)?;

        Ok(Self {
            input_size,
            session,
        })
    }

    pub fn infer(&self, image: &RgbImage) -> Result<SegmentationMap> {
        let span = span!(Level::TRACE, "Segmenter::infer");
        let _enter = span.enter();

        trace!("Starting segmenter inference.");
        let input_tensor = preprocess_rgb(image, self.input_size);

        let outputs = self
            .session
            .run(inputs!["input" => input_tensor.view()]?)
            .map_err(|e| {
                error!("Failed to run segmenter session: {e}");
                e
            })?;
        let output = outputs["output"]
            .try_extract_tensor::<f32>()
            .map_err(|e| {
                error!("Failed to extract segmenter output tensor: {e}");
                e
            })?
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| {
                error!("Segmenter output is not a 4D logits tensor: {e}");
                e
            })?;

        let map = SegmentationMap::from_logits(output.slice(s![0, .., .., ..]))?;
        trace!(
            "Segmenter produced {}x{} class map.",
            map.width(),
            map.height()
        );

        Ok(map)
    }
}
