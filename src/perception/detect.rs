use anyhow::{anyhow, Result};
use image::RgbImage;
use ndarray::{s, Array2, Axis};
use ort::{
    inputs, CUDAExecutionProvider, GraphOptimizationLevel, OpenVINOExecutionProvider, Session,
    TensorRTExecutionProvider,
};
use tracing::{debug, error, span, trace, Level};

use super::preprocess_rgb;

/// Center-form bounding box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x_center: f32,
    pub y_center: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f32,
    pub class_id: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum Execution {
    TensorRT,
    CUDA,
    OpenVINO,
    CPU,
    Default,
}

impl TryFrom<&str> for Execution {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "tensorrt" => Ok(Execution::TensorRT),
            "cuda" => Ok(Execution::CUDA),
            "openvino" => Ok(Execution::OpenVINO),
            "cpu" => Ok(Execution::CPU),
            "default" => Ok(Execution::Default),
            _ => Err(anyhow!("Failed to convert {value} to execution")),
        }
    }
}

pub(crate) fn build_session(onnx_path: &str, execution: Execution) -> Result<Session> {
    let span = span!(Level::TRACE, "detect::build_session");
    let _enter = span.enter();

    debug!("Building ONNX session from {onnx_path} with execution {execution:?}");
    let providers = match execution {
        Execution::TensorRT => vec![TensorRTExecutionProvider::default().build()],
        Execution::CUDA => vec![CUDAExecutionProvider::default().build()],
        Execution::OpenVINO => vec![OpenVINOExecutionProvider::default().build()],
        Execution::CPU => vec![],
        _ => vec![
            CUDAExecutionProvider::default().build(),
            OpenVINOExecutionProvider::default().build(),
            TensorRTExecutionProvider::default().build(),
        ],
    };

    let session = Session::builder()
        .map_err(|e| {
            error!("Failed to build session builder: {e}");
            e
        })?
        .with_execution_providers(providers)
        .map_err(|e| {
            error!("Failed to register execution providers: {e}");
            e
        })?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| {
            error!("Failed to set optimization level: {e}");
            e
        })?
        .commit_from_file(onnx_path)
        .map_err(|e| {
            error!("Failed to commit from file: {e}");
            e
        })?;

    trace!("ONNX session successfully built.");
    Ok(session)
}

/// YOLO-family object detector. The session is built once at construction;
/// [`Detector::infer`] is preprocess, session run and output decoding.
pub struct Detector {
    conf_threshold: f32,
    nms_threshold: f32,
    input_size: (u32, u32),
    session: Session,
}

impl Detector {
    pub fn from_file(
        onnx_path: &str,
        conf_threshold: f32,
        nms_threshold: f32,
        input_size: (u32, u32),
        execution: Execution,
    ) -> Result<Self> {
        let span = span!(Level::TRACE, "Detector::from_file");
        let _enter = span.enter();

        debug!(
            "Initializing detector: conf_threshold={conf_threshold}, nms_threshold={nms_threshold}, input_size={input_size:?}, onnx_path={onnx_path}"
        );
        let session = build_session(onnx_path, execution)?;

        Ok(Self {
            conf_threshold,
            nms_threshold,
            input_size,
            session,
        })
    }

    pub fn infer(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let span = span!(Level::TRACE, "Detector::infer");
        let _enter = span.enter();

        trace!("Starting detector inference.");
        let input_tensor = preprocess_rgb(image, self.input_size);

        let outputs = self
            .session
            .run(inputs!["images" => input_tensor.view()]?)
            .map_err(|e| {
                error!("Failed to run detector session: {e}");
                e
            })?;
        let output = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| {
                error!("Failed to extract detector output tensor: {e}");
                e
            })?
            .t()
            .slice(s![.., .., 0])
            .into_owned();

        let detections = decode_output(
            output,
            self.input_size,
            image.dimensions(),
            self.conf_threshold,
            self.nms_threshold,
        );
        trace!("Detector produced {} detections.", detections.len());

        Ok(detections)
    }
}

/// Decodes `(rows, 4 + classes)` model output: bbox, per-class score
/// argmax, confidence filter, then NMS. Coordinates are rescaled from
/// model input space to the original frame.
pub fn decode_output(
    output: Array2<f32>,
    input_size: (u32, u32),
    frame_size: (u32, u32),
    conf_threshold: f32,
    nms_threshold: f32,
) -> Vec<Detection> {
    let span = span!(Level::TRACE, "detect::decode_output");
    let _enter = span.enter();

    let mut detections = Vec::new();

    for row in output.axis_iter(Axis(0)) {
        let Some((class_id, confidence)) = row
            .iter()
            .skip(4)
            .enumerate()
            .map(|(index, value)| (index, *value))
            .reduce(|best, candidate| if candidate.1 > best.1 { candidate } else { best })
        else {
            continue;
        };

        if confidence < conf_threshold {
            continue;
        }

        let (input_width, input_height) = input_size;
        let (frame_width, frame_height) = frame_size;

        detections.push(Detection {
            bbox: BBox {
                x_center: row[0] / (input_width as f32) * (frame_width as f32),
                y_center: row[1] / (input_height as f32) * (frame_height as f32),
                width: row[2] / (input_width as f32) * (frame_width as f32),
                height: row[3] / (input_height as f32) * (frame_height as f32),
            },
            confidence,
            class_id: class_id as u32,
        });
    }

    let final_detections = non_max_suppression(detections, nms_threshold);
    trace!("Non-max suppression kept {} boxes.", final_detections.len());

    final_detections
}

pub fn non_max_suppression(mut detections: Vec<Detection>, nms_threshold: f32) -> Vec<Detection> {
    let mut final_detections = Vec::new();

    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    while !detections.is_empty() {
        let best_detection = detections.remove(0);
        final_detections.push(best_detection.clone());

        detections
            .retain(|detection| compute_iou(&best_detection.bbox, &detection.bbox) < nms_threshold);
    }

    final_detections
}

pub fn compute_iou(bbox1: &BBox, bbox2: &BBox) -> f32 {
    let x1_min = bbox1.x_center - bbox1.width / 2.0;
    let y1_min = bbox1.y_center - bbox1.height / 2.0;
    let x1_max = bbox1.x_center + bbox1.width / 2.0;
    let y1_max = bbox1.y_center + bbox1.height / 2.0;

    let x2_min = bbox2.x_center - bbox2.width / 2.0;
    let y2_min = bbox2.y_center - bbox2.height / 2.0;
    let x2_max = bbox2.x_center + bbox2.width / 2.0;
    let y2_max = bbox2.y_center + bbox2.height / 2.0;

    let inter_x_min = x1_min.max(x2_min);
    let inter_y_min = y1_min.max(y2_min);
    let inter_x_max = x1_max.min(x2_max);
    let inter_y_max = y1_max.min(y2_max);

    let inter_area = (inter_x_max - inter_x_min).max(0.0) * (inter_y_max - inter_y_min).max(0.0);
    let bbox1_area = (x1_max - x1_min) * (y1_max - y1_min);
    let bbox2_area = (x2_max - x2_min) * (y2_max - y2_min);

    inter_area / (bbox1_area + bbox2_area - inter_area)
}
