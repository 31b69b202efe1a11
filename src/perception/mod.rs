pub mod detect;
pub mod segment;
pub mod vis;

use std::fmt::{self, Display};

use anyhow::{anyhow, Result};
use image::{
    imageops::{resize, FilterType},
    RgbImage,
};
use ndarray::Array4;
use tracing::{debug, span, trace, warn, Level};

use crate::config::PerceptionConfig;
use detect::{BBox, Detector, Execution};
use segment::{SegmentationMap, Segmenter};

/// Fixed label set of the object detector. A class id outside this set is
/// never logged.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum ObjectClass {
    Car,
    Truck,
    Bus,
    Motorcycle,
    Bicycle,
    Person,
    TrafficLight,
    TrafficSign,
}

impl ObjectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectClass::Car => "car",
            ObjectClass::Truck => "truck",
            ObjectClass::Bus => "bus",
            ObjectClass::Motorcycle => "motorcycle",
            ObjectClass::Bicycle => "bicycle",
            ObjectClass::Person => "person",
            ObjectClass::TrafficLight => "traffic_light",
            ObjectClass::TrafficSign => "traffic_sign",
        }
    }

    pub fn all() -> &'static [ObjectClass] {
        &[
            ObjectClass::Car,
            ObjectClass::Truck,
            ObjectClass::Bus,
            ObjectClass::Motorcycle,
            ObjectClass::Bicycle,
            ObjectClass::Person,
            ObjectClass::TrafficLight,
            ObjectClass::TrafficSign,
        ]
    }
}

impl Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<u32> for ObjectClass {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjectClass::Car),
            1 => Ok(ObjectClass::Truck),
            2 => Ok(ObjectClass::Bus),
            3 => Ok(ObjectClass::Motorcycle),
            4 => Ok(ObjectClass::Bicycle),
            5 => Ok(ObjectClass::Person),
            6 => Ok(ObjectClass::TrafficLight),
            7 => Ok(ObjectClass::TrafficSign),
            _ => Err(anyhow!("Invalid value for ObjectClass")),
        }
    }
}

/// Label set of the segmentation model, indexed by per-pixel class id.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum SurfaceClass {
    Road,
    Sidewalk,
    Building,
    Vegetation,
    Sky,
    Vehicle,
    Person,
    Background,
}

impl SurfaceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurfaceClass::Road => "road",
            SurfaceClass::Sidewalk => "sidewalk",
            SurfaceClass::Building => "building",
            SurfaceClass::Vegetation => "vegetation",
            SurfaceClass::Sky => "sky",
            SurfaceClass::Vehicle => "vehicle",
            SurfaceClass::Person => "person",
            SurfaceClass::Background => "background",
        }
    }
}

impl TryFrom<u8> for SurfaceClass {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(SurfaceClass::Road),
            1 => Ok(SurfaceClass::Sidewalk),
            2 => Ok(SurfaceClass::Building),
            3 => Ok(SurfaceClass::Vegetation),
            4 => Ok(SurfaceClass::Sky),
            5 => Ok(SurfaceClass::Vehicle),
            6 => Ok(SurfaceClass::Person),
            7 => Ok(SurfaceClass::Background),
            _ => Err(anyhow!("Invalid value for SurfaceClass")),
        }
    }
}

/// Axis-aligned box in integer pixel coordinates with `x1 <= x2` and
/// `y1 <= y2`, clamped to the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl PixelBox {
    pub fn from_bbox(bbox: &BBox, frame_width: u32, frame_height: u32) -> Self {
        let clamp_x = |v: f32| (v.round() as i32).clamp(0, frame_width.saturating_sub(1) as i32);
        let clamp_y = |v: f32| (v.round() as i32).clamp(0, frame_height.saturating_sub(1) as i32);

        let x1 = clamp_x(bbox.x_center - bbox.width / 2.0);
        let y1 = clamp_y(bbox.y_center - bbox.height / 2.0);
        let x2 = clamp_x(bbox.x_center + bbox.width / 2.0);
        let y2 = clamp_y(bbox.y_center + bbox.height / 2.0);

        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        (self.x2 - self.x1) as u32
    }

    #[inline]
    pub fn height(&self) -> u32 {
        (self.y2 - self.y1) as u32
    }
}

#[derive(Debug, Clone)]
pub struct DetectedObject {
    pub class: ObjectClass,
    pub bbox: PixelBox,
    pub confidence: f32,
}

/// Result of running both models over one camera frame.
#[derive(Debug)]
pub struct FramePerception {
    pub objects: Vec<DetectedObject>,
    pub mask: SegmentationMap,
}

/// Bundles the detector and the segmenter behind one per-frame call.
pub struct Perceptor {
    detector: Detector,
    segmenter: Segmenter,
}

impl Perceptor {
    pub fn from_config(config: &PerceptionConfig) -> Result<Self> {
        let span = span!(Level::TRACE, "Perceptor::from_config");
        let _enter = span.enter();

        let execution = Execution::try_from(config.execution.as_str())?;

        let detector = Detector::from_file(
            &config.detector.onnx_path,
            config.detector.conf_thresh,
            config.detector.nms_thresh,
            (config.detector.input_size[0], config.detector.input_size[1]),
            execution,
        )?;
        let segmenter = Segmenter::from_file(
            &config.segmenter.onnx_path,
            (config.segmenter.input_size[0], config.segmenter.input_size[1]),
            execution,
        )?;

        Ok(Self {
            detector,
            segmenter,
        })
    }

    /// Runs both inferences over the frame. Detections with a class id
    /// outside [`ObjectClass`] are dropped with a warning.
    pub fn perceive(&self, frame: &RgbImage) -> Result<FramePerception> {
        let span = span!(Level::TRACE, "Perceptor::perceive");
        let _enter = span.enter();

        let (frame_width, frame_height) = frame.dimensions();

        trace!("Running object detector...");
        let detections = self.detector.infer(frame)?;
        let objects: Vec<_> = detections
            .into_iter()
            .filter_map(|detection| match ObjectClass::try_from(detection.class_id) {
                Ok(class) => Some(DetectedObject {
                    class,
                    bbox: PixelBox::from_bbox(&detection.bbox, frame_width, frame_height),
                    confidence: detection.confidence,
                }),
                Err(_) => {
                    warn!(
                        "Dropping detection with unknown class id {}",
                        detection.class_id
                    );
                    None
                }
            })
            .collect();
        debug!("Detector produced {} objects", objects.len());

        trace!("Running segmenter...");
        let mask = self.segmenter.infer(frame)?;

        Ok(FramePerception { objects, mask })
    }
}

/// Resizes and normalizes an RGB frame into the NCHW `[0, 1]` tensor both
/// models consume.
pub(crate) fn preprocess_rgb(image: &RgbImage, input_size: (u32, u32)) -> Array4<f32> {
    let (width, height) = input_size;
    let resized = resize(image, width, height, FilterType::Nearest);

    let mut input = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        input[[0, 0, y as usize, x as usize]] = pixel[0] as f32 / 255.0;
        input[[0, 1, y as usize, x as usize]] = pixel[1] as f32 / 255.0;
        input[[0, 2, y as usize, x as usize]] = pixel[2] as f32 / 255.0;
    }

    input
}
