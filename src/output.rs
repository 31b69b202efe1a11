use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, span, trace, Level};

use crate::perception::DetectedObject;

/// One detected object as it appears in the persisted log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedObject {
    pub label: String,
    /// `[x1, y1, x2, y2]` with `x1 <= x2` and `y1 <= y2`.
    pub bbox: [i32; 4],
    pub confidence: f32,
}

impl From<&DetectedObject> for LoggedObject {
    fn from(value: &DetectedObject) -> Self {
        Self {
            label: value.class.as_str().to_string(),
            bbox: [value.bbox.x1, value.bbox.y1, value.bbox.x2, value.bbox.y2],
            confidence: value.confidence.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame_id: u64,
    pub objects: Vec<LoggedObject>,
}

/// Append-only per-frame detection log, written once at the end of a run
/// as a single JSON document. Frame ids start at 0 and increase by exactly
/// one per appended frame.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct DetectionLog {
    records: Vec<FrameRecord>,
}

impl DetectionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the detections of the next polled frame and returns the
    /// frame id it was assigned.
    pub fn append(&mut self, objects: &[DetectedObject]) -> u64 {
        let frame_id = self.records.len() as u64;
        trace!("Appending frame {frame_id} with {} objects", objects.len());

        self.records.push(FrameRecord {
            frame_id,
            objects: objects.iter().map(LoggedObject::from).collect(),
        });

        frame_id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn records(&self) -> &[FrameRecord] {
        &self.records
    }

    /// Writes the log to disk. The document is serialized to a sibling
    /// temp file first and renamed into place, so the log on disk is
    /// never a partial document.
    pub fn save<P>(&self, path: P) -> Result<()>
    where
        P: AsRef<Path> + std::fmt::Debug,
    {
        let span = span!(Level::TRACE, "DetectionLog::save");
        let _enter = span.enter();

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    error!("Failed to create log directory {:?}: {e}", parent);
                    e
                })?;
            }
        }

        let temp_path = path.with_extension("json.tmp");
        let file = File::create(&temp_path).map_err(|e| {
            error!("Failed to create {:?}: {e}", temp_path);
            e
        })?;

        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self).map_err(|e| {
            error!("Failed to serialize detection log: {e}");
            e
        })?;
        writer.flush().map_err(|e| {
            error!("Failed to flush detection log: {e}");
            e
        })?;

        fs::rename(&temp_path, path).map_err(|e| {
            error!("Failed to move {:?} into place: {e}", temp_path);
            e
        })?;

        info!("Wrote {} frame records to {:?}", self.records.len(), path);
        Ok(())
    }

    /// Reads a log back and validates its invariants: contiguous frame
    /// ids from 0, ordered bboxes and confidences within `[0, 1]`.
    pub fn load<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path> + std::fmt::Debug,
    {
        let span = span!(Level::TRACE, "DetectionLog::load");
        let _enter = span.enter();

        debug!("Reading detection log from {:?}", path);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read detection log from {path:?}"))?;
        let log: Self =
            serde_json::from_str(&content).context("Failed to parse detection log")?;

        for (index, record) in log.records.iter().enumerate() {
            if record.frame_id != index as u64 {
                return Err(anyhow!(
                    "Frame id {} at position {index} breaks the contiguous sequence",
                    record.frame_id
                ));
            }
            for object in &record.objects {
                let [x1, y1, x2, y2] = object.bbox;
                if x1 > x2 || y1 > y2 {
                    return Err(anyhow!(
                        "Frame {} has an unordered bbox {:?}",
                        record.frame_id,
                        object.bbox
                    ));
                }
                if !(0.0..=1.0).contains(&object.confidence) {
                    return Err(anyhow!(
                        "Frame {} has confidence {} outside [0, 1]",
                        record.frame_id,
                        object.confidence
                    ));
                }
            }
        }

        Ok(log)
    }
}
