use std::error::Error;
use std::fs;

use tempfile::tempdir;

use simperception::output::DetectionLog;
use simperception::perception::{DetectedObject, ObjectClass, PixelBox};

fn detected(class: ObjectClass, x1: i32, y1: i32, x2: i32, y2: i32, conf: f32) -> DetectedObject {
    DetectedObject {
        class,
        bbox: PixelBox { x1, y1, x2, y2 },
        confidence: conf,
    }
}

#[test]
fn test_save_and_load_round_trip() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = dir.path().join("detections.json");

    let mut log = DetectionLog::new();
    log.append(&[
        detected(ObjectClass::Car, 10, 20, 110, 90, 0.92),
        detected(ObjectClass::Person, 300, 40, 340, 160, 0.55),
    ]);
    log.append(&[]);
    log.append(&[detected(ObjectClass::TrafficLight, 600, 5, 620, 60, 0.71)]);

    log.save(&path)?;
    let loaded = DetectionLog::load(&path)?;

    assert_eq!(loaded, log);
    assert_eq!(loaded.len(), 3);
    assert_eq!(loaded.records()[1].objects.len(), 0);

    Ok(())
}

#[test]
fn test_saved_document_is_plain_json_array() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = dir.path().join("detections.json");

    let mut log = DetectionLog::new();
    log.append(&[detected(ObjectClass::Bus, 0, 0, 50, 50, 0.8)]);
    log.save(&path)?;

    let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
    let records = value.as_array().expect("log should be a JSON array");

    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["frame_id"], 0);
    assert_eq!(records[0]["objects"][0]["label"], "bus");
    assert_eq!(records[0]["objects"][0]["bbox"][2], 50);

    Ok(())
}

#[test]
fn test_reserialized_document_preserves_records() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let first_path = dir.path().join("first.json");
    let second_path = dir.path().join("second.json");

    let mut log = DetectionLog::new();
    for i in 0..10 {
        log.append(&[detected(ObjectClass::Car, i, i, i + 40, i + 30, 0.5)]);
    }

    log.save(&first_path)?;
    DetectionLog::load(&first_path)?.save(&second_path)?;
    let reloaded = DetectionLog::load(&second_path)?;

    assert_eq!(reloaded, log);

    Ok(())
}

// Frames appended before an interruption survive; the aborted in-flight
// frame never produces a partial record.
#[test]
fn test_interrupted_run_keeps_appended_frames() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = dir.path().join("detections.json");

    let mut log = DetectionLog::new();
    for _ in 0..7 {
        log.append(&[detected(ObjectClass::Truck, 5, 5, 100, 80, 0.6)]);
    }

    // The eighth poll fails mid-flight; nothing was appended for it and
    // the epilogue saves what exists.
    log.save(&path)?;
    let loaded = DetectionLog::load(&path)?;

    assert_eq!(loaded.len(), 7);
    let ids: Vec<_> = loaded.records().iter().map(|r| r.frame_id).collect();
    assert_eq!(ids, (0..7).collect::<Vec<u64>>());

    Ok(())
}

#[test]
fn test_save_replaces_previous_log_atomically() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = dir.path().join("detections.json");

    let mut first = DetectionLog::new();
    first.append(&[]);
    first.save(&path)?;

    let mut second = DetectionLog::new();
    second.append(&[detected(ObjectClass::Bicycle, 1, 2, 3, 4, 0.9)]);
    second.append(&[]);
    second.save(&path)?;

    let loaded = DetectionLog::load(&path)?;
    assert_eq!(loaded.len(), 2);
    assert!(!dir.path().join("detections.json.tmp").exists());

    Ok(())
}

#[test]
fn test_load_nonexistent_path_fails() {
    assert!(DetectionLog::load("nonexistent_detections.json").is_err());
}

#[test]
fn test_load_rejects_truncated_document() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let path = dir.path().join("detections.json");

    fs::write(&path, r#"[{"frame_id": 0, "objects": ["#)?;

    assert!(DetectionLog::load(&path).is_err());

    Ok(())
}
