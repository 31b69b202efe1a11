use anyhow::{anyhow, Result};
use image::RgbImage;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, span, trace, Level};

use crate::config::CameraConfig;

/// Description of a camera sensor mounted on a vehicle.
#[derive(Debug, Clone)]
pub struct Camera {
    pub name: String,
    pub position: [f32; 3],
    pub direction: [f32; 3],
    pub fov_deg: f32,
    pub resolution: (u32, u32),
}

impl Camera {
    pub fn to_attach_request(&self, vehicle_id: &str) -> Value {
        json!({
            "cmd": "attach_camera",
            "vehicle": vehicle_id,
            "name": self.name,
            "pos": self.position,
            "dir": self.direction,
            "fov_deg": self.fov_deg,
            "resolution": [self.resolution.0, self.resolution.1],
        })
    }
}

impl From<&CameraConfig> for Camera {
    fn from(value: &CameraConfig) -> Self {
        Self {
            name: value.name.clone(),
            position: value.pos,
            direction: value.dir,
            fov_deg: value.fov_deg,
            resolution: (value.resolution[0], value.resolution[1]),
        }
    }
}

/// Header of a camera poll response; the raw pixel blob follows on the wire.
#[derive(Debug, Deserialize)]
pub struct FrameHeader {
    pub width: u32,
    pub height: u32,
    pub format: String,
}

impl FrameHeader {
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Turns a poll response header and its raw blob into an image. Only
/// tightly packed `rgb8` payloads are accepted.
pub fn decode_frame(header: &FrameHeader, data: Vec<u8>) -> Result<RgbImage> {
    let span = span!(Level::TRACE, "sensor::decode_frame");
    let _enter = span.enter();

    if header.format != "rgb8" {
        error!("Unsupported frame format: {}", header.format);
        return Err(anyhow!("Unsupported frame format: {}", header.format));
    }
    if data.len() != header.byte_len() {
        error!(
            "Frame blob of {} bytes does not match {}x{} rgb8",
            data.len(),
            header.width,
            header.height
        );
        return Err(anyhow!(
            "Frame blob of {} bytes does not match {}x{} rgb8",
            data.len(),
            header.width,
            header.height
        ));
    }

    trace!("Decoding {}x{} frame", header.width, header.height);
    RgbImage::from_raw(header.width, header.height, data)
        .ok_or_else(|| anyhow!("Failed to build image from frame blob"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_request_shape() {
        let camera = Camera {
            name: "front_cam".to_string(),
            position: [0.0, -2.2, 1.2],
            direction: [0.0, -1.0, 0.0],
            fov_deg: 70.0,
            resolution: (1280, 720),
        };

        let request = camera.to_attach_request("ego_vehicle");

        assert_eq!(request["cmd"], "attach_camera");
        assert_eq!(request["vehicle"], "ego_vehicle");
        assert_eq!(request["name"], "front_cam");
        assert_eq!(request["resolution"][0], 1280);
        assert_eq!(request["resolution"][1], 720);
    }

    #[test]
    fn test_decode_frame() -> Result<()> {
        let header = FrameHeader {
            width: 2,
            height: 2,
            format: "rgb8".to_string(),
        };
        let data = vec![
            255, 0, 0, 0, 255, 0, //
            0, 0, 255, 10, 20, 30,
        ];

        let image = decode_frame(&header, data)?;

        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(image.get_pixel(1, 1).0, [10, 20, 30]);

        Ok(())
    }

    #[test]
    fn test_decode_frame_rejects_wrong_length() {
        let header = FrameHeader {
            width: 2,
            height: 2,
            format: "rgb8".to_string(),
        };

        assert!(decode_frame(&header, vec![0u8; 11]).is_err());
    }

    #[test]
    fn test_decode_frame_rejects_unknown_format() {
        let header = FrameHeader {
            width: 1,
            height: 1,
            format: "bgr8".to_string(),
        };

        assert!(decode_frame(&header, vec![0u8; 3]).is_err());
    }
}
