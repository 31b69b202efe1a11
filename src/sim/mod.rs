pub mod protocol;
pub mod scenario;
pub mod sensor;

use std::net::TcpStream;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use serde_json::json;
use tracing::{debug, info, span, trace, Level};

use crate::config::SimulatorConfig;
use protocol::{expect_ok, read_blob, read_message, write_message, PROTOCOL_VERSION};
use scenario::Scenario;
use sensor::{decode_frame, Camera, FrameHeader};

/// Autonomy setting applied to a spawned vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiMode {
    Traffic,
    Manual,
    Disabled,
}

impl AiMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiMode::Traffic => "traffic",
            AiMode::Manual => "manual",
            AiMode::Disabled => "disabled",
        }
    }
}

/// Blocking client for the simulator's remote API. Every operation is a
/// single synchronous request/response exchange over one TCP connection.
pub struct SimClient {
    stream: TcpStream,
}

impl SimClient {
    /// Connects to the simulator and completes the hello handshake. No
    /// other command is valid before this returns.
    pub fn connect(config: &SimulatorConfig) -> Result<Self> {
        let span = span!(Level::TRACE, "SimClient::connect");
        let _enter = span.enter();

        let address = format!("{}:{}", config.host, config.port);
        info!("Connecting to simulator at {address}...");
        let stream = TcpStream::connect(&address)
            .with_context(|| format!("Failed to connect to simulator at {address}"))?;

        let mut client = Self { stream };

        let mut hello = json!({
            "cmd": "hello",
            "protocol_version": PROTOCOL_VERSION,
        });
        if let Some(home) = &config.home {
            hello["home"] = json!(home);
        }
        if let Some(user) = &config.user {
            hello["user"] = json!(user);
        }

        trace!("Sending hello handshake");
        let response = client.request(hello)?;

        let version = response
            .get("protocol_version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| anyhow!("Hello response is missing protocol_version"))?;
        if version != PROTOCOL_VERSION {
            return Err(anyhow!(
                "Simulator speaks protocol version {version}, expected {PROTOCOL_VERSION}"
            ));
        }

        info!("Connected to simulator at {address}");
        Ok(client)
    }

    fn request(&mut self, payload: serde_json::Value) -> Result<serde_json::Value> {
        let command = payload
            .get("cmd")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        write_message(&mut self.stream, &payload)
            .with_context(|| format!("Failed to send command {command}"))?;
        let response = read_message(&mut self.stream)
            .with_context(|| format!("Failed to read response to command {command}"))?;
        expect_ok(&response, &command)?;

        Ok(response)
    }

    /// Materializes and loads the scenario into the simulator.
    pub fn load_scenario(&mut self, scenario: &Scenario) -> Result<()> {
        let span = span!(Level::TRACE, "SimClient::load_scenario");
        let _enter = span.enter();

        let description = scenario.make().context("Failed to materialize scenario")?;
        let mut request = json!({"cmd": "load_scenario"});
        request["scenario"] = description;

        info!("Loading scenario {} on map {}...", scenario.name, scenario.map);
        self.request(request)?;

        debug!("Scenario {} loaded", scenario.name);
        Ok(())
    }

    pub fn start_scenario(&mut self) -> Result<()> {
        let span = span!(Level::TRACE, "SimClient::start_scenario");
        let _enter = span.enter();

        info!("Starting scenario...");
        self.request(json!({"cmd": "start_scenario"}))?;

        debug!("Scenario started");
        Ok(())
    }

    pub fn set_ai_mode(&mut self, vehicle_id: &str, mode: AiMode) -> Result<()> {
        let span = span!(Level::TRACE, "SimClient::set_ai_mode");
        let _enter = span.enter();

        info!("Setting AI mode of {vehicle_id} to {}", mode.as_str());
        self.request(json!({
            "cmd": "set_ai_mode",
            "vehicle": vehicle_id,
            "mode": mode.as_str(),
        }))?;

        Ok(())
    }

    pub fn attach_camera(&mut self, vehicle_id: &str, camera: &Camera) -> Result<()> {
        let span = span!(Level::TRACE, "SimClient::attach_camera");
        let _enter = span.enter();

        info!(
            "Attaching camera {} ({}x{}) to {vehicle_id}",
            camera.name, camera.resolution.0, camera.resolution.1
        );
        self.request(camera.to_attach_request(vehicle_id))?;

        Ok(())
    }

    /// Polls the current buffer of an attached camera. Blocks until the
    /// header and the full pixel blob have been received.
    pub fn poll_camera(&mut self, vehicle_id: &str, camera_name: &str) -> Result<RgbImage> {
        let span = span!(Level::TRACE, "SimClient::poll_camera");
        let _enter = span.enter();

        trace!("Polling camera {camera_name} of {vehicle_id}");
        let response = self.request(json!({
            "cmd": "poll_camera",
            "vehicle": vehicle_id,
            "camera": camera_name,
        }))?;

        let header: FrameHeader = serde_json::from_value(response)
            .context("Failed to decode camera frame header")?;
        let blob = read_blob(&mut self.stream, header.byte_len())
            .context("Failed to read camera frame blob")?;

        decode_frame(&header, blob)
    }

    /// Sends a best-effort goodbye and closes the connection. The goodbye
    /// failing does not keep the socket open.
    pub fn disconnect(mut self) -> Result<()> {
        let span = span!(Level::TRACE, "SimClient::disconnect");
        let _enter = span.enter();

        info!("Disconnecting from simulator...");
        let result = write_message(&mut self.stream, &json!({"cmd": "disconnect"}));
        self.stream
            .shutdown(std::net::Shutdown::Both)
            .context("Failed to shut down simulator connection")?;

        result.context("Failed to send disconnect")?;
        debug!("Disconnected from simulator");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    use super::scenario::{SpawnPose, Vehicle};
    use super::*;
    use serde_json::Value;

    /// Minimal scripted simulator: accepts one connection and answers each
    /// command the way the real process would.
    fn spawn_fake_simulator(frame: Option<(u32, u32, Vec<u8>)>) -> (SimulatorConfig, JoinHandle<Vec<Value>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind listener");
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("Failed to accept connection");
            let mut received = Vec::new();

            loop {
                let Ok(message) = read_message(&mut stream) else {
                    break;
                };
                let command = message["cmd"].as_str().unwrap_or("").to_string();
                received.push(message);

                match command.as_str() {
                    "hello" => {
                        let response = json!({
                            "result": "ok",
                            "protocol_version": PROTOCOL_VERSION,
                        });
                        write_message(&mut stream, &response).unwrap();
                    }
                    "poll_camera" => {
                        let (width, height, pixels) =
                            frame.clone().expect("poll_camera not scripted");
                        let response = json!({
                            "result": "ok",
                            "width": width,
                            "height": height,
                            "format": "rgb8",
                        });
                        write_message(&mut stream, &response).unwrap();
                        use std::io::Write;
                        stream.write_all(&pixels).unwrap();
                    }
                    "load_scenario" if received.len() > 2 => {
                        // Scripted failure for the error-surfacing test.
                        let response = json!({
                            "result": "error",
                            "message": "unknown map",
                        });
                        write_message(&mut stream, &response).unwrap();
                    }
                    "disconnect" => break,
                    _ => {
                        write_message(&mut stream, &json!({"result": "ok"})).unwrap();
                    }
                }
            }

            received
        });

        let config = SimulatorConfig {
            host: "127.0.0.1".to_string(),
            port,
            home: None,
            user: None,
        };
        (config, handle)
    }

    fn test_scenario() -> Scenario {
        let mut scenario = Scenario::new("west_coast_usa", "example");
        scenario.add_vehicle(Vehicle {
            id: "ego_vehicle".to_string(),
            model: "etk800".to_string(),
            license: "RUST".to_string(),
            pose: SpawnPose::from_euler_deg([-717.0, 101.0, 118.0], 0.0, 0.0, 45.0),
        });
        scenario
    }

    #[test]
    fn test_connect_and_drive_scenario() -> Result<()> {
        let (config, handle) = spawn_fake_simulator(None);

        let mut client = SimClient::connect(&config)?;
        client.load_scenario(&test_scenario())?;
        client.start_scenario()?;
        client.set_ai_mode("ego_vehicle", AiMode::Traffic)?;
        client.disconnect()?;

        let received = handle.join().expect("Fake simulator panicked");
        let commands: Vec<_> = received
            .iter()
            .map(|m| m["cmd"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            commands,
            vec!["hello", "load_scenario", "start_scenario", "set_ai_mode", "disconnect"]
        );
        assert_eq!(received[1]["scenario"]["map"], "west_coast_usa");
        assert_eq!(received[3]["mode"], "traffic");

        Ok(())
    }

    #[test]
    fn test_poll_camera_decodes_frame() -> Result<()> {
        let pixels = vec![
            255, 0, 0, 0, 255, 0, //
            0, 0, 255, 9, 9, 9,
        ];
        let (config, handle) = spawn_fake_simulator(Some((2, 2, pixels)));

        let mut client = SimClient::connect(&config)?;
        let image = client.poll_camera("ego_vehicle", "front_cam")?;
        client.disconnect()?;
        handle.join().expect("Fake simulator panicked");

        assert_eq!(image.dimensions(), (2, 2));
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(image.get_pixel(1, 1).0, [9, 9, 9]);

        Ok(())
    }

    #[test]
    fn test_error_result_surfaces_message() -> Result<()> {
        let (config, handle) = spawn_fake_simulator(None);

        let mut client = SimClient::connect(&config)?;
        client.load_scenario(&test_scenario())?;

        let err = client
            .load_scenario(&test_scenario())
            .expect_err("Second load is scripted to fail");
        assert!(err.to_string().contains("unknown map"));

        client.disconnect()?;
        handle.join().expect("Fake simulator panicked");

        Ok(())
    }
}
