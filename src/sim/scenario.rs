use anyhow::{anyhow, Result};
use nalgebra::{Point3, Quaternion, UnitQuaternion};
use serde_json::{json, Value};
use tracing::{debug, span, trace, Level};

use crate::config::{ScenarioConfig, VehicleConfig};

/// Spawn position and orientation of a vehicle in map coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnPose {
    pub position: Point3<f32>,
    pub orientation: UnitQuaternion<f32>,
}

impl SpawnPose {
    /// Builds a pose from a raw `(x, y, z, w)` quaternion, normalizing it
    /// on ingest. A zero-norm quaternion is rejected.
    pub fn from_quat(position: [f32; 3], quat: [f32; 4]) -> Result<Self> {
        let raw = Quaternion::new(quat[3], quat[0], quat[1], quat[2]);
        if raw.norm() == 0.0 {
            return Err(anyhow!("Spawn rotation quaternion has zero norm"));
        }

        Ok(Self {
            position: Point3::from(position),
            orientation: UnitQuaternion::from_quaternion(raw),
        })
    }

    /// Builds a pose from roll, pitch and yaw angles in degrees.
    pub fn from_euler_deg(position: [f32; 3], roll: f32, pitch: f32, yaw: f32) -> Self {
        Self {
            position: Point3::from(position),
            orientation: UnitQuaternion::from_euler_angles(
                roll.to_radians(),
                pitch.to_radians(),
                yaw.to_radians(),
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Vehicle {
    pub id: String,
    pub model: String,
    pub license: String,
    pub pose: SpawnPose,
}

impl TryFrom<&VehicleConfig> for Vehicle {
    type Error = anyhow::Error;

    fn try_from(value: &VehicleConfig) -> std::result::Result<Self, Self::Error> {
        let pose = match (value.rot_quat, value.rot_euler_deg) {
            (Some(quat), None) => SpawnPose::from_quat(value.pos, quat)?,
            (None, Some([roll, pitch, yaw])) => {
                SpawnPose::from_euler_deg(value.pos, roll, pitch, yaw)
            }
            (None, None) => SpawnPose::from_euler_deg(value.pos, 0.0, 0.0, 0.0),
            (Some(_), Some(_)) => {
                return Err(anyhow!("Vehicle rotation given as both quaternion and Euler"))
            }
        };

        Ok(Self {
            id: value.id.clone(),
            model: value.model.clone(),
            license: value.license.clone(),
            pose,
        })
    }
}

/// Declarative description of a map, a scenario name and the vehicles to
/// spawn, materialized into the simulator's expected JSON form by
/// [`Scenario::make`].
#[derive(Debug, Clone)]
pub struct Scenario {
    pub map: String,
    pub name: String,
    vehicles: Vec<Vehicle>,
}

impl Scenario {
    pub fn new(map: &str, name: &str) -> Self {
        Self {
            map: map.to_string(),
            name: name.to_string(),
            vehicles: Vec::new(),
        }
    }

    pub fn add_vehicle(&mut self, vehicle: Vehicle) {
        trace!("Adding vehicle {} to scenario {}", vehicle.id, self.name);
        self.vehicles.push(vehicle);
    }

    #[inline]
    pub fn vehicles(&self) -> &[Vehicle] {
        &self.vehicles
    }

    /// Materializes the scenario description. A scenario without vehicles
    /// is rejected before any network traffic.
    pub fn make(&self) -> Result<Value> {
        let span = span!(Level::TRACE, "Scenario::make");
        let _enter = span.enter();

        if self.vehicles.is_empty() {
            return Err(anyhow!("Scenario {} has no vehicles", self.name));
        }

        let vehicles: Vec<Value> = self
            .vehicles
            .iter()
            .map(|vehicle| {
                let position = &vehicle.pose.position;
                let quat = vehicle.pose.orientation.quaternion();
                json!({
                    "id": vehicle.id,
                    "model": vehicle.model,
                    "license": vehicle.license,
                    "pos": [position.x, position.y, position.z],
                    "rot_quat": [quat.i, quat.j, quat.k, quat.w],
                })
            })
            .collect();

        let description = json!({
            "map": self.map,
            "name": self.name,
            "vehicles": vehicles,
        });

        debug!("Materialized scenario: {description}");
        Ok(description)
    }

    pub fn from_config(scenario: &ScenarioConfig, vehicle: &VehicleConfig) -> Result<Self> {
        let mut result = Self::new(&scenario.map, &scenario.name);
        result.add_vehicle(Vehicle::try_from(vehicle)?);
        Ok(result)
    }
}
