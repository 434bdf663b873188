//! The rig model: a table of sensors with the reference sensor at index 0.

use anyhow::{ensure, Result};

use crate::camera::SensorParams;
use crate::math::{Affine3, Iso3, Real};

/// Sensor index within a [`Rig`].
pub type SensorId = usize;

/// The sensor that defines the rig's clock and frame of reference.
pub const REF_SENSOR_ID: SensorId = 0;

/// One sensor of the rig.
///
/// Transforms are stored as the exact 3×4 values the config carried, so
/// config round-trips are lossless; rigid views are derived on demand.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub name: String,
    pub params: SensorParams,
    /// Rigid transform from the reference sensor frame to this sensor's
    /// frame. Identity for the reference sensor. All-zeros in a config
    /// means the rig transforms are unknown.
    pub ref_to_sensor: Affine3,
    /// Transform from this sensor's depth-cloud coordinates to its image
    /// camera frame. May carry a uniform scale; near identity in practice.
    pub depth_to_image: Affine3,
    /// Offset of this sensor's clock relative to the reference clock, in
    /// seconds. Zero for the reference sensor.
    pub timestamp_offset: Real,
}

impl Sensor {
    /// The extrinsic as a rigid transform. An all-zeros (unknown)
    /// extrinsic reads as the identity; the caller is expected to derive a
    /// real value before relying on it.
    pub fn ref_to_sensor_iso(&self) -> Iso3 {
        if self.ref_to_sensor.is_zero() {
            return Iso3::identity();
        }
        self.ref_to_sensor.to_iso()
    }
}

/// The in-memory sensor table.
///
/// Invariants, enforced at construction and preserved by the mutators the
/// pass controller uses: sensor 0 is the reference, its extrinsic is the
/// identity, and its timestamp offset is zero.
#[derive(Debug, Clone)]
pub struct Rig {
    sensors: Vec<Sensor>,
    /// Whether the config carried usable ref-to-sensor transforms. When
    /// false, initial camera poses must come from the image list instead.
    have_rig_transforms: bool,
}

impl Rig {
    pub fn new(sensors: Vec<Sensor>, have_rig_transforms: bool) -> Result<Self> {
        ensure!(!sensors.is_empty(), "a rig needs at least one sensor");
        let rig = Self {
            sensors,
            have_rig_transforms,
        };
        rig.validate()?;
        Ok(rig)
    }

    fn validate(&self) -> Result<()> {
        let reference = &self.sensors[REF_SENSOR_ID];
        ensure!(
            reference.timestamp_offset == 0.0,
            "the reference sensor timestamp offset must be 0, got {}",
            reference.timestamp_offset
        );
        if self.have_rig_transforms {
            ensure!(
                reference.ref_to_sensor == Affine3::identity(),
                "the transform from the reference sensor to itself must be the identity"
            );
        }
        Ok(())
    }

    pub fn num_sensors(&self) -> usize {
        self.sensors.len()
    }

    pub fn have_rig_transforms(&self) -> bool {
        self.have_rig_transforms
    }

    pub fn sensor(&self, s: SensorId) -> &Sensor {
        &self.sensors[s]
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    pub fn intrinsics(&self, s: SensorId) -> &SensorParams {
        &self.sensors[s].params
    }

    /// The extrinsic as a rigid transform.
    pub fn extrinsic(&self, s: SensorId) -> Iso3 {
        self.sensors[s].ref_to_sensor_iso()
    }

    pub fn depth_to_image(&self, s: SensorId) -> &Affine3 {
        &self.sensors[s].depth_to_image
    }

    pub fn offset(&self, s: SensorId) -> Real {
        self.sensors[s].timestamp_offset
    }

    /// Look up a sensor index by name.
    pub fn sensor_id(&self, name: &str) -> Option<SensorId> {
        self.sensors.iter().position(|s| s.name == name)
    }

    /// Replace a sensor's intrinsics. Used by the pass controller after each
    /// solve.
    pub fn set_intrinsics(&mut self, s: SensorId, params: SensorParams) {
        self.sensors[s].params = params;
    }

    /// Replace a sensor's extrinsic. The reference sensor's extrinsic is
    /// pinned to the identity. Marks the rig transforms as known.
    pub fn set_extrinsic(&mut self, s: SensorId, t: Iso3) {
        if s != REF_SENSOR_ID {
            self.sensors[s].ref_to_sensor = Affine3::from_iso(&t);
        }
        self.have_rig_transforms = true;
    }

    pub fn set_depth_to_image(&mut self, s: SensorId, t: Affine3) {
        self.sensors[s].depth_to_image = t;
    }

    /// Replace a sensor's timestamp offset. The reference sensor's offset is
    /// pinned to zero.
    pub fn set_offset(&mut self, s: SensorId, offset: Real) {
        if s == REF_SENSOR_ID {
            return;
        }
        self.sensors[s].timestamp_offset = offset;
    }
}
