//! Body state estimation from IMU and wheel telemetry.
//!
//! Pitch comes from the IMU orientation quaternion (or a direct pitch
//! reading), ground velocity from the average of both wheel rates, and
//! ground position from integrating that velocity over the cycle period.

use nalgebra::{Quaternion, UnitQuaternion};
use serde::Serialize;

use crate::config::EstimatorConfig;
use crate::error::InvalidObservation;
use crate::frame::{Observation, SignalKey};

/// Compact estimate consumed by the controller and the optimizer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BodyState {
    /// Radians, zero upright, positive when leaning toward positive ground velocity.
    pub pitch: f64,
    /// rad/s
    pub pitch_rate: f64,
    /// m/s
    pub ground_velocity: f64,
    /// m
    pub ground_position: f64,
}

pub fn orientation_key() -> SignalKey {
    SignalKey::new("imu", "orientation")
}

pub fn pitch_key() -> SignalKey {
    SignalKey::new("imu", "pitch")
}

pub fn angular_velocity_key() -> SignalKey {
    SignalKey::new("imu", "angular_velocity")
}

pub fn wheel_velocity_key(side: &str) -> SignalKey {
    SignalKey::new(format!("{side}_wheel"), "velocity")
}

pub struct Estimator {
    wheel_radius: f64,
    /// -1.0 when the right wheel turns backwards for forward motion.
    right_sign: f64,
    pitch_bias: f64,
    dt: f64,
}

impl Estimator {
    pub fn new(config: &EstimatorConfig, dt: f64) -> Self {
        Self {
            wheel_radius: config.wheel_radius,
            right_sign: if config.right_wheel_mirrored { -1.0 } else { 1.0 },
            pitch_bias: config.pitch_bias,
            dt,
        }
    }

    pub fn wheel_radius(&self) -> f64 {
        self.wheel_radius
    }

    pub fn right_sign(&self) -> f64 {
        self.right_sign
    }

    /// Estimate the body state for this cycle.
    ///
    /// `previous` is the estimate of the last cycle, if any. Without it the
    /// ground position starts at zero and a missing angular rate reads zero.
    pub fn estimate(
        &self,
        observation: &Observation,
        previous: Option<&BodyState>,
    ) -> Result<BodyState, InvalidObservation> {
        let pitch = self.pitch(observation)? + self.pitch_bias;

        let pitch_rate = match observation.get(&angular_velocity_key()) {
            Some(rates) => {
                let key = angular_velocity_key();
                let rate = *rates
                    .get(1)
                    .ok_or_else(|| InvalidObservation::malformed(&key, "expected [x, y, z]"))?;
                check_finite(&key, rate)?
            }
            None => previous.map_or(0.0, |prev| (pitch - prev.pitch) / self.dt),
        };

        let left = wheel_rate(observation, "left")?;
        let right = wheel_rate(observation, "right")?;
        let ground_velocity = self.wheel_radius * (left + self.right_sign * right) / 2.0;

        let ground_position =
            previous.map_or(0.0, |prev| prev.ground_position) + ground_velocity * self.dt;

        Ok(BodyState {
            pitch,
            pitch_rate,
            ground_velocity,
            ground_position,
        })
    }

    fn pitch(&self, observation: &Observation) -> Result<f64, InvalidObservation> {
        let key = orientation_key();
        if let Some(q) = observation.get(&key) {
            let [w, x, y, z] = <[f64; 4]>::try_from(q)
                .map_err(|_| InvalidObservation::malformed(&key, "expected [w, x, y, z]"))?;
            let quaternion = Quaternion::new(w, x, y, z);
            let norm = quaternion.norm();
            if !norm.is_finite() || norm < 1e-9 {
                return Err(InvalidObservation::malformed(
                    &key,
                    format!("degenerate quaternion (norm {norm})"),
                ));
            }
            let (_roll, pitch, _yaw) = UnitQuaternion::from_quaternion(quaternion).euler_angles();
            return Ok(pitch);
        }

        let key = pitch_key();
        match observation.scalar(&key) {
            Some(pitch) => check_finite(&key, pitch),
            None => Err(InvalidObservation::missing(&orientation_key())),
        }
    }
}

fn wheel_rate(observation: &Observation, side: &str) -> Result<f64, InvalidObservation> {
    let key = wheel_velocity_key(side);
    let rate = observation
        .scalar(&key)
        .ok_or_else(|| InvalidObservation::missing(&key))?;
    check_finite(&key, rate)
}

fn check_finite(key: &SignalKey, value: f64) -> Result<f64, InvalidObservation> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(InvalidObservation::malformed(key, format!("non-finite value {value}")))
    }
}
