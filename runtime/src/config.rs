//! Balancer configuration loader: reads a JSON file with per-robot tuning.
//!
//! Every section has defaults matching an Upkie-sized robot, so a partial
//! file (or no file at all) yields a runnable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::WrapperConfig;

/// Top-level balancer configuration, loaded from JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub cycle: CycleConfig,

    #[serde(default)]
    pub estimator: EstimatorConfig,

    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub limits: ActuatorLimits,

    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Leg geometry. When present, actions carry hip and knee positions.
    #[serde(default)]
    pub legs: Option<LegConfig>,

    /// Transform chain, outermost (closest to the spine) first.
    #[serde(default)]
    pub pipeline: Vec<WrapperConfig>,
}

/// Loop timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Control frequency in Hz.
    pub frequency: f64,
    /// Spine fetch timeout, in cycle periods.
    pub timeout_periods: u32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            frequency: 200.0,
            timeout_periods: 20,
        }
    }
}

impl CycleConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frequency)
    }

    pub fn dt(&self) -> f64 {
        1.0 / self.frequency
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.period() * self.timeout_periods
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Wheel radius in meters.
    pub wheel_radius: f64,
    /// Right wheel spins backwards for forward motion (mirrored mount).
    pub right_wheel_mirrored: bool,
    /// Added to the measured pitch, in radians.
    pub pitch_bias: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            wheel_radius: 0.06,
            right_wheel_mirrored: true,
            pitch_bias: 0.0,
        }
    }
}

/// Control law occupying the BALANCING mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlLaw {
    /// PD on pitch, pitch rate and ground velocity.
    #[default]
    DirectFeedback,
    /// Receding-horizon QP on the wheeled pendulum model.
    ModelPredictive,
    /// Model-predictive wheels plus leg center-of-mass coordination.
    WholeBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub law: ControlLaw,
    /// Absolute pitch beyond which the robot is considered fallen (rad).
    pub fall_pitch: f64,
    /// Lateral distance between the wheels (m).
    pub wheel_distance: f64,
    /// Body mass used for the wheel feed-forward torque (kg).
    pub body_mass: f64,
    /// Bound on the ground acceleration commanded by the feedback law (m/s²).
    pub max_acceleration: f64,
    pub gains: FeedbackGains,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            law: ControlLaw::DirectFeedback,
            fall_pitch: 1.0,
            wheel_distance: 0.3,
            body_mass: 5.0,
            max_acceleration: 10.0,
            gains: FeedbackGains::default(),
        }
    }
}

/// Gains of the direct feedback law, mapping errors to ground acceleration.
///
/// Defaults place the closed-loop poles of a 0.4 m pendulum at
/// -2, -3, -6 and -8 rad/s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackGains {
    pub pitch: f64,
    pub pitch_rate: f64,
    pub velocity: f64,
    pub position: f64,
    pub integral: f64,
    /// Bound on the accumulated position error (m·s).
    pub integral_limit: f64,
}

impl Default for FeedbackGains {
    fn default() -> Self {
        Self {
            pitch: 64.1,
            pitch_rate: 12.9,
            velocity: 13.2,
            position: 11.7,
            integral: 0.0,
            integral_limit: 0.5,
        }
    }
}

/// How actuator limits are applied across joint groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ClampPolicy {
    /// Wheel velocity, wheel torque and leg position each use their own limit.
    #[default]
    PerGroup,
    /// One magnitude bound for every action component.
    Shared { limit: f64 },
}

/// Hard actuator limits. Magnitudes, applied symmetrically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorLimits {
    /// Wheel angular velocity (rad/s).
    pub wheel_velocity: f64,
    /// Wheel feed-forward torque (N·m).
    pub wheel_torque: f64,
    /// Hip and knee position (rad).
    pub leg_position: f64,
    /// Hip and knee stiffness and damping multipliers.
    pub leg_gain_scale: f64,
    pub clamp: ClampPolicy,
}

impl Default for ActuatorLimits {
    fn default() -> Self {
        Self {
            wheel_velocity: 30.0,
            wheel_torque: 1.7,
            leg_position: 2.5,
            leg_gain_scale: 3.0,
            clamp: ClampPolicy::PerGroup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Number of prediction steps.
    pub horizon: usize,
    /// Prediction step duration (s).
    pub timestep: f64,
    /// Distance from wheel axle to center of mass (m).
    pub pendulum_length: f64,
    pub gravity: f64,
    /// Diagonal state cost, order `[position, pitch, velocity, pitch_rate]`.
    pub state_weights: [f64; 4],
    /// Multiplier on the state cost of the last horizon step.
    pub terminal_weight: f64,
    /// Cost on ground acceleration magnitude.
    pub control_weight: f64,
    /// Cost on the change of ground acceleration between steps.
    pub rate_weight: f64,
    /// Box bound on ground acceleration (m/s²).
    pub acceleration_limit: f64,
    /// Box bound on predicted pitch (rad).
    pub tilt_limit: f64,
    /// Box bound on predicted ground velocity (m/s).
    pub velocity_limit: f64,
    pub max_iterations: u32,
    /// Wall-clock solver budget per cycle (s).
    pub time_budget: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            horizon: 25,
            timestep: 0.02,
            pendulum_length: 0.4,
            gravity: 9.81,
            state_weights: [1.0, 50.0, 5.0, 1.0],
            terminal_weight: 10.0,
            control_weight: 0.01,
            rate_weight: 0.1,
            acceleration_limit: 10.0,
            tilt_limit: 0.8,
            velocity_limit: 1.5,
            max_iterations: 50,
            time_budget: 0.004,
        }
    }
}

/// Planar two-link leg used by the whole-body law.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegConfig {
    /// Hip to knee (m).
    pub thigh_length: f64,
    /// Knee to wheel axle (m).
    pub shank_length: f64,
    /// Nominal wheel axle depth below the hip (m).
    pub height: f64,
    /// Horizontal wheel offset per radian of pitch (m/rad).
    pub com_gain: f64,
    /// Bound on the horizontal wheel offset (m).
    pub max_shift: f64,
    /// Damping of the least-squares IK step.
    pub damping: f64,
    pub max_iterations: usize,
    /// IK convergence tolerance on the wheel position (m).
    pub tolerance: f64,
    /// Baseline multiplier on hip and knee stiffness and damping. Clamped
    /// to `[0.1, 2.0]`.
    pub gain_scale: f64,
    /// Extra multiplier added at full turning rate.
    pub turning_gain_scale: f64,
    /// Yaw rate magnitude treated as full turning (rad/s).
    pub turning_yaw_rate: f64,
}

impl Default for LegConfig {
    fn default() -> Self {
        Self {
            thigh_length: 0.2,
            shank_length: 0.2,
            height: 0.3,
            com_gain: 0.1,
            max_shift: 0.06,
            damping: 0.05,
            max_iterations: 10,
            tolerance: 1e-5,
            gain_scale: 1.0,
            turning_gain_scale: 1.0,
            turning_yaw_rate: 1.0,
        }
    }
}

impl BalancerConfig {
    /// Load configuration from a JSON file. Falls back to defaults if the file is missing.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents =
            std::fs::read_to_string(path).context("Failed to read balancer config file")?;

        let config: BalancerConfig =
            serde_json::from_str(&contents).context("Failed to parse balancer config JSON")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("cycle.frequency", self.cycle.frequency)?;
        if self.cycle.timeout_periods == 0 {
            return Err(ConfigError("cycle.timeout_periods must be at least 1".into()));
        }

        positive("estimator.wheel_radius", self.estimator.wheel_radius)?;
        finite("estimator.pitch_bias", self.estimator.pitch_bias)?;

        let c = &self.controller;
        positive("controller.fall_pitch", c.fall_pitch)?;
        positive("controller.wheel_distance", c.wheel_distance)?;
        positive("controller.body_mass", c.body_mass)?;
        positive("controller.max_acceleration", c.max_acceleration)?;
        finite("controller.gains.pitch", c.gains.pitch)?;
        finite("controller.gains.pitch_rate", c.gains.pitch_rate)?;
        finite("controller.gains.velocity", c.gains.velocity)?;
        finite("controller.gains.position", c.gains.position)?;
        finite("controller.gains.integral", c.gains.integral)?;
        non_negative("controller.gains.integral_limit", c.gains.integral_limit)?;

        positive("limits.wheel_velocity", self.limits.wheel_velocity)?;
        positive("limits.wheel_torque", self.limits.wheel_torque)?;
        positive("limits.leg_position", self.limits.leg_position)?;
        positive("limits.leg_gain_scale", self.limits.leg_gain_scale)?;
        if let ClampPolicy::Shared { limit } = self.limits.clamp {
            positive("limits.clamp.limit", limit)?;
        }

        let o = &self.optimizer;
        if o.horizon == 0 {
            return Err(ConfigError("optimizer.horizon must be at least 1".into()));
        }
        positive("optimizer.timestep", o.timestep)?;
        positive("optimizer.pendulum_length", o.pendulum_length)?;
        positive("optimizer.gravity", o.gravity)?;
        for w in o.state_weights {
            non_negative("optimizer.state_weights", w)?;
        }
        non_negative("optimizer.terminal_weight", o.terminal_weight)?;
        positive("optimizer.control_weight", o.control_weight)?;
        non_negative("optimizer.rate_weight", o.rate_weight)?;
        positive("optimizer.acceleration_limit", o.acceleration_limit)?;
        positive("optimizer.tilt_limit", o.tilt_limit)?;
        positive("optimizer.velocity_limit", o.velocity_limit)?;
        positive("optimizer.time_budget", o.time_budget)?;

        match &self.legs {
            Some(legs) => {
                positive("legs.thigh_length", legs.thigh_length)?;
                positive("legs.shank_length", legs.shank_length)?;
                positive("legs.height", legs.height)?;
                non_negative("legs.max_shift", legs.max_shift)?;
                finite("legs.com_gain", legs.com_gain)?;
                non_negative("legs.damping", legs.damping)?;
                positive("legs.tolerance", legs.tolerance)?;
                finite("legs.gain_scale", legs.gain_scale)?;
                non_negative("legs.turning_gain_scale", legs.turning_gain_scale)?;
                positive("legs.turning_yaw_rate", legs.turning_yaw_rate)?;
                let reach = legs.thigh_length + legs.shank_length;
                if legs.height.hypot(legs.max_shift) >= reach {
                    return Err(ConfigError(format!(
                        "legs.height {} with max_shift {} is out of reach {}",
                        legs.height, legs.max_shift, reach
                    )));
                }
            }
            None if c.law == ControlLaw::WholeBody => {
                return Err(ConfigError(
                    "controller.law `whole_body` requires a `legs` section".into(),
                ));
            }
            None => {}
        }

        Ok(())
    }
}

fn finite(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError(format!("{name} must be finite, got {value}")))
    }
}

fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError(format!("{name} must be positive, got {value}")))
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError(format!("{name} must be non-negative, got {value}")))
    }
}
