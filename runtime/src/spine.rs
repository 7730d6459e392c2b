//! Connection to the actuation backend ("spine").
//!
//! The control thread fetches one observation and dispatches one action per
//! cycle. Implementations here are test doubles: a scripted spine replaying
//! queued observations, and a linearized pendulum for dry runs.

use std::collections::VecDeque;
use std::time::Duration;

use nalgebra::{DVector, UnitQuaternion};

use crate::config::BalancerConfig;
use crate::error::SpineError;
use crate::estimator::{angular_velocity_key, orientation_key, wheel_velocity_key};
use crate::frame::{Action, Observation, Schema};
use crate::optimizer::dynamics::{PendulumModel, PITCH, PITCH_RATE, POSITION, STATE_DIM, VELOCITY};

/// Trait for spine implementations (supports dependency injection for testing).
pub trait Spine: Send {
    /// Keys and widths of every observation this spine produces.
    fn observation_schema(&self) -> Schema;

    /// Block until the next observation, or fail after `timeout`.
    fn fetch_observation(&mut self, timeout: Duration) -> Result<Observation, SpineError>;

    fn dispatch_action(&mut self, action: &Action) -> Result<(), SpineError>;
}

enum Scripted {
    Observation(Observation),
    Timeout,
}

/// Replays queued observations and records every dispatched action.
pub struct ScriptedSpine {
    schema: Schema,
    script: VecDeque<Scripted>,
    /// Served once the script runs out.
    repeat: Option<Observation>,
    dispatched: Vec<Action>,
}

impl ScriptedSpine {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            script: VecDeque::new(),
            repeat: None,
            dispatched: Vec::new(),
        }
    }

    /// Serve `observation` forever, after anything already queued.
    pub fn repeating(observation: Observation) -> Self {
        let mut spine = Self::new(observation.schema());
        spine.repeat = Some(observation);
        spine
    }

    pub fn push(&mut self, observation: Observation) -> &mut Self {
        self.script.push_back(Scripted::Observation(observation));
        self
    }

    /// The next fetch times out.
    pub fn push_timeout(&mut self) -> &mut Self {
        self.script.push_back(Scripted::Timeout);
        self
    }

    pub fn dispatched(&self) -> &[Action] {
        &self.dispatched
    }
}

impl Spine for ScriptedSpine {
    fn observation_schema(&self) -> Schema {
        self.schema.clone()
    }

    fn fetch_observation(&mut self, timeout: Duration) -> Result<Observation, SpineError> {
        match self.script.pop_front() {
            Some(Scripted::Observation(observation)) => Ok(observation),
            Some(Scripted::Timeout) => Err(SpineError::Timeout(timeout)),
            None => self
                .repeat
                .clone()
                .ok_or_else(|| SpineError::Disconnected("script exhausted".into())),
        }
    }

    fn dispatch_action(&mut self, action: &Action) -> Result<(), SpineError> {
        self.dispatched.push(action.clone());
        Ok(())
    }
}

/// Linearized wheeled pendulum with ideal wheel velocity tracking.
///
/// Each dispatched wheel velocity is reached at the end of the step, so the
/// ground acceleration over the step is `(v_cmd - v) / dt`. Once the pitch
/// passes ±90° the body lies on the ground and stays there.
pub struct PendulumSpine {
    model: PendulumModel,
    state: DVector<f64>,
    wheel_radius: f64,
    right_sign: f64,
    steps: u64,
}

impl PendulumSpine {
    pub fn new(config: &BalancerConfig, initial_pitch: f64) -> Self {
        let optimizer = &config.optimizer;
        let mut state = DVector::zeros(STATE_DIM);
        state[PITCH] = initial_pitch;
        Self {
            model: PendulumModel::new(optimizer.pendulum_length, optimizer.gravity, config.cycle.dt()),
            state,
            wheel_radius: config.estimator.wheel_radius,
            right_sign: if config.estimator.right_wheel_mirrored {
                -1.0
            } else {
                1.0
            },
            steps: 0,
        }
    }

    pub fn pitch(&self) -> f64 {
        self.state[PITCH]
    }

    pub fn ground_velocity(&self) -> f64 {
        self.state[VELOCITY]
    }

    pub fn ground_position(&self) -> f64 {
        self.state[POSITION]
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn observation(&self) -> Observation {
        let q = UnitQuaternion::from_euler_angles(0.0, self.state[PITCH], 0.0);
        let wheel = self.state[VELOCITY] / self.wheel_radius;
        Observation::new()
            .with(orientation_key(), vec![q.w, q.i, q.j, q.k])
            .with(angular_velocity_key(), vec![0.0, self.state[PITCH_RATE], 0.0])
            .with(wheel_velocity_key("left"), vec![wheel])
            .with(wheel_velocity_key("right"), vec![self.right_sign * wheel])
    }
}

impl Spine for PendulumSpine {
    fn observation_schema(&self) -> Schema {
        self.observation().schema()
    }

    fn fetch_observation(&mut self, _timeout: Duration) -> Result<Observation, SpineError> {
        Ok(self.observation())
    }

    fn dispatch_action(&mut self, action: &Action) -> Result<(), SpineError> {
        let rate = |side: &str| {
            action
                .scalar(&wheel_velocity_key(side))
                .unwrap_or(0.0)
        };
        let commanded =
            self.wheel_radius * (rate("left") + self.right_sign * rate("right")) / 2.0;

        if self.state[PITCH].abs() >= std::f64::consts::FRAC_PI_2 {
            self.state[PITCH] = self.state[PITCH].signum() * std::f64::consts::FRAC_PI_2;
            self.state[PITCH_RATE] = 0.0;
            self.state[VELOCITY] = 0.0;
        } else {
            let acceleration = (commanded - self.state[VELOCITY]) / self.model.dt;
            self.state = self.model.step(&self.state, acceleration);
        }
        self.steps += 1;
        Ok(())
    }
}
