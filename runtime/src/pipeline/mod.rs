//! Observation/action transform pipeline.
//!
//! Transforms run in sequence order on observations (spine → controller) and
//! in reverse order on actions (controller → spine). Stateful transforms keep
//! one memory slot per key, created on first sight and dropped on
//! [`Pipeline::reset`].

mod transforms;

pub use transforms::{AddDerivedField, Differentiate, IntegrateAction, LowPassFilter, Noisify};

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::frame::{Action, Observation, Schema, SignalKey};

/// Which stream a transform acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Observation,
    Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseDistribution {
    /// Uniform in `[-amplitude, amplitude]`.
    Uniform,
    /// Zero-mean Gaussian with σ = amplitude, truncated to ±3σ.
    Gaussian,
}

/// Per-transform parameters, as found in the `pipeline` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WrapperConfig {
    /// Copy `source` from the previous cycle's action into the observation.
    AddDerivedField { source: SignalKey, target: SignalKey },

    /// Finite difference of `key`, in place or into a new observation key.
    Differentiate {
        side: Side,
        key: SignalKey,
        #[serde(default)]
        into: Option<SignalKey>,
    },

    /// Exponential smoothing with time constant `time_constant` (s).
    LowPassFilter {
        side: Side,
        keys: Vec<SignalKey>,
        time_constant: f64,
    },

    /// Seeded additive noise.
    Noisify {
        side: Side,
        keys: Vec<SignalKey>,
        distribution: NoiseDistribution,
        amplitude: f64,
        #[serde(default)]
        seed: u64,
    },

    /// The controller commands a rate; the transform integrates it and clips.
    IntegrateAction {
        keys: Vec<SignalKey>,
        min: f64,
        max: f64,
    },
}

impl WrapperConfig {
    /// Instantiate the transform for a loop running at period `dt`.
    pub fn build(&self, dt: f64) -> Result<Box<dyn Transform>, PipelineError> {
        Ok(match self {
            Self::AddDerivedField { source, target } => {
                Box::new(AddDerivedField::new(source.clone(), target.clone()))
            }
            Self::Differentiate { side, key, into } => {
                Box::new(Differentiate::new(*side, key.clone(), into.clone(), dt)?)
            }
            Self::LowPassFilter {
                side,
                keys,
                time_constant,
            } => Box::new(LowPassFilter::new(*side, keys.clone(), *time_constant, dt)?),
            Self::Noisify {
                side,
                keys,
                distribution,
                amplitude,
                seed,
            } => Box::new(Noisify::new(
                *side,
                keys.clone(),
                *distribution,
                *amplitude,
                *seed,
            )?),
            Self::IntegrateAction { keys, min, max } => {
                Box::new(IntegrateAction::new(keys.clone(), *min, *max, dt)?)
            }
        })
    }
}

/// Per-cycle data shared with transforms.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformContext<'a> {
    /// Controller action of the previous cycle, before action-side transforms.
    pub previous_action: Option<&'a Action>,
}

/// One stage of the pipeline.
pub trait Transform: Send {
    fn name(&self) -> &'static str;

    /// Keys read by this transform, checked at assembly time.
    fn requires(&self) -> Vec<(Side, SignalKey)>;

    /// Observation keys added by this transform, with their widths.
    fn declare(&mut self, _observation: &Schema, _action: &Schema) -> Vec<(SignalKey, usize)> {
        Vec::new()
    }

    fn observation(&mut self, observation: Observation, _ctx: &TransformContext<'_>) -> Observation {
        observation
    }

    fn action(&mut self, action: Action) -> Action {
        action
    }

    /// Drop all internal memory.
    fn reset(&mut self) {}
}

/// Ordered chain of transforms with a one-cycle action delay buffer.
pub struct Pipeline {
    transforms: Vec<Box<dyn Transform>>,
    input_schema: Schema,
    observation_schema: Schema,
    action_schema: Schema,
    previous_action: Option<Action>,
}

impl Pipeline {
    /// Build transforms from configuration and check their dependencies.
    pub fn assemble(
        configs: &[WrapperConfig],
        observation: &Schema,
        action: &Schema,
        dt: f64,
    ) -> Result<Self, PipelineError> {
        let transforms = configs
            .iter()
            .map(|config| config.build(dt))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_transforms(transforms, observation, action)
    }

    /// Check dependencies of already-built transforms, in order.
    pub fn from_transforms(
        mut transforms: Vec<Box<dyn Transform>>,
        observation: &Schema,
        action: &Schema,
    ) -> Result<Self, PipelineError> {
        let mut observation_schema = observation.clone();

        for transform in &mut transforms {
            for (side, key) in transform.requires() {
                let available = match side {
                    Side::Observation => observation_schema.contains(&key),
                    Side::Action => action.contains(&key),
                };
                if !available {
                    return Err(PipelineError::MissingKey {
                        transform: transform.name().to_string(),
                        key,
                    });
                }
            }
            for (key, width) in transform.declare(&observation_schema, action) {
                observation_schema.insert(key, width);
            }
        }

        tracing::debug!(
            "Pipeline assembled: {} transforms, {} observation keys",
            transforms.len(),
            observation_schema.len()
        );

        Ok(Self {
            transforms,
            input_schema: observation.clone(),
            observation_schema,
            action_schema: action.clone(),
            previous_action: None,
        })
    }

    /// A pipeline that passes frames through unchanged.
    pub fn identity(observation: &Schema, action: &Schema) -> Self {
        Self {
            transforms: Vec::new(),
            input_schema: observation.clone(),
            observation_schema: observation.clone(),
            action_schema: action.clone(),
            previous_action: None,
        }
    }

    /// Append `other`'s transforms after ours, re-checking dependencies.
    pub fn chain(self, other: Pipeline) -> Result<Self, PipelineError> {
        let mut transforms = self.transforms;
        transforms.extend(other.transforms);
        Self::from_transforms(transforms, &self.input_schema, &self.action_schema)
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// Observation keys seen by the controller side.
    pub fn observation_schema(&self) -> &Schema {
        &self.observation_schema
    }

    pub fn action_schema(&self) -> &Schema {
        &self.action_schema
    }

    /// Run the observation side. The spine's observation is left untouched.
    pub fn observation(&mut self, observation: &Observation) -> Observation {
        let ctx = TransformContext {
            previous_action: self.previous_action.as_ref(),
        };
        self.transforms
            .iter_mut()
            .fold(observation.clone(), |obs, transform| {
                transform.observation(obs, &ctx)
            })
    }

    /// Controller action of the last `action` call, as seen by derived fields.
    pub fn previous_action(&self) -> Option<&Action> {
        self.previous_action.as_ref()
    }

    /// Run the action side, innermost transform first. Only call with an
    /// action that will be dispatched: transforms and the derived-field
    /// feedback advance here.
    pub fn action(&mut self, action: Action) -> Action {
        self.previous_action = Some(action.clone());
        self.transforms
            .iter_mut()
            .rev()
            .fold(action, |act, transform| transform.action(act))
    }

    pub fn reset(&mut self) {
        for transform in &mut self.transforms {
            transform.reset();
        }
        self.previous_action = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const DT: f64 = 0.01;

    fn key(s: &str) -> SignalKey {
        s.parse().unwrap()
    }

    fn obs_schema() -> Schema {
        Schema::new()
            .with(key("imu.pitch"), 1)
            .with(key("left_wheel.velocity"), 1)
    }

    fn act_schema() -> Schema {
        Schema::new()
            .with(key("left_wheel.velocity"), 1)
            .with(key("right_wheel.velocity"), 1)
    }

    fn obs(pitch: f64, wheel: f64) -> Observation {
        Observation::new()
            .with(key("imu.pitch"), vec![pitch])
            .with(key("left_wheel.velocity"), vec![wheel])
    }

    fn act(left: f64, right: f64) -> Action {
        Action::new()
            .with(key("left_wheel.velocity"), vec![left])
            .with(key("right_wheel.velocity"), vec![right])
    }

    #[test]
    fn test_missing_key_fails_at_assembly() {
        let configs = vec![WrapperConfig::LowPassFilter {
            side: Side::Observation,
            keys: vec![key("imu.angular_velocity")],
            time_constant: 0.1,
        }];
        let err = Pipeline::assemble(&configs, &obs_schema(), &act_schema(), DT)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::MissingKey { ref key, .. } if key.to_string() == "imu.angular_velocity"));
    }

    #[test]
    fn test_derived_source_must_be_an_action_key() {
        let configs = vec![WrapperConfig::AddDerivedField {
            source: key("left_hip.position"),
            target: key("history.left_hip"),
        }];
        assert!(Pipeline::assemble(&configs, &obs_schema(), &act_schema(), DT).is_err());
    }

    #[test]
    fn test_downstream_may_use_derived_keys() {
        let configs = vec![
            WrapperConfig::Differentiate {
                side: Side::Observation,
                key: key("imu.pitch"),
                into: Some(key("imu.pitch_rate")),
            },
            WrapperConfig::LowPassFilter {
                side: Side::Observation,
                keys: vec![key("imu.pitch_rate")],
                time_constant: 0.05,
            },
        ];
        let pipeline = Pipeline::assemble(&configs, &obs_schema(), &act_schema(), DT).unwrap();
        assert!(pipeline.observation_schema().contains(&key("imu.pitch_rate")));

        // Reversed order: the filter would read a key nobody produced yet.
        let reversed: Vec<_> = configs.into_iter().rev().collect();
        assert!(Pipeline::assemble(&reversed, &obs_schema(), &act_schema(), DT).is_err());
    }

    #[test]
    fn test_observation_source_is_not_mutated() {
        let configs = vec![WrapperConfig::Noisify {
            side: Side::Observation,
            keys: vec![key("imu.pitch")],
            distribution: NoiseDistribution::Uniform,
            amplitude: 0.1,
            seed: 7,
        }];
        let mut pipeline = Pipeline::assemble(&configs, &obs_schema(), &act_schema(), DT).unwrap();
        let raw = obs(0.2, 1.0);
        let out = pipeline.observation(&raw);
        assert_eq!(raw, obs(0.2, 1.0));
        assert_eq!(out.schema(), raw.schema());
    }

    #[test]
    fn test_add_derived_field_uses_previous_action() {
        let configs = vec![WrapperConfig::AddDerivedField {
            source: key("left_wheel.velocity"),
            target: key("last_action.left_wheel"),
        }];
        let mut pipeline = Pipeline::assemble(&configs, &obs_schema(), &act_schema(), DT).unwrap();
        let target = key("last_action.left_wheel");

        let first = pipeline.observation(&obs(0.0, 0.0));
        assert_eq!(first.get(&target), Some(&[0.0][..]));
        pipeline.action(act(3.0, -3.0));

        let second = pipeline.observation(&obs(0.0, 0.0));
        assert_eq!(second.get(&target), Some(&[3.0][..]));
        pipeline.action(act(4.0, -4.0));

        pipeline.reset();
        let after_reset = pipeline.observation(&obs(0.0, 0.0));
        assert_eq!(after_reset.get(&target), Some(&[0.0][..]));
    }

    #[test]
    fn test_action_transforms_run_in_reverse_order() {
        // The low-pass stage is listed last, so it sees the controller output first.
        let configs = vec![
            WrapperConfig::IntegrateAction {
                keys: vec![key("left_wheel.velocity")],
                min: -1.0,
                max: 1.0,
            },
            WrapperConfig::LowPassFilter {
                side: Side::Action,
                keys: vec![key("left_wheel.velocity")],
                time_constant: 1.0,
            },
        ];
        let mut pipeline = Pipeline::assemble(&configs, &obs_schema(), &act_schema(), DT).unwrap();
        let k = key("left_wheel.velocity");

        // Inner low-pass initializes on 10.0, outer integrator adds 10.0 * DT.
        let out = pipeline.action(act(10.0, 0.0));
        assert_relative_eq!(out.scalar(&k).unwrap(), 0.1, epsilon = 1e-12);

        // Low-pass moves 1% toward 0.0 → 9.9; integrator adds 0.099.
        let out = pipeline.action(act(0.0, 0.0));
        assert_relative_eq!(out.scalar(&k).unwrap(), 0.199, epsilon = 1e-12);
    }

    fn chain_configs() -> Vec<WrapperConfig> {
        vec![
            WrapperConfig::LowPassFilter {
                side: Side::Observation,
                keys: vec![key("imu.pitch")],
                time_constant: 0.05,
            },
            WrapperConfig::Noisify {
                side: Side::Observation,
                keys: vec![key("left_wheel.velocity")],
                distribution: NoiseDistribution::Gaussian,
                amplitude: 0.02,
                seed: 42,
            },
            WrapperConfig::Differentiate {
                side: Side::Observation,
                key: key("imu.pitch"),
                into: Some(key("imu.pitch_rate")),
            },
        ]
    }

    #[test]
    fn test_composition_is_associative() {
        let configs = chain_configs();
        let mut whole = Pipeline::assemble(&configs, &obs_schema(), &act_schema(), DT).unwrap();
        let head = Pipeline::assemble(&configs[..2], &obs_schema(), &act_schema(), DT).unwrap();
        let tail = Pipeline::assemble(
            &configs[2..],
            head.observation_schema(),
            &act_schema(),
            DT,
        )
        .unwrap();
        let mut chained = head.chain(tail).unwrap();

        for i in 0..50 {
            let t = i as f64 * DT;
            let input = obs((3.0 * t).sin() * 0.1, t);
            assert_eq!(whole.observation(&input), chained.observation(&input));
        }
    }

    #[test]
    fn test_sequential_pipelines_equal_concatenation() {
        let configs = chain_configs();
        let mut whole = Pipeline::assemble(&configs, &obs_schema(), &act_schema(), DT).unwrap();
        let mut head = Pipeline::assemble(&configs[..2], &obs_schema(), &act_schema(), DT).unwrap();
        let mut tail = Pipeline::assemble(
            &configs[2..],
            head.observation_schema(),
            &act_schema(),
            DT,
        )
        .unwrap();

        for i in 0..50 {
            let input = obs(0.01 * i as f64, -0.5 * i as f64);
            let staged = tail.observation(&head.observation(&input));
            assert_eq!(whole.observation(&input), staged);
        }
    }

    #[test]
    fn test_reset_restores_initial_behavior() {
        let configs = chain_configs();
        let mut pipeline = Pipeline::assemble(&configs, &obs_schema(), &act_schema(), DT).unwrap();
        let inputs: Vec<_> = (0..10).map(|i| obs(0.02 * i as f64, i as f64)).collect();

        let first: Vec<_> = inputs.iter().map(|o| pipeline.observation(o)).collect();
        pipeline.reset();
        let second: Vec<_> = inputs.iter().map(|o| pipeline.observation(o)).collect();
        assert_eq!(first, second);
    }
}
