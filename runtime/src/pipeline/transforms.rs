//! Concrete pipeline transforms.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};
use std::collections::BTreeMap;

use super::{NoiseDistribution, Side, Transform, TransformContext};
use crate::error::PipelineError;
use crate::frame::{Action, Frame, Observation, Schema, SignalKey};

fn invalid(transform: &str, reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidParameter {
        transform: transform.to_string(),
        reason: reason.into(),
    }
}

/// Apply `f` to each listed key present in the frame.
fn map_keys(frame: &mut Frame, keys: &[SignalKey], mut f: impl FnMut(&SignalKey, &mut Vec<f64>)) {
    for key in keys {
        if let Some(current) = frame.get(key) {
            let mut value = current.to_vec();
            f(key, &mut value);
            frame.set(key, value);
        }
    }
}

// ── Add derived field ──

/// Feeds a value of the previous cycle's action back as an observation.
pub struct AddDerivedField {
    source: SignalKey,
    target: SignalKey,
    width: usize,
}

impl AddDerivedField {
    pub fn new(source: SignalKey, target: SignalKey) -> Self {
        Self {
            source,
            target,
            width: 1,
        }
    }
}

impl Transform for AddDerivedField {
    fn name(&self) -> &'static str {
        "add_derived_field"
    }

    fn requires(&self) -> Vec<(Side, SignalKey)> {
        vec![(Side::Action, self.source.clone())]
    }

    fn declare(&mut self, _observation: &Schema, action: &Schema) -> Vec<(SignalKey, usize)> {
        self.width = action.width(&self.source).unwrap_or(1);
        vec![(self.target.clone(), self.width)]
    }

    fn observation(&mut self, mut observation: Observation, ctx: &TransformContext<'_>) -> Observation {
        let value = ctx
            .previous_action
            .and_then(|action| action.get(&self.source))
            .map(<[f64]>::to_vec)
            .unwrap_or_else(|| vec![0.0; self.width]);
        observation.set(&self.target, value);
        observation
    }
}

// ── Differentiate ──

/// Backward finite difference `(x[n] - x[n-1]) / dt`, zero on the first sample.
pub struct Differentiate {
    side: Side,
    key: SignalKey,
    into: Option<SignalKey>,
    dt: f64,
    previous: BTreeMap<SignalKey, Vec<f64>>,
}

impl Differentiate {
    pub fn new(side: Side, key: SignalKey, into: Option<SignalKey>, dt: f64) -> Result<Self, PipelineError> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(invalid("differentiate", format!("dt must be positive, got {dt}")));
        }
        if side == Side::Action && into.is_some() {
            return Err(invalid("differentiate", "action-side transforms cannot add keys"));
        }
        Ok(Self {
            side,
            key,
            into,
            dt,
            previous: BTreeMap::new(),
        })
    }

    fn apply(&mut self, mut frame: Frame) -> Frame {
        let Some(current) = frame.get(&self.key).map(<[f64]>::to_vec) else {
            return frame;
        };

        let derivative = match self.previous.get(&self.key) {
            Some(prev) if prev.len() == current.len() => current
                .iter()
                .zip(prev)
                .map(|(x, p)| (x - p) / self.dt)
                .collect(),
            _ => vec![0.0; current.len()],
        };
        self.previous.insert(self.key.clone(), current);

        let out = self.into.as_ref().unwrap_or(&self.key);
        frame.set(out, derivative);
        frame
    }
}

impl Transform for Differentiate {
    fn name(&self) -> &'static str {
        "differentiate"
    }

    fn requires(&self) -> Vec<(Side, SignalKey)> {
        vec![(self.side, self.key.clone())]
    }

    fn declare(&mut self, observation: &Schema, _action: &Schema) -> Vec<(SignalKey, usize)> {
        match &self.into {
            Some(into) => vec![(into.clone(), observation.width(&self.key).unwrap_or(1))],
            None => Vec::new(),
        }
    }

    fn observation(&mut self, observation: Observation, _ctx: &TransformContext<'_>) -> Observation {
        if self.side == Side::Observation {
            self.apply(observation)
        } else {
            observation
        }
    }

    fn action(&mut self, action: Action) -> Action {
        if self.side == Side::Action {
            self.apply(action)
        } else {
            action
        }
    }

    fn reset(&mut self) {
        self.previous.clear();
    }
}

// ── Low-pass filter ──

/// First-order IIR low-pass filter.
///
/// `y[n] = y[n-1] + α (x[n] - y[n-1])` with `α = min(dt / τ, 1)` and
/// `y[0] = x[0]`. A time constant at or below `dt` passes values through.
pub struct LowPassFilter {
    side: Side,
    keys: Vec<SignalKey>,
    alpha: f64,
    state: BTreeMap<SignalKey, Vec<f64>>,
}

impl LowPassFilter {
    pub fn new(side: Side, keys: Vec<SignalKey>, time_constant: f64, dt: f64) -> Result<Self, PipelineError> {
        if !(time_constant.is_finite() && time_constant >= 0.0) {
            return Err(invalid(
                "low_pass_filter",
                format!("time_constant must be non-negative, got {time_constant}"),
            ));
        }
        let alpha = if time_constant <= dt {
            1.0
        } else {
            dt / time_constant
        };
        Ok(Self {
            side,
            keys,
            alpha,
            state: BTreeMap::new(),
        })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    fn apply(&mut self, mut frame: Frame) -> Frame {
        let alpha = self.alpha;
        let state = &mut self.state;
        map_keys(&mut frame, &self.keys, |key, value| {
            let y = state.entry(key.clone()).or_insert_with(|| value.clone());
            if y.len() != value.len() {
                *y = value.clone();
            }
            for (yi, xi) in y.iter_mut().zip(value.iter_mut()) {
                *yi += alpha * (*xi - *yi);
                *xi = *yi;
            }
        });
        frame
    }
}

impl Transform for LowPassFilter {
    fn name(&self) -> &'static str {
        "low_pass_filter"
    }

    fn requires(&self) -> Vec<(Side, SignalKey)> {
        self.keys.iter().map(|k| (self.side, k.clone())).collect()
    }

    fn observation(&mut self, observation: Observation, _ctx: &TransformContext<'_>) -> Observation {
        if self.side == Side::Observation {
            self.apply(observation)
        } else {
            observation
        }
    }

    fn action(&mut self, action: Action) -> Action {
        if self.side == Side::Action {
            self.apply(action)
        } else {
            action
        }
    }

    fn reset(&mut self) {
        self.state.clear();
    }
}

// ── Noisify ──

enum Perturbation {
    Uniform(Uniform<f64>),
    Gaussian { normal: Normal<f64>, bound: f64 },
}

/// Additive bounded noise from a seeded generator.
pub struct Noisify {
    side: Side,
    keys: Vec<SignalKey>,
    perturbation: Perturbation,
    seed: u64,
    rng: StdRng,
}

impl Noisify {
    pub fn new(
        side: Side,
        keys: Vec<SignalKey>,
        distribution: NoiseDistribution,
        amplitude: f64,
        seed: u64,
    ) -> Result<Self, PipelineError> {
        if !(amplitude.is_finite() && amplitude >= 0.0) {
            return Err(invalid(
                "noisify",
                format!("amplitude must be non-negative, got {amplitude}"),
            ));
        }
        let perturbation = match distribution {
            NoiseDistribution::Uniform => {
                Perturbation::Uniform(Uniform::new_inclusive(-amplitude, amplitude))
            }
            NoiseDistribution::Gaussian => Perturbation::Gaussian {
                normal: Normal::new(0.0, amplitude)
                    .map_err(|e| invalid("noisify", e.to_string()))?,
                bound: 3.0 * amplitude,
            },
        };
        Ok(Self {
            side,
            keys,
            perturbation,
            seed,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    fn apply(&mut self, mut frame: Frame) -> Frame {
        let rng = &mut self.rng;
        let perturbation = &self.perturbation;
        map_keys(&mut frame, &self.keys, |_, value| {
            for x in value.iter_mut() {
                *x += match perturbation {
                    Perturbation::Uniform(uniform) => uniform.sample(rng),
                    Perturbation::Gaussian { normal, bound } => {
                        normal.sample(rng).clamp(-bound, *bound)
                    }
                };
            }
        });
        frame
    }
}

impl Transform for Noisify {
    fn name(&self) -> &'static str {
        "noisify"
    }

    fn requires(&self) -> Vec<(Side, SignalKey)> {
        self.keys.iter().map(|k| (self.side, k.clone())).collect()
    }

    fn observation(&mut self, observation: Observation, _ctx: &TransformContext<'_>) -> Observation {
        if self.side == Side::Observation {
            self.apply(observation)
        } else {
            observation
        }
    }

    fn action(&mut self, action: Action) -> Action {
        if self.side == Side::Action {
            self.apply(action)
        } else {
            action
        }
    }

    fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
    }
}

// ── Integrate action ──

/// Integrates a commanded rate into the value sent downstream, clipped to `[min, max]`.
pub struct IntegrateAction {
    keys: Vec<SignalKey>,
    min: f64,
    max: f64,
    dt: f64,
    integral: BTreeMap<SignalKey, Vec<f64>>,
}

impl IntegrateAction {
    pub fn new(keys: Vec<SignalKey>, min: f64, max: f64, dt: f64) -> Result<Self, PipelineError> {
        if !(min.is_finite() && max.is_finite() && min <= max) {
            return Err(invalid(
                "integrate_action",
                format!("bounds must satisfy min <= max, got [{min}, {max}]"),
            ));
        }
        Ok(Self {
            keys,
            min,
            max,
            dt,
            integral: BTreeMap::new(),
        })
    }
}

impl Transform for IntegrateAction {
    fn name(&self) -> &'static str {
        "integrate_action"
    }

    fn requires(&self) -> Vec<(Side, SignalKey)> {
        self.keys.iter().map(|k| (Side::Action, k.clone())).collect()
    }

    fn action(&mut self, mut action: Action) -> Action {
        let (min, max, dt) = (self.min, self.max, self.dt);
        let integral = &mut self.integral;
        map_keys(&mut action, &self.keys, |key, rate| {
            let acc = integral
                .entry(key.clone())
                .or_insert_with(|| vec![0.0; rate.len()]);
            if acc.len() != rate.len() {
                *acc = vec![0.0; rate.len()];
            }
            for (a, r) in acc.iter_mut().zip(rate.iter_mut()) {
                *a = (*a + *r * dt).clamp(min, max);
                *r = *a;
            }
        });
        action
    }

    fn reset(&mut self) {
        self.integral.clear();
    }
}
