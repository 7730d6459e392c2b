//! Observation and action frames exchanged with the spine.
//!
//! A frame maps a block identifier (`imu`, `left_wheel`, ...) to named
//! numeric fields. Every value is a vector so quaternions, angular rates and
//! scalar readings share one representation. Transforms address values with
//! a [`SignalKey`] of the form `block.field`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Address of one value inside a frame: `block.field`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SignalKey {
    block: String,
    field: String,
}

impl SignalKey {
    pub fn new(block: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            block: block.into(),
            field: field.into(),
        }
    }

    pub fn block(&self) -> &str {
        &self.block
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl FromStr for SignalKey {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((block, field)) if !block.is_empty() && !field.is_empty() => {
                Ok(Self::new(block, field))
            }
            _ => Err(PipelineError::InvalidKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for SignalKey {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SignalKey> for String {
    fn from(key: SignalKey) -> Self {
        key.to_string()
    }
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.block, self.field)
    }
}

/// Named numeric fields of one sensor or actuator block.
pub type Block = BTreeMap<String, Vec<f64>>;

/// Mapping from block identifiers to their fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frame {
    blocks: BTreeMap<String, Block>,
}

/// Sensor readings for one cycle, as produced by the spine.
pub type Observation = Frame;

/// Actuator commands for one cycle.
pub type Action = Frame;

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy for assembling frames in place.
    pub fn with(mut self, key: SignalKey, value: Vec<f64>) -> Self {
        self.set(&key, value);
        self
    }

    pub fn get(&self, key: &SignalKey) -> Option<&[f64]> {
        self.blocks
            .get(key.block())
            .and_then(|block| block.get(key.field()))
            .map(Vec::as_slice)
    }

    /// First component of a value, for scalar readings.
    pub fn scalar(&self, key: &SignalKey) -> Option<f64> {
        self.get(key).and_then(|v| v.first().copied())
    }

    pub fn contains(&self, key: &SignalKey) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace a value.
    pub fn set(&mut self, key: &SignalKey, value: Vec<f64>) {
        self.blocks
            .entry(key.block().to_string())
            .or_default()
            .insert(key.field().to_string(), value);
    }

    pub fn block(&self, name: &str) -> Option<&Block> {
        self.blocks.get(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = SignalKey> + '_ {
        self.blocks.iter().flat_map(|(block, fields)| {
            fields
                .keys()
                .map(move |field| SignalKey::new(block.as_str(), field.as_str()))
        })
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.blocks
            .values()
            .flat_map(|fields| fields.values().flatten().copied())
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut f64> + '_ {
        self.blocks
            .values_mut()
            .flat_map(|fields| fields.values_mut().flatten())
    }

    /// Iterate `(key, value)` pairs mutably.
    pub fn entries_mut(&mut self) -> impl Iterator<Item = (SignalKey, &mut Vec<f64>)> + '_ {
        self.blocks.iter_mut().flat_map(|(block, fields)| {
            fields
                .iter_mut()
                .map(move |(field, value)| (SignalKey::new(block.as_str(), field.as_str()), value))
        })
    }

    /// Same key set, every value zero.
    pub fn zeroed(&self) -> Self {
        let mut zero = self.clone();
        zero.values_mut().for_each(|v| *v = 0.0);
        zero
    }

    pub fn is_zero(&self) -> bool {
        self.values().all(|v| v == 0.0)
    }

    /// Largest absolute component, 0.0 for an empty frame.
    pub fn max_abs(&self) -> f64 {
        self.values().fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }

    pub fn schema(&self) -> Schema {
        let mut schema = Schema::default();
        for (block, fields) in &self.blocks {
            for (field, value) in fields {
                schema.insert(SignalKey::new(block.as_str(), field.as_str()), value.len());
            }
        }
        schema
    }
}

/// The fixed key set of a frame stream, with the width of each value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    widths: BTreeMap<SignalKey, usize>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: SignalKey, width: usize) -> Self {
        self.insert(key, width);
        self
    }

    pub fn insert(&mut self, key: SignalKey, width: usize) {
        self.widths.insert(key, width);
    }

    pub fn contains(&self, key: &SignalKey) -> bool {
        self.widths.contains_key(key)
    }

    pub fn width(&self, key: &SignalKey) -> Option<usize> {
        self.widths.get(key).copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SignalKey> {
        self.widths.keys()
    }

    pub fn len(&self) -> usize {
        self.widths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widths.is_empty()
    }

    /// A frame holding zeros for every key of the schema.
    pub fn zero_frame(&self) -> Frame {
        let mut frame = Frame::new();
        for (key, &width) in &self.widths {
            frame.set(key, vec![0.0; width]);
        }
        frame
    }
}
