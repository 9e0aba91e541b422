//! Randomized per-batch parameters

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A float parameter drawn once per sample per batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatParam {
    /// Always the same value
    Fixed(f32),

    /// Uniform in `[low, high)`
    Uniform {
        /// Lower bound, inclusive
        low: f32,
        /// Upper bound, exclusive
        high: f32,
    },

    /// One of the listed values
    Choice(Vec<f32>),
}

impl FloatParam {
    /// Check bounds and choices
    pub fn validate(&self) -> Result<()> {
        match self {
            FloatParam::Uniform { low, high } if !(low < high) => Err(Error::InvalidArgument(
                format!("uniform range [{low}, {high}) is empty"),
            )),
            FloatParam::Choice(values) if values.is_empty() => {
                Err(Error::InvalidArgument("choice parameter has no values".into()))
            }
            _ => Ok(()),
        }
    }

    /// Draw one value
    pub fn sample(&self, rng: &mut StdRng) -> f32 {
        match self {
            FloatParam::Fixed(value) => *value,
            FloatParam::Uniform { low, high } => rng.gen_range(*low..*high),
            FloatParam::Choice(values) => values.choose(rng).copied().unwrap_or_default(),
        }
    }

    /// Replace `values` with `count` fresh draws
    pub fn renew(&self, rng: &mut StdRng, count: usize, values: &mut Vec<f32>) {
        values.clear();
        values.extend((0..count).map(|_| self.sample(rng)));
    }
}

/// An integer parameter drawn once per sample per batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntParam {
    /// Always the same value
    Fixed(i32),

    /// Uniform in `[low, high]`
    Uniform {
        /// Lower bound, inclusive
        low: i32,
        /// Upper bound, inclusive
        high: i32,
    },

    /// One of the listed values
    Choice(Vec<i32>),
}

impl IntParam {
    /// Check bounds and choices
    pub fn validate(&self) -> Result<()> {
        match self {
            IntParam::Uniform { low, high } if low > high => Err(Error::InvalidArgument(format!(
                "uniform range [{low}, {high}] is empty"
            ))),
            IntParam::Choice(values) if values.is_empty() => {
                Err(Error::InvalidArgument("choice parameter has no values".into()))
            }
            _ => Ok(()),
        }
    }

    /// Draw one value
    pub fn sample(&self, rng: &mut StdRng) -> i32 {
        match self {
            IntParam::Fixed(value) => *value,
            IntParam::Uniform { low, high } => rng.gen_range(*low..=*high),
            IntParam::Choice(values) => values.choose(rng).copied().unwrap_or_default(),
        }
    }

    /// Replace `values` with `count` fresh draws
    pub fn renew(&self, rng: &mut StdRng, count: usize, values: &mut Vec<i32>) {
        values.clear();
        values.extend((0..count).map(|_| self.sample(rng)));
    }
}

/// Owns the seeded generator every node draws its parameters from
#[derive(Debug, Clone)]
pub struct ParameterFactory {
    /// Seed the generator was created from
    seed: u64,

    /// The generator
    rng: StdRng,
}

impl ParameterFactory {
    /// Create a factory seeded with `seed`
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Seed the generator was created from
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Restart the random sequence from the original seed
    pub fn reseed(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
    }

    /// The generator
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}
