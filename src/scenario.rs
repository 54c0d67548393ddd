//! Load profiles.
//!
//! A [`ScenarioProfile`] says how many virtual users to run, how fast to start
//! them and for how long to hold the load. The four named profiles cover the
//! usual light-to-stress progression.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProfileError;

/// (name, users, spawn rate per second, duration in seconds)
const NAMED: [(&str, usize, f64, u64); 4] = [
    ("light", 20, 2.0, 5 * 60),
    ("medium", 100, 5.0, 10 * 60),
    ("heavy", 500, 10.0, 15 * 60),
    ("stress", 2000, 20.0, 20 * 60),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawProfile")]
pub struct ScenarioProfile {
    name: String,
    virtual_user_count: usize,
    spawn_rate: f64,
    duration: Duration,
}

/// Unchecked form a profile is deserialized through.
#[derive(Deserialize)]
struct RawProfile {
    name: String,
    virtual_user_count: usize,
    spawn_rate: f64,
    duration: Duration,
}

impl TryFrom<RawProfile> for ScenarioProfile {
    type Error = ProfileError;

    fn try_from(raw: RawProfile) -> Result<Self, ProfileError> {
        Self::new(raw.name, raw.virtual_user_count, raw.spawn_rate, raw.duration)
    }
}

impl ScenarioProfile {
    pub fn new(
        name: impl Into<String>,
        virtual_user_count: usize,
        spawn_rate: f64,
        duration: Duration,
    ) -> Result<Self, ProfileError> {
        if virtual_user_count == 0 {
            return Err(ProfileError::NoUsers);
        }
        if !spawn_rate.is_finite() || spawn_rate <= 0.0 {
            return Err(ProfileError::InvalidSpawnRate(spawn_rate));
        }
        if duration.is_zero() {
            return Err(ProfileError::InvalidDuration(duration));
        }
        Ok(Self {
            name: name.into(),
            virtual_user_count,
            spawn_rate,
            duration,
        })
    }

    /// One of `light`, `medium`, `heavy` or `stress`.
    pub fn named(name: &str) -> Result<Self, ProfileError> {
        NAMED
            .iter()
            .find(|(n, ..)| *n == name)
            .map(|(n, users, rate, secs)| Self {
                name: (*n).to_owned(),
                virtual_user_count: *users,
                spawn_rate: *rate,
                duration: Duration::from_secs(*secs),
            })
            .ok_or_else(|| ProfileError::UnknownScenario(name.to_owned()))
    }

    /// All named profiles, lightest first.
    pub fn catalog() -> Vec<Self> {
        NAMED
            .iter()
            .filter_map(|(n, ..)| Self::named(n).ok())
            .collect()
    }

    /// Replaces the given parameters and validates the result.
    pub fn with_overrides(
        self,
        virtual_user_count: Option<usize>,
        spawn_rate: Option<f64>,
        duration: Option<Duration>,
    ) -> Result<Self, ProfileError> {
        Self::new(
            self.name,
            virtual_user_count.unwrap_or(self.virtual_user_count),
            spawn_rate.unwrap_or(self.spawn_rate),
            duration.unwrap_or(self.duration),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn virtual_user_count(&self) -> usize {
        self.virtual_user_count
    }

    pub fn spawn_rate(&self) -> f64 {
        self.spawn_rate
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Time needed to start every virtual user at the spawn rate. Saturates
    /// for rates too small to express.
    pub fn ramp_up(&self) -> Duration {
        Duration::try_from_secs_f64(self.virtual_user_count as f64 / self.spawn_rate)
            .unwrap_or(Duration::MAX)
    }
}

/// Parses `300`, `300s`, `5m`, `1h` and combinations like `1m30s` or `1h30m`.
pub fn parse_duration(input: &str) -> Result<Duration, ProfileError> {
    let err = || ProfileError::UnparsableDuration(input.to_owned());
    let s = input.trim();
    if s.is_empty() {
        return Err(err());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = 0u64;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let unit = match c {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => return Err(err()),
        };
        let value: u64 = digits.parse().map_err(|_| err())?;
        total = value
            .checked_mul(unit)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(err)?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(err());
    }
    Ok(Duration::from_secs(total))
}
