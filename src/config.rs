use std::{sync::Arc, time::Duration};

use rand::{Rng, SeedableRng, rngs::StdRng};
use typed_builder::TypedBuilder;

use crate::{
    api::Credentials,
    catalog::TaskCatalog,
    error::ConfigError,
    pool::Floors,
};

/// Which realm the virtual users work in.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RealmStrategy {
    /// Create a throw-away `loadtest-<hex>` realm per run and delete it after.
    #[default]
    Isolated,
    /// Use an existing realm. It is neither created nor deleted.
    Fixed(String),
}

impl RealmStrategy {
    pub fn isolated_name<R: Rng + ?Sized>(rng: &mut R) -> String {
        format!("loadtest-{:08x}", rng.random::<u32>())
    }
}

/// Uniform pause between two tasks of a virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkTime {
    min: Duration,
    max: Duration,
}

impl ThinkTime {
    pub fn new(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvalidThinkTime { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        Duration::from_secs_f64(rng.random_range(self.min.as_secs_f64()..=self.max.as_secs_f64()))
    }
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(2),
            max: Duration::from_secs(5),
        }
    }
}

/// Engine settings. Immutable once built and shared behind an `Arc`.
#[derive(Debug, Clone, TypedBuilder)]
pub struct EngineConfig {
    #[builder(default = String::from("http://localhost:8080"), setter(into))]
    pub base_url: String,
    #[builder(default)]
    pub credentials: Credentials,
    #[builder(default)]
    pub realm: RealmStrategy,
    #[builder(default)]
    pub think_time: ThinkTime,
    /// Token refresh period, further capped by the token TTL.
    #[builder(default = Duration::from_secs(240))]
    pub refresh_interval: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub request_timeout: Duration,
    #[builder(default = 30)]
    pub readiness_attempts: u32,
    #[builder(default = Duration::from_secs(10))]
    pub readiness_interval: Duration,
    #[builder(default)]
    pub floors: Floors,
    #[builder(default = Arc::new(TaskCatalog::standard()))]
    pub catalog: Arc<TaskCatalog>,
    #[builder(default = 4096)]
    pub outcome_channel_capacity: usize,
    /// Fixed seed for reproducible task sequences. Each virtual user derives
    /// its own stream from it.
    #[builder(default, setter(strip_option))]
    pub seed: Option<u64>,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outcome_channel_capacity == 0 {
            return Err(ConfigError::ZeroChannelCapacity);
        }
        Ok(())
    }

    /// Random source for stream `stream` (typically a virtual user id) of the
    /// `run`-th run. With a fixed seed the sequence is reproducible, and no two
    /// runs of one scheduler share a stream, so generated entity names differ
    /// between runs.
    pub fn rng(&self, run: u64, stream: u64) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(
                (seed ^ run.wrapping_mul(0x9E37_79B9_7F4A_7C15)).wrapping_add(stream),
            ),
            None => StdRng::from_os_rng(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
