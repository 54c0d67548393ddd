use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

/// Maps tokio instants onto UTC timestamps.
///
/// All timestamps a run records go through one anchor, so differences between
/// them equal the tokio-measured durations. With a paused test runtime the
/// timestamps advance with simulated time.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    utc: DateTime<Utc>,
    instant: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            utc: Utc::now(),
            instant: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.at(Instant::now())
    }

    /// Instants earlier than the anchor map to the anchor itself.
    pub fn at(&self, instant: Instant) -> DateTime<Utc> {
        let offset = instant.saturating_duration_since(self.instant);
        TimeDelta::from_std(offset)
            .ok()
            .and_then(|delta| self.utc.checked_add_signed(delta))
            .unwrap_or(self.utc)
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}
