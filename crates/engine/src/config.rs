//! Engine tuning knobs

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Streaming-channel recovery policy.
///
/// The default retries forever with a fixed delay. `backoff_factor`,
/// `max_delay` and `max_attempts` are opt-in departures from that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    #[serde(with = "duration_ms")]
    pub delay: Duration,
    pub backoff_factor: Option<f64>,
    #[serde(with = "option_duration_ms")]
    pub max_delay: Option<Duration>,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            backoff_factor: None,
            max_delay: None,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let Some(factor) = self.backoff_factor.filter(|f| *f > 1.0) else {
            return self.delay;
        };
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.delay.as_secs_f64() * factor.powi(exp);
        let delay = Duration::from_secs_f64(scaled.min(u32::MAX as f64));
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// Whether another attempt is allowed after `attempts_made` failed ones
    pub fn allows(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Market poll cadence
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    pub reconnect: ReconnectPolicy,
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub fetch_timeout: Duration,
    /// Length of the ranked quote list
    pub top_n: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_secs(10),
            fetch_timeout: Duration::from_secs(15),
            top_n: 10,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
