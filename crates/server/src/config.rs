//! Process configuration from the environment (and `.env`)

use anyhow::Context;
use engine::{EndpointOverride, EngineConfig, ExchangeRegistry};
use persistence::{CredentialBackend, Database, JsonFileBackend, MemoryBackend, SqliteBackend};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const ENV_PREFIX: &str = "SPREADWATCH_";
const DEFAULT_STORE_PATH: &str = "data/credentials.db";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `.json` selects the JSON file backend, anything else SQLite
    pub store_path: PathBuf,
    /// Keep credentials in memory only
    pub ephemeral: bool,
    pub engine: EngineConfig,
    pub endpoints: Vec<EndpointOverride>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty())
        };

        let mut engine = EngineConfig::default();
        if let Some(secs) = parse::<f64>(&var, "POLL_SECS")? {
            engine.poll_interval = seconds(secs, "POLL_SECS")?;
        }
        if let Some(secs) = parse::<f64>(&var, "RECONNECT_SECS")? {
            engine.reconnect.delay = seconds(secs, "RECONNECT_SECS")?;
        }
        engine.reconnect.backoff_factor = parse(&var, "RECONNECT_BACKOFF")?;
        if let Some(secs) = parse::<f64>(&var, "RECONNECT_MAX_DELAY_SECS")? {
            engine.reconnect.max_delay = Some(seconds(secs, "RECONNECT_MAX_DELAY_SECS")?);
        }
        engine.reconnect.max_attempts = parse(&var, "RECONNECT_MAX_ATTEMPTS")?;
        if let Some(secs) = parse::<f64>(&var, "HANDSHAKE_TIMEOUT_SECS")? {
            engine.handshake_timeout = seconds(secs, "HANDSHAKE_TIMEOUT_SECS")?;
        }
        if let Some(secs) = parse::<f64>(&var, "FETCH_TIMEOUT_SECS")? {
            engine.fetch_timeout = seconds(secs, "FETCH_TIMEOUT_SECS")?;
        }
        if let Some(top_n) = parse(&var, "TOP_N")? {
            engine.top_n = top_n;
        }

        let endpoints = ExchangeRegistry::builtin()
            .list()
            .iter()
            .filter_map(|d| {
                let key = d.id.to_uppercase();
                let base_url = var(&format!("{key}_BASE_URL"));
                let ws_url = var(&format!("{key}_WS_URL"));
                (base_url.is_some() || ws_url.is_some()).then(|| EndpointOverride {
                    exchange_id: d.id.clone(),
                    base_url,
                    ws_url,
                })
            })
            .collect();

        Ok(Self {
            store_path: var("STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH)),
            ephemeral: false,
            engine,
            endpoints,
        })
    }

    pub fn registry(&self) -> ExchangeRegistry {
        ExchangeRegistry::builtin_with(&self.endpoints)
    }

    fn uses_json(&self) -> bool {
        self.store_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
    }

    pub async fn open_backend(&self) -> anyhow::Result<Arc<dyn CredentialBackend>> {
        if self.ephemeral {
            info!("Credential store: in-memory");
            return Ok(Arc::new(MemoryBackend::new()));
        }
        if self.uses_json() {
            info!(path = %self.store_path.display(), "Credential store: JSON file");
            return Ok(Arc::new(JsonFileBackend::new(&self.store_path)));
        }

        let db = Database::new(&self.store_path)
            .await
            .with_context(|| format!("opening credential database {}", self.store_path.display()))?;
        info!(path = %self.store_path.display(), "Credential store: SQLite");
        Ok(Arc::new(SqliteBackend::new(db.pool_clone())))
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{ENV_PREFIX}{name}={raw}: {e}"))
        })
        .transpose()
}

fn seconds(secs: f64, name: &str) -> anyhow::Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        anyhow::bail!("{ENV_PREFIX}{name} must be a positive number of seconds");
    }
    let duration = Duration::try_from_secs_f64(secs)
        .map_err(|e| anyhow::anyhow!("{ENV_PREFIX}{name}={secs}: {e}"))?;
    if duration.is_zero() {
        anyhow::bail!("{ENV_PREFIX}{name} is too small to be a duration");
    }
    Ok(duration)
}
