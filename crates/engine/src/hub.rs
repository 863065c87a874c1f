//! Wires stored credentials, connectors and the mode gate together

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::aggregator::MarketAggregator;
use crate::config::EngineConfig;
use crate::connector::{ConnectionState, ExchangeConnector};
use crate::credentials::{CredentialDraft, CredentialSet, CredentialStore, CredentialSummary};
use crate::error::EngineResult;
use crate::mode::ModeController;
use crate::poller::{ConnectorSlot, MarketPoller};
use crate::registry::ExchangeRegistry;
use crate::transport::{HttpTransport, StreamTransport};

/// Redacted view of the active connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub exchange_id: Option<String>,
    pub state: ConnectionState,
    pub connected: bool,
    pub credentials: Option<CredentialSummary>,
    pub last_error: Option<String>,
}

pub struct ExchangeHub {
    config: EngineConfig,
    store: Arc<CredentialStore>,
    mode: ModeController,
    slot: ConnectorSlot,
    http: Arc<dyn HttpTransport>,
    stream: Arc<dyn StreamTransport>,
    /// One connection test at a time
    connect_lock: tokio::sync::Mutex<()>,
}

impl ExchangeHub {
    pub fn new(
        config: EngineConfig,
        store: Arc<CredentialStore>,
        mode: ModeController,
        http: Arc<dyn HttpTransport>,
        stream: Arc<dyn StreamTransport>,
    ) -> Self {
        Self {
            config,
            store,
            mode,
            slot: ConnectorSlot::new(),
            http,
            stream,
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExchangeRegistry {
        self.store.registry()
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn mode(&self) -> &ModeController {
        &self.mode
    }

    pub fn active_connector(&self) -> Option<Arc<ExchangeConnector>> {
        self.slot.get()
    }

    /// A poller reading from this hub's mode and connector
    pub fn poller(&self) -> MarketPoller {
        MarketPoller::new(
            MarketAggregator::new(self.config.top_n),
            self.mode.clone(),
            self.slot.clone(),
            self.config.poll_interval,
        )
    }

    /// Test a stored set against its exchange. On success the new connector
    /// replaces any previous one and live mode is unlocked; on failure the
    /// previous connector is left alone.
    pub async fn connect_credentials(&self, id: &str) -> EngineResult<ConnectionStatus> {
        let _guard = self.connect_lock.lock().await;

        let set = self.store.get(id).await?;
        let descriptor = self.store.registry().lookup(&set.exchange_id)?;
        let connector = Arc::new(ExchangeConnector::new(
            descriptor,
            self.http.clone(),
            self.stream.clone(),
            &self.config,
        ));

        if let Err(e) = connector.try_connect(&set).await {
            warn!(id, exchange = %set.exchange_id, error = %e, "Connection test failed");
            return Err(e);
        }

        self.mode.set_can_disable_demo(true);
        if let Some(previous) = self.slot.replace(Some(connector)) {
            previous.disconnect();
        }
        info!(id, exchange = %set.exchange_id, "Connection test succeeded");
        self.mode.set_active_credentials(Some(set));
        Ok(self.status())
    }

    /// Drop the active connector, if any
    pub fn disconnect(&self) {
        if let Some(previous) = self.slot.replace(None) {
            previous.disconnect();
            info!(exchange = %previous.descriptor().id, "Active connection closed");
        }
        self.mode.set_active_credentials(None);
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.slot.get() {
            Some(connector) => ConnectionStatus {
                exchange_id: Some(connector.descriptor().id.clone()),
                state: connector.state(),
                connected: connector.is_connected(),
                credentials: connector.credentials().as_ref().map(CredentialSet::summary),
                last_error: connector.last_error(),
            },
            None => ConnectionStatus {
                exchange_id: None,
                state: ConnectionState::Idle,
                connected: false,
                credentials: None,
                last_error: None,
            },
        }
    }

    pub async fn save_credentials(&self, draft: CredentialDraft) -> EngineResult<CredentialSet> {
        self.store.save(draft).await
    }

    /// Delete a stored set. If it is the active one, the connection is closed
    /// once the delete has been persisted; a failed write keeps it open.
    pub async fn delete_credentials(&self, id: &str) -> EngineResult<()> {
        let _guard = self.connect_lock.lock().await;
        let is_active = self
            .mode
            .snapshot()
            .active_credentials
            .is_some_and(|active| active.id == id);
        self.store.delete(id).await?;
        if is_active {
            self.disconnect();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::testing::{settle, MockHttp, MockStream};
    use async_trait::async_trait;
    use persistence::{CredentialBackend, CredentialRecord, DbError, DbResult, MemoryBackend};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory backend whose writes can be switched to fail
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl CredentialBackend for FlakyBackend {
        async fn load_all(&self) -> DbResult<Vec<CredentialRecord>> {
            self.inner.load_all().await
        }

        async fn store_all(&self, records: &[CredentialRecord]) -> DbResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(DbError::Query("disk full".into()));
            }
            self.inner.store_all(records).await
        }
    }

    struct Fixture {
        hub: ExchangeHub,
        http: Arc<MockHttp>,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryBackend::new()))
    }

    fn fixture_with(backend: Arc<dyn CredentialBackend>) -> Fixture {
        let registry = Arc::new(ExchangeRegistry::builtin());
        let store = Arc::new(CredentialStore::new(backend, registry));
        let http = MockHttp::new();
        http.respond("https://api.binance.com/api/v3/ping", 200, "{}");
        http.respond("https://api.kucoin.com/api/v1/timestamp", 200, "{}");
        let hub = ExchangeHub::new(
            EngineConfig::default(),
            store,
            ModeController::new(),
            http.clone(),
            MockStream::new(),
        );
        Fixture { hub, http }
    }

    async fn saved(hub: &ExchangeHub, exchange: &str) -> CredentialSet {
        let mut draft = CredentialDraft::new("main", exchange, "key-12345678", "secret");
        if exchange == "kucoin" {
            draft = draft.with_field("passphrase", "pass");
        }
        hub.save_credentials(draft).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_connect_unlocks_live_mode() {
        let f = fixture();
        let set = saved(&f.hub, "binance").await;
        assert!(!f.hub.mode().can_disable_demo());

        let status = f.hub.connect_credentials(&set.id).await.unwrap();
        assert!(status.connected);
        assert_eq!(status.exchange_id.as_deref(), Some("binance"));
        assert_eq!(status.credentials.unwrap().api_key_hint, "key-…5678");

        let mode = f.hub.mode().snapshot();
        assert!(mode.can_disable_demo);
        assert!(mode.demo_mode);
        assert_eq!(mode.active_credentials.unwrap().id, set.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_connect_keeps_demo_locked() {
        let f = fixture();
        f.http.respond("https://api.binance.com/api/v3/ping", 403, "forbidden");
        let set = saved(&f.hub, "binance").await;

        let err = f.hub.connect_credentials(&set.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Connection(_)));
        assert!(!f.hub.mode().can_disable_demo());
        assert!(f.hub.active_connector().is_none());
        assert_eq!(f.hub.status().state, ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_credential_id() {
        let f = fixture();
        let err = f.hub.connect_credentials("404").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_connection_replaces_previous() {
        let f = fixture();
        let first = saved(&f.hub, "binance").await;
        let second = saved(&f.hub, "kucoin").await;

        f.hub.connect_credentials(&first.id).await.unwrap();
        let previous = f.hub.active_connector().unwrap();
        settle().await;

        f.hub.connect_credentials(&second.id).await.unwrap();
        assert_eq!(previous.state(), ConnectionState::Disconnected);
        assert_eq!(f.hub.status().exchange_id.as_deref(), Some("kucoin"));
        assert_eq!(f.hub.mode().snapshot().active_credentials.unwrap().id, second.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleting_active_set_disconnects() {
        let f = fixture();
        let set = saved(&f.hub, "binance").await;
        f.hub.connect_credentials(&set.id).await.unwrap();
        let connector = f.hub.active_connector().unwrap();

        f.hub.delete_credentials(&set.id).await.unwrap();
        assert_eq!(connector.state(), ConnectionState::Disconnected);
        assert!(f.hub.active_connector().is_none());
        assert!(f.hub.mode().snapshot().active_credentials.is_none());
        // live mode stays unlocked for the session
        assert!(f.hub.mode().can_disable_demo());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delete_keeps_active_connection() {
        let backend = Arc::new(FlakyBackend::default());
        let f = fixture_with(backend.clone());
        let set = saved(&f.hub, "binance").await;
        f.hub.connect_credentials(&set.id).await.unwrap();
        let connector = f.hub.active_connector().unwrap();

        backend.fail_writes.store(true, Ordering::SeqCst);
        let err = f.hub.delete_credentials(&set.id).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));

        assert_eq!(connector.state(), ConnectionState::Connected);
        assert!(f.hub.status().connected);
        assert_eq!(f.hub.mode().snapshot().active_credentials.unwrap().id, set.id);
        assert!(f.hub.store().get(&set.id).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_follows_hub_connection() {
        let f = fixture();
        f.http.respond(
            "https://api.binance.com/api/v3/ticker/24hr",
            200,
            r#"[{"symbol":"BTCUSDT","bidPrice":"100","askPrice":"100.2","lastPrice":"100.1",
                "volume":"3","priceChange":"0.4"}]"#,
        );
        let set = saved(&f.hub, "binance").await;
        f.hub.connect_credentials(&set.id).await.unwrap();
        f.hub.mode().toggle_demo_mode();

        let poller = f.hub.poller();
        let snapshot = poller.refresh().await;
        assert_eq!(snapshot.quotes.len(), 1);
        assert_eq!(snapshot.quotes[0].symbol, "BTCUSDT");
    }
}
