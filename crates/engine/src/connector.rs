//! Per-exchange connection lifecycle
//!
//! A connector performs one REST handshake, then keeps a streaming channel
//! open in a supervisor task. Only the streaming channel is recovered
//! automatically; a failed handshake leaves the connector idle.
//!
//! ```text
//! Idle -> Connecting -> Connected <-> Reconnecting
//!            |              |             |
//!            v              +------+------+
//!     Failed -> Idle               v
//!                            Disconnected
//! ```

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{credential_headers, RawTicker};
use crate::config::{EngineConfig, ReconnectPolicy};
use crate::credentials::CredentialSet;
use crate::error::{EngineError, EngineResult};
use crate::registry::ExchangeDescriptor;
use crate::transport::{HttpResponse, HttpTransport, StreamTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

struct Inner {
    state: ConnectionState,
    credentials: Option<CredentialSet>,
    supervisor: Option<JoinHandle<()>>,
    /// Bumped by every connect and disconnect; stale tasks compare against it
    generation: u64,
    last_error: Option<String>,
}

impl Inner {
    /// Whether a supervisor started under `generation` may keep working
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
            && matches!(
                self.state,
                ConnectionState::Connected | ConnectionState::Reconnecting
            )
    }
}

/// State shared between the connector handle and its supervisor task
struct Shared {
    exchange_id: String,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    /// Mirrors `Inner::generation` so a supervisor can wake on a bump
    generation_tx: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Invalidate every supervisor started under the current generation
    fn next_generation(&self, inner: &mut Inner) -> u64 {
        inner.generation += 1;
        self.generation_tx.send_replace(inner.generation);
        inner.generation
    }

    fn transition(&self, inner: &mut Inner, next: ConnectionState) {
        let prev = inner.state;
        if prev == next {
            return;
        }
        inner.state = next;
        self.state_tx.send_replace(next);
        info!(exchange = %self.exchange_id, from = %prev, to = %next, "Connection state changed");
    }
}

pub struct ExchangeConnector {
    descriptor: Arc<ExchangeDescriptor>,
    http: Arc<dyn HttpTransport>,
    stream: Arc<dyn StreamTransport>,
    reconnect: ReconnectPolicy,
    handshake_timeout: Duration,
    fetch_timeout: Duration,
    shared: Arc<Shared>,
}

impl ExchangeConnector {
    pub fn new(
        descriptor: Arc<ExchangeDescriptor>,
        http: Arc<dyn HttpTransport>,
        stream: Arc<dyn StreamTransport>,
        config: &EngineConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (generation_tx, _) = watch::channel(0);
        let shared = Shared {
            exchange_id: descriptor.id.clone(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Idle,
                credentials: None,
                supervisor: None,
                generation: 0,
                last_error: None,
            }),
            state_tx,
            generation_tx,
        };
        Self {
            descriptor,
            http,
            stream,
            reconnect: config.reconnect.clone(),
            handshake_timeout: config.handshake_timeout,
            fetch_timeout: config.fetch_timeout,
            shared: Arc::new(shared),
        }
    }

    pub fn descriptor(&self) -> &ExchangeDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Most recent handshake or streaming failure, if any
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    /// Connected with credentials held
    pub fn is_connected(&self) -> bool {
        let inner = self.shared.lock();
        inner.state == ConnectionState::Connected && inner.credentials.is_some()
    }

    /// Holding credentials, whether the stream is currently up or recovering
    pub fn has_credentials(&self) -> bool {
        self.shared.lock().credentials.is_some()
    }

    /// The credential set in use, if any
    pub fn credentials(&self) -> Option<CredentialSet> {
        self.shared.lock().credentials.clone()
    }

    /// Handshake and, on success, start the streaming supervisor.
    /// Returns `true` only when the handshake succeeded.
    pub async fn connect(&self, credentials: &CredentialSet) -> bool {
        self.try_connect(credentials).await.is_ok()
    }

    /// [`connect`](Self::connect) with the failure reason
    pub async fn try_connect(&self, credentials: &CredentialSet) -> EngineResult<()> {
        if credentials.exchange_id != self.descriptor.id {
            return Err(EngineError::validation(
                "exchangeId",
                format!(
                    "credential set is for {}, connector is for {}",
                    credentials.exchange_id, self.descriptor.id
                ),
            ));
        }

        let generation = {
            let mut inner = self.shared.lock();
            if inner.state == ConnectionState::Connecting {
                return Err(EngineError::Connection(
                    "a connection attempt is already in progress".into(),
                ));
            }
            // reconnecting with new credentials replaces the running session
            if let Some(handle) = inner.supervisor.take() {
                handle.abort();
            }
            inner.credentials = None;
            let generation = self.shared.next_generation(&mut inner);
            self.shared.transition(&mut inner, ConnectionState::Connecting);
            generation
        };

        let outcome = self.handshake(credentials).await;

        let mut inner = self.shared.lock();
        if inner.generation != generation {
            debug!(exchange = %self.descriptor.id, "Handshake finished after disconnect, ignoring");
            return Err(EngineError::Connection("connection attempt was cancelled".into()));
        }

        match outcome {
            Err(e) => {
                warn!(exchange = %self.descriptor.id, error = %e, "Handshake failed");
                inner.last_error = Some(e.to_string());
                self.shared.transition(&mut inner, ConnectionState::Failed);
                self.shared.transition(&mut inner, ConnectionState::Idle);
                Err(EngineError::connection(e))
            }
            Ok(_) => {
                inner.credentials = Some(credentials.clone());
                inner.last_error = None;
                self.shared.transition(&mut inner, ConnectionState::Connected);

                let handle = tokio::spawn(supervise(
                    self.shared.clone(),
                    self.stream.clone(),
                    self.descriptor.ws_url.clone(),
                    self.reconnect.clone(),
                    generation,
                ));
                inner.supervisor = Some(handle);
                Ok(())
            }
        }
    }

    async fn handshake(&self, credentials: &CredentialSet) -> Result<HttpResponse, TransportError> {
        let url = self.descriptor.rest_url(self.descriptor.adapter.adapter().ping_path());
        let headers = credential_headers(&self.descriptor, credentials);
        debug!(exchange = %self.descriptor.id, url = %url, "Handshake");
        bounded_get(self.http.as_ref(), &url, &headers, self.handshake_timeout).await
    }

    /// Stop the streaming supervisor and forget the credentials.
    ///
    /// Once this returns no reconnect attempt will start. Calling it again,
    /// or on a connector that never connected, does nothing.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        if let Some(handle) = inner.supervisor.take() {
            handle.abort();
        }
        self.shared.next_generation(&mut inner);
        inner.credentials = None;
        if matches!(
            inner.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            self.shared.transition(&mut inner, ConnectionState::Disconnected);
        }
    }

    /// One batched 24h ticker request, parsed by the exchange adapter
    pub async fn fetch_tickers(&self) -> EngineResult<Vec<RawTicker>> {
        let credentials = self
            .credentials()
            .ok_or_else(|| EngineError::Fetch(format!("{} is not connected", self.descriptor.id)))?;

        let adapter = self.descriptor.adapter.adapter();
        let url = self.descriptor.rest_url(adapter.ticker_path());
        let headers = credential_headers(&self.descriptor, &credentials);

        let response = bounded_get(self.http.as_ref(), &url, &headers, self.fetch_timeout)
            .await
            .map_err(EngineError::fetch)?;

        let tickers = adapter.parse_tickers(&response.body).map_err(EngineError::Fetch)?;
        debug!(exchange = %self.descriptor.id, count = tickers.len(), "Fetched tickers");
        Ok(tickers)
    }
}

impl Drop for ExchangeConnector {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.lock().supervisor.take() {
            handle.abort();
        }
    }
}

async fn bounded_get(
    http: &dyn HttpTransport,
    url: &str,
    headers: &[(String, String)],
    limit: Duration,
) -> Result<HttpResponse, TransportError> {
    match tokio::time::timeout(limit, http.get(url, headers)).await {
        Ok(result) => result?.error_for_status(),
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}

/// Resolves once the connector has moved past `generation`
async fn superseded(rx: &mut watch::Receiver<u64>, generation: u64) {
    // a dropped sender means the connector is gone
    let _ = rx.wait_for(|current| *current != generation).await;
}

/// Keep the streaming channel open until the generation changes.
///
/// Every await races against a generation bump, so a disconnect cancels an
/// in-flight open, read or reconnect delay even before the task abort lands.
async fn supervise(
    shared: Arc<Shared>,
    stream: Arc<dyn StreamTransport>,
    ws_url: String,
    policy: ReconnectPolicy,
    generation: u64,
) {
    let mut generation_rx = shared.generation_tx.subscribe();
    let mut failures: u32 = 0;

    loop {
        if !shared.lock().is_current(generation) {
            return;
        }

        let opened = tokio::select! {
            biased;
            _ = superseded(&mut generation_rx, generation) => {
                debug!(exchange = %shared.exchange_id, "Stream open cancelled");
                return;
            }
            opened = stream.open(&ws_url) => opened,
        };

        match opened {
            Ok(mut session) => {
                let current = {
                    let mut inner = shared.lock();
                    let current = inner.is_current(generation);
                    if current {
                        shared.transition(&mut inner, ConnectionState::Connected);
                    }
                    current
                };
                if !current {
                    session.close().await;
                    return;
                }
                failures = 0;
                info!(exchange = %shared.exchange_id, url = %ws_url, "Stream opened");

                let mut messages: u64 = 0;
                let peer_closed = loop {
                    tokio::select! {
                        biased;
                        _ = superseded(&mut generation_rx, generation) => break false,
                        message = session.next_message() => match message {
                            Some(_) => messages += 1,
                            None => break true,
                        },
                    }
                };
                if !peer_closed {
                    session.close().await;
                    return;
                }
                warn!(exchange = %shared.exchange_id, messages, "Stream closed");
            }
            Err(e) => {
                warn!(exchange = %shared.exchange_id, error = %e, "Stream open failed");
                shared.lock().last_error = Some(e.to_string());
            }
        }

        failures += 1;
        {
            let mut inner = shared.lock();
            if !inner.is_current(generation) {
                return;
            }
            if !policy.allows(failures) {
                warn!(
                    exchange = %shared.exchange_id,
                    attempts = failures,
                    "Reconnect attempts exhausted"
                );
                inner.credentials = None;
                inner.supervisor = None;
                inner.last_error = Some(format!("stream lost after {failures} attempts"));
                shared.transition(&mut inner, ConnectionState::Failed);
                return;
            }
            shared.transition(&mut inner, ConnectionState::Reconnecting);
        }

        let delay = policy.delay_for(failures);
        debug!(exchange = %shared.exchange_id, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        tokio::select! {
            biased;
            _ = superseded(&mut generation_rx, generation) => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
