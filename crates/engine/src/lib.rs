//! Spreadwatch engine: exchange connectivity and market-data aggregation
//!
//! Provides:
//! - Exchange catalog with per-exchange credential schemas and adapters
//! - Validated credential store over an injected persistence backend
//! - Exchange connector (REST handshake, supervised streaming channel)
//! - Ranked spread view from live tickers or a synthetic market
//! - Demo/live mode gate and a fixed-cadence market poller

pub mod adapter;
pub mod aggregator;
pub mod config;
pub mod connector;
pub mod credentials;
pub mod error;
pub mod hub;
pub mod market;
pub mod mode;
pub mod poller;
pub mod registry;
pub mod synthetic;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use adapter::{AdapterKind, ExchangeAdapter, RawTicker};
pub use aggregator::{MarketAggregator, QuoteSource};
pub use config::{EngineConfig, ReconnectPolicy};
pub use connector::{ConnectionState, ExchangeConnector};
pub use credentials::{CredentialDraft, CredentialSet, CredentialStore, CredentialSummary};
pub use error::{EngineError, EngineResult};
pub use hub::{ConnectionStatus, ExchangeHub};
pub use market::MarketQuote;
pub use mode::{ModeController, ModeState, ModeView};
pub use poller::{ConnectorSlot, MarketPoller, MarketSnapshot};
pub use registry::{EndpointOverride, ExchangeDescriptor, ExchangeRegistry, FieldSpec};
pub use synthetic::SyntheticMarket;
pub use transport::{HttpTransport, ReqwestTransport, StreamTransport, TransportError, WsTransport};
