//! Ranked market view from either a live connector or the synthetic market

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::Mutex;
use tracing::debug;

use crate::connector::ExchangeConnector;
use crate::error::EngineResult;
use crate::market::{normalize, rank, MarketQuote};
use crate::synthetic::SyntheticMarket;

/// Where a ranked list came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QuoteSource {
    Synthetic,
    Live {
        #[serde(rename = "exchangeId")]
        exchange_id: String,
    },
}

/// Live only when demo mode is off and the connector holds credentials
pub fn source_for(demo: bool, connector: Option<&ExchangeConnector>) -> QuoteSource {
    match connector {
        Some(connector) if !demo && connector.has_credentials() => QuoteSource::Live {
            exchange_id: connector.descriptor().id.clone(),
        },
        _ => QuoteSource::Synthetic,
    }
}

/// Stateless with respect to scheduling: each call is one fetch
pub struct MarketAggregator {
    synthetic: SyntheticMarket,
    rng: Mutex<StdRng>,
    top_n: usize,
}

impl MarketAggregator {
    pub fn new(top_n: usize) -> Self {
        Self::with_rng(top_n, StdRng::from_entropy())
    }

    pub fn with_rng(top_n: usize, rng: StdRng) -> Self {
        Self {
            synthetic: SyntheticMarket::default(),
            rng: Mutex::new(rng),
            top_n,
        }
    }

    pub fn top_n(&self) -> usize {
        self.top_n
    }

    /// Live quotes when `demo` is off and `connector` holds credentials,
    /// synthetic quotes otherwise. A failed live fetch is returned as is.
    pub async fn fetch_ranked(
        &self,
        demo: bool,
        connector: Option<&ExchangeConnector>,
    ) -> EngineResult<Vec<MarketQuote>> {
        match (source_for(demo, connector), connector) {
            (QuoteSource::Live { .. }, Some(connector)) => self.fetch_live(connector).await,
            _ => Ok(self.synthetic_ranked()),
        }
    }

    pub fn synthetic_ranked(&self) -> Vec<MarketQuote> {
        let quotes = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.synthetic.generate(&mut *rng)
        };
        rank(quotes, self.top_n)
    }

    async fn fetch_live(&self, connector: &ExchangeConnector) -> EngineResult<Vec<MarketQuote>> {
        let raw = connector.fetch_tickers().await?;
        let received = raw.len();
        let now = Utc::now();
        let quotes: Vec<MarketQuote> = raw.into_iter().filter_map(|t| normalize(t, now)).collect();
        debug!(
            exchange = %connector.descriptor().id,
            received,
            usable = quotes.len(),
            "Normalized tickers"
        );
        Ok(rank(quotes, self.top_n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::credentials::CredentialSet;
    use crate::error::EngineError;
    use crate::registry::ExchangeRegistry;
    use crate::testing::{MockHttp, MockStream};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn aggregator() -> MarketAggregator {
        MarketAggregator::with_rng(10, StdRng::seed_from_u64(3))
    }

    async fn connected(body: &str, status: u16) -> (ExchangeConnector, Arc<MockHttp>) {
        let descriptor = ExchangeRegistry::builtin().lookup("binance").unwrap();
        let http = MockHttp::new();
        http.respond(&descriptor.rest_url("/ping"), 200, "{}");
        http.respond(&descriptor.rest_url("/ticker/24hr"), status, body);
        let connector =
            ExchangeConnector::new(descriptor, http.clone(), MockStream::new(), &EngineConfig::default());
        let creds = CredentialSet {
            id: "1".into(),
            name: "main".into(),
            exchange_id: "binance".into(),
            api_key: "k".into(),
            secret_key: "s".into(),
            additional_fields: BTreeMap::new(),
        };
        assert!(connector.connect(&creds).await);
        (connector, http)
    }

    fn ticker_json(symbol: &str, bid: &str, ask: &str, volume: &str) -> String {
        format!(
            r#"{{"symbol":"{symbol}","bidPrice":"{bid}","askPrice":"{ask}","lastPrice":"{bid}",
                "volume":"{volume}","priceChange":"0.5","closeTime":1700000000000}}"#
        )
    }

    #[tokio::test]
    async fn test_demo_mode_returns_ranked_synthetic_quotes() {
        let agg = aggregator();
        for _ in 0..5 {
            let quotes = agg.fetch_ranked(true, None).await.unwrap();
            assert_eq!(quotes.len(), 10);
            assert!(quotes.windows(2).all(|w| w[0].spread_pct >= w[1].spread_pct));
        }
    }

    #[tokio::test]
    async fn test_synthetic_list_shorter_than_limit() {
        let agg = MarketAggregator::with_rng(25, StdRng::seed_from_u64(1));
        assert_eq!(agg.fetch_ranked(true, None).await.unwrap().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_quotes_filtered_and_ranked() {
        let mut records = vec![
            ticker_json("ZERO_BID", "0", "1", "10"),
            ticker_json("NEG_ASK", "1", "-1", "10"),
            ticker_json("NO_VOLUME", "1", "2", "0"),
            ticker_json("JUNK", "abc", "2", "10"),
        ];
        for i in 1..=12 {
            let ask = Decimal::from(100 + i);
            records.push(ticker_json(&format!("P{i}"), "100", &ask.to_string(), "5"));
        }
        let body = format!("[{}]", records.join(","));
        let (connector, _http) = connected(&body, 200).await;

        let quotes = aggregator().fetch_ranked(false, Some(&connector)).await.unwrap();
        assert_eq!(quotes.len(), 10);
        assert_eq!(quotes[0].symbol, "P12");
        assert_eq!(quotes[0].spread_pct, dec!(12));
        assert_eq!(quotes[9].symbol, "P3");
        assert!(quotes.iter().all(|q| q.bid > Decimal::ZERO && q.volume_24h > Decimal::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_failure_does_not_fall_back() {
        let (connector, _http) = connected("oops", 503).await;
        let err = aggregator()
            .fetch_ranked(false, Some(&connector))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Fetch(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_mode_ignores_live_connector() {
        let (connector, http) = connected("[]", 200).await;
        let quotes = aggregator().fetch_ranked(true, Some(&connector)).await.unwrap();
        assert_eq!(quotes.len(), 10);
        assert_eq!(http.request_count(&connector.descriptor().rest_url("/ticker/24hr")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_connector_uses_synthetic() {
        let (connector, http) = connected("[]", 200).await;
        connector.disconnect();
        let quotes = aggregator().fetch_ranked(false, Some(&connector)).await.unwrap();
        assert_eq!(quotes.len(), 10);
        assert_eq!(http.request_count(&connector.descriptor().rest_url("/ticker/24hr")), 0);
    }
}
