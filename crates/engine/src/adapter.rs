//! Per-exchange adapters: endpoint paths, credential headers, ticker payloads
//!
//! Each supported exchange gets one [`ExchangeAdapter`] implementation, chosen
//! by the descriptor's [`AdapterKind`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::credentials::CredentialSet;
use crate::registry::ExchangeDescriptor;

/// Header carrying the primary API key
pub const API_KEY_HEADER: &str = "X-API-KEY";

/// One 24h ticker record as reported by an exchange, before normalization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTicker {
    pub symbol: String,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub price_change: Option<Decimal>,
    /// Milliseconds since the epoch
    pub close_time: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Binance,
    Ascendex,
    Kucoin,
    /// Binance-shaped payloads, headers derived from field names
    Generic,
}

impl AdapterKind {
    pub fn adapter(self) -> &'static dyn ExchangeAdapter {
        match self {
            AdapterKind::Binance => &BinanceAdapter,
            AdapterKind::Ascendex => &AscendexAdapter,
            AdapterKind::Kucoin => &KucoinAdapter,
            AdapterKind::Generic => &GenericAdapter,
        }
    }
}

pub trait ExchangeAdapter: Send + Sync {
    /// Lightweight liveness endpoint, relative to the REST base
    fn ping_path(&self) -> &'static str {
        "/ping"
    }

    /// Batched 24h statistics for every symbol
    fn ticker_path(&self) -> &'static str {
        "/ticker/24hr"
    }

    /// Header for an additional (non-primary) credential field
    fn field_header(&self, field: &str) -> Option<String>;

    fn parse_tickers(&self, body: &str) -> Result<Vec<RawTicker>, String>;
}

/// Headers for a REST call: the API key, plus one header per additional field
/// the descriptor declares. Fields the descriptor does not declare are ignored.
pub fn credential_headers(
    descriptor: &ExchangeDescriptor,
    credentials: &CredentialSet,
) -> Vec<(String, String)> {
    let adapter = descriptor.adapter.adapter();
    let mut headers = vec![(API_KEY_HEADER.to_string(), credentials.api_key.clone())];

    for spec in descriptor.additional_fields() {
        let Some(value) = credentials.additional_field(&spec.name) else {
            continue;
        };
        if let Some(header) = adapter.field_header(&spec.name) {
            headers.push((header, value.to_string()));
        }
    }
    headers
}

// ---------------------------------------------------------------------------
// Binance
// ---------------------------------------------------------------------------

pub struct BinanceAdapter;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceTicker {
    symbol: String,
    #[serde(default)]
    bid_price: Option<Value>,
    #[serde(default)]
    ask_price: Option<Value>,
    #[serde(default)]
    last_price: Option<Value>,
    #[serde(default)]
    volume: Option<Value>,
    #[serde(default)]
    price_change: Option<Value>,
    #[serde(default)]
    close_time: Option<i64>,
}

impl ExchangeAdapter for BinanceAdapter {
    fn field_header(&self, _field: &str) -> Option<String> {
        None
    }

    fn parse_tickers(&self, body: &str) -> Result<Vec<RawTicker>, String> {
        parse_binance_shape(body)
    }
}

fn parse_binance_shape(body: &str) -> Result<Vec<RawTicker>, String> {
    let tickers: Vec<BinanceTicker> =
        serde_json::from_str(body).map_err(|e| format!("invalid ticker payload: {e}"))?;

    Ok(tickers
        .into_iter()
        .map(|t| RawTicker {
            symbol: t.symbol,
            bid: decimal(t.bid_price.as_ref()),
            ask: decimal(t.ask_price.as_ref()),
            last: decimal(t.last_price.as_ref()),
            volume: decimal(t.volume.as_ref()),
            price_change: decimal(t.price_change.as_ref()),
            close_time: t.close_time,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// AscendEX
// ---------------------------------------------------------------------------

pub struct AscendexAdapter;

#[derive(Debug, Deserialize)]
struct AscendexResponse {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Vec<AscendexTicker>,
}

/// `bid`/`ask` are `[price, size]` pairs
#[derive(Debug, Deserialize)]
struct AscendexTicker {
    symbol: String,
    #[serde(default)]
    open: Option<Value>,
    #[serde(default)]
    close: Option<Value>,
    #[serde(default)]
    volume: Option<Value>,
    #[serde(default)]
    bid: Vec<Value>,
    #[serde(default)]
    ask: Vec<Value>,
}

impl ExchangeAdapter for AscendexAdapter {
    fn ticker_path(&self) -> &'static str {
        "/ticker"
    }

    fn field_header(&self, field: &str) -> Option<String> {
        (field == "accountGroup").then(|| "X-ACCOUNT-GROUP".to_string())
    }

    fn parse_tickers(&self, body: &str) -> Result<Vec<RawTicker>, String> {
        let response: AscendexResponse =
            serde_json::from_str(body).map_err(|e| format!("invalid ticker payload: {e}"))?;
        if response.code != 0 {
            return Err(format!(
                "AscendEX error {}: {}",
                response.code,
                response.message.unwrap_or_default()
            ));
        }

        Ok(response
            .data
            .into_iter()
            .map(|t| {
                let open = decimal(t.open.as_ref());
                let close = decimal(t.close.as_ref());
                RawTicker {
                    symbol: t.symbol,
                    bid: decimal(t.bid.first()),
                    ask: decimal(t.ask.first()),
                    last: close,
                    volume: decimal(t.volume.as_ref()),
                    price_change: close.zip(open).and_then(|(c, o)| c.checked_sub(o)),
                    close_time: None,
                }
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// KuCoin
// ---------------------------------------------------------------------------

pub struct KucoinAdapter;

#[derive(Debug, Deserialize)]
struct KucoinResponse {
    code: String,
    #[serde(default)]
    msg: Option<String>,
    data: Option<KucoinTickers>,
}

#[derive(Debug, Deserialize)]
struct KucoinTickers {
    #[serde(default)]
    time: Option<i64>,
    #[serde(default)]
    ticker: Vec<KucoinTicker>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KucoinTicker {
    symbol: String,
    #[serde(default)]
    buy: Option<Value>,
    #[serde(default)]
    sell: Option<Value>,
    #[serde(default)]
    last: Option<Value>,
    #[serde(default)]
    vol: Option<Value>,
    #[serde(default)]
    change_price: Option<Value>,
}

impl ExchangeAdapter for KucoinAdapter {
    fn ping_path(&self) -> &'static str {
        "/timestamp"
    }

    fn ticker_path(&self) -> &'static str {
        "/market/allTickers"
    }

    fn field_header(&self, field: &str) -> Option<String> {
        (field == "passphrase").then(|| "X-API-PASSPHRASE".to_string())
    }

    fn parse_tickers(&self, body: &str) -> Result<Vec<RawTicker>, String> {
        let response: KucoinResponse =
            serde_json::from_str(body).map_err(|e| format!("invalid ticker payload: {e}"))?;
        if response.code != "200000" {
            return Err(format!(
                "KuCoin error {}: {}",
                response.code,
                response.msg.unwrap_or_default()
            ));
        }
        let Some(data) = response.data else {
            return Ok(Vec::new());
        };

        Ok(data
            .ticker
            .into_iter()
            .map(|t| RawTicker {
                symbol: t.symbol,
                bid: decimal(t.buy.as_ref()),
                ask: decimal(t.sell.as_ref()),
                last: decimal(t.last.as_ref()),
                volume: decimal(t.vol.as_ref()),
                price_change: decimal(t.change_price.as_ref()),
                close_time: data.time,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Generic
// ---------------------------------------------------------------------------

pub struct GenericAdapter;

impl ExchangeAdapter for GenericAdapter {
    fn field_header(&self, field: &str) -> Option<String> {
        Some(match field {
            "passphrase" => "X-API-PASSPHRASE".to_string(),
            "accountGroup" => "X-ACCOUNT-GROUP".to_string(),
            other => format!("X-{}", header_case(other)),
        })
    }

    fn parse_tickers(&self, body: &str) -> Result<Vec<RawTicker>, String> {
        parse_binance_shape(body)
    }
}

/// `accountGroup` -> `ACCOUNT-GROUP`
fn header_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len() + 4);
    for (i, c) in field.chars().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            out.push('-');
        }
        if c == '_' {
            out.push('-');
        } else {
            out.push(c.to_ascii_uppercase());
        }
    }
    out
}

/// Numeric strings and JSON numbers both parse; anything else is `None`
fn decimal(value: Option<&Value>) -> Option<Decimal> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}
