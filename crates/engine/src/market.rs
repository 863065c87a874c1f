//! Normalized market quotes and the ranking rule shared by live and synthetic data

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::adapter::RawTicker;

/// One trading pair's top-of-book snapshot with derived spread figures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketQuote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    /// ask - bid
    pub spread: Decimal,
    /// spread / bid * 100
    pub spread_pct: Decimal,
    pub volume_24h: Decimal,
    pub price_change_24h: Decimal,
    pub last_price: Decimal,
    pub last_update: DateTime<Utc>,
}

impl MarketQuote {
    /// Build a quote, deriving spread figures. `None` when `bid` is not
    /// positive or the derived figures overflow `Decimal`.
    pub fn new(
        symbol: impl Into<String>,
        bid: Decimal,
        ask: Decimal,
        volume_24h: Decimal,
        price_change_24h: Decimal,
        last_price: Decimal,
        last_update: DateTime<Utc>,
    ) -> Option<Self> {
        if bid <= Decimal::ZERO {
            return None;
        }
        let spread = ask.checked_sub(bid)?;
        let spread_pct = spread
            .checked_div(bid)?
            .checked_mul(Decimal::ONE_HUNDRED)?;
        Some(Self {
            symbol: symbol.into(),
            bid,
            ask,
            spread,
            spread_pct,
            volume_24h,
            price_change_24h,
            last_price,
            last_update,
        })
    }
}

/// Normalize one exchange record; records without a positive bid, ask and
/// volume are dropped, as are records whose spread overflows. Missing last
/// price / change count as zero.
pub fn normalize(raw: RawTicker, now: DateTime<Utc>) -> Option<MarketQuote> {
    let bid = raw.bid.filter(|v| *v > Decimal::ZERO)?;
    let ask = raw.ask.filter(|v| *v > Decimal::ZERO)?;
    let volume = raw.volume.filter(|v| *v > Decimal::ZERO)?;

    let last_update = raw
        .close_time
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or(now);

    MarketQuote::new(
        raw.symbol,
        bid,
        ask,
        volume,
        raw.price_change.unwrap_or_default(),
        raw.last.unwrap_or_default(),
        last_update,
    )
}

/// Sort by spread percentage, widest first, and keep the top `limit`
pub fn rank(mut quotes: Vec<MarketQuote>, limit: usize) -> Vec<MarketQuote> {
    quotes.sort_by(|a, b| b.spread_pct.cmp(&a.spread_pct));
    quotes.truncate(limit);
    quotes
}
