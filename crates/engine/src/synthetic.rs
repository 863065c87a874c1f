//! Synthetic ("demo") market data: a fixed symbol list around declared base prices

use chrono::Utc;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use crate::market::MarketQuote;

/// Symbols and base prices the demo market quotes
pub const DEMO_SYMBOLS: [(&str, f64); 10] = [
    ("BTC-USDT", 45000.0),
    ("ETH-USDT", 3000.0),
    ("BNB-USDT", 300.0),
    ("SOL-USDT", 100.0),
    ("ADA-USDT", 1.2),
    ("DOT-USDT", 20.0),
    ("AVAX-USDT", 80.0),
    ("MATIC-USDT", 1.5),
    ("LINK-USDT", 15.0),
    ("UNI-USDT", 10.0),
];

/// Spread is drawn from [MIN_SPREAD_RATIO, MIN_SPREAD_RATIO + SPREAD_JITTER) of the base price
const MIN_SPREAD_RATIO: f64 = 0.001;
const SPREAD_JITTER: f64 = 0.002;
/// 24h change stays within +/- half of this fraction of the base price
const CHANGE_RANGE: f64 = 0.05;
const MAX_VOLUME: f64 = 1_000_000.0;

#[derive(Debug, Clone)]
pub struct SyntheticMarket {
    symbols: Vec<(String, f64)>,
}

impl Default for SyntheticMarket {
    fn default() -> Self {
        Self::new(DEMO_SYMBOLS.iter().map(|(s, p)| (s.to_string(), *p)).collect())
    }
}

impl SyntheticMarket {
    pub fn new(symbols: Vec<(String, f64)>) -> Self {
        Self { symbols }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(|(s, _)| s.as_str())
    }

    /// One quote per symbol, in symbol-list order (unranked)
    pub fn generate(&self, rng: &mut impl Rng) -> Vec<MarketQuote> {
        let now = Utc::now();
        self.symbols
            .iter()
            .filter_map(|(symbol, base)| {
                let spread = base * (MIN_SPREAD_RATIO + rng.gen::<f64>() * SPREAD_JITTER);
                let bid = base - spread / 2.0;
                let ask = base + spread / 2.0;
                let change = (rng.gen::<f64>() - 0.5) * base * CHANGE_RANGE;
                // strictly positive so the quote passes the same filter as live data
                let volume = rng.gen_range(1.0..MAX_VOLUME);

                MarketQuote::new(
                    symbol.clone(),
                    to_decimal(bid),
                    to_decimal(ask),
                    to_decimal(volume),
                    to_decimal(change),
                    to_decimal(*base),
                    now,
                )
            })
            .collect()
    }
}

fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(8))
        .unwrap_or_default()
}
