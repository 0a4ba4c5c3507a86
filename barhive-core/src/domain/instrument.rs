//! Instrument — the (exchange, base, quote) partition key.
//!
//! All symbol-string parsing lives here: exchange-prefixed canonical forms,
//! delimited pairs, and flat concatenated tickers resolved by quote-suffix
//! matching. Callers never do their own suffix hacks.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Quote assets recognized when splitting flat tickers like `BTCUSDT`.
/// Longer suffixes are tried first so `USDT` wins over `USD`.
const KNOWN_QUOTES: [&str; 10] = [
    "USDT", "USDC", "BUSD", "TUSD", "USD", "EUR", "GBP", "BTC", "ETH", "BNB",
];

/// Immutable instrument key: (exchange, base, quote, optional subtype).
///
/// Canonical string form is `EXCHANGE:BASE/QUOTE`. Used as the partition and
/// namespace key throughout the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: String,
    pub base: String,
    pub quote: String,
    pub subtype: Option<String>,
}

impl Instrument {
    pub fn new(exchange: &str, base: &str, quote: &str) -> Self {
        Self {
            exchange: exchange.to_uppercase(),
            base: base.to_uppercase(),
            quote: quote.to_uppercase(),
            subtype: None,
        }
    }

    pub fn with_subtype(mut self, subtype: &str) -> Self {
        self.subtype = Some(subtype.to_uppercase());
        self
    }

    /// Canonical form: `EXCHANGE:BASE/QUOTE`.
    pub fn canonical(&self) -> String {
        format!("{}:{}/{}", self.exchange, self.base, self.quote)
    }

    /// Exchange ticker form: `BASEQUOTE` (e.g. `BTCUSDT`).
    pub fn pair_code(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// Directory component used by the partition layout: `BASE_QUOTE`.
    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.base, self.quote)
    }

    /// Parse a flexible symbol notation into an instrument key.
    ///
    /// Accepted forms: `EXCHANGE:BASE/QUOTE` (the embedded exchange wins over
    /// the `exchange` argument), `BASE/QUOTE`, `BASE-QUOTE`, `BASE_QUOTE`, and
    /// flat tickers like `BTCUSDT` resolved against [`KNOWN_QUOTES`].
    pub fn parse(exchange: &str, text: &str) -> Result<Self, InstrumentError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(InstrumentError::Unrecognized {
                symbol: text.to_string(),
            });
        }

        let (exchange, pair) = match text.split_once(':') {
            Some((ex, rest)) => (ex, rest),
            None => (exchange, text),
        };
        if exchange.trim().is_empty() {
            return Err(InstrumentError::MissingExchange {
                symbol: text.to_string(),
            });
        }

        for sep in ['/', '-', '_'] {
            if let Some((base, quote)) = pair.split_once(sep) {
                if base.is_empty() || quote.is_empty() {
                    return Err(InstrumentError::Unrecognized {
                        symbol: text.to_string(),
                    });
                }
                return Ok(Instrument::new(exchange, base, quote));
            }
        }

        // Flat ticker: match the longest known quote suffix.
        let upper = pair.to_uppercase();
        for quote in KNOWN_QUOTES {
            if let Some(base) = upper.strip_suffix(quote) {
                if !base.is_empty() {
                    return Ok(Instrument::new(exchange, base, quote));
                }
            }
        }

        Err(InstrumentError::Unrecognized {
            symbol: text.to_string(),
        })
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("unrecognized symbol notation '{symbol}'")]
    Unrecognized { symbol: String },

    #[error("no exchange given for symbol '{symbol}'")]
    MissingExchange { symbol: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_slash_pair() {
        let inst = Instrument::parse("binance", "BTC/USDT").unwrap();
        assert_eq!(inst.canonical(), "BINANCE:BTC/USDT");
    }

    #[test]
    fn parses_dash_and_underscore() {
        assert_eq!(
            Instrument::parse("kraken", "eth-usd").unwrap(),
            Instrument::new("KRAKEN", "ETH", "USD")
        );
        assert_eq!(
            Instrument::parse("kraken", "ETH_USD").unwrap(),
            Instrument::new("KRAKEN", "ETH", "USD")
        );
    }

    #[test]
    fn parses_flat_ticker_longest_suffix_first() {
        // Must resolve to BTC/USDT, not BTCUSD + T garbage or BTCU/SDT.
        let inst = Instrument::parse("binance", "BTCUSDT").unwrap();
        assert_eq!(inst.base, "BTC");
        assert_eq!(inst.quote, "USDT");
    }

    #[test]
    fn embedded_exchange_wins() {
        let inst = Instrument::parse("binance", "COINBASE:BTC/USD").unwrap();
        assert_eq!(inst.exchange, "COINBASE");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Instrument::parse("binance", "XYZQQQ").is_err());
        assert!(Instrument::parse("binance", "").is_err());
        assert!(Instrument::parse("binance", "/USDT").is_err());
    }

    #[test]
    fn dir_name_and_pair_code() {
        let inst = Instrument::new("binance", "btc", "usdt");
        assert_eq!(inst.dir_name(), "BTC_USDT");
        assert_eq!(inst.pair_code(), "BTCUSDT");
    }
}
