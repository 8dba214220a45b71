use serde::{Deserialize, Serialize};
use std::fmt;

/// Long names that show up in source tables instead of tickers.
const KNOWN_ALIASES: &[(&str, &str)] = &[
    ("BITCOIN", "BTC"),
    ("ETHEREUM", "ETH"),
    ("SOLANA", "SOL"),
    ("CARDANO", "ADA"),
    ("RIPPLE", "XRP"),
    ("DOGECOIN", "DOGE"),
    ("POLKADOT", "DOT"),
    ("LITECOIN", "LTC"),
    ("CHAINLINK", "LINK"),
    ("AVALANCHE", "AVAX"),
    ("BINANCECOIN", "BNB"),
    ("TETHER", "USDT"),
];

/// Quote-currency spellings stripped from pair symbols (`BTC-USD`).
const QUOTE_SUFFIXES: &[&str] = &["-USDT", "-USD", "/USDT", "/USD"];

/// Canonical upper-case ticker, the partition key for every time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Normalize a raw symbol as found in any source table.
    ///
    /// Trims whitespace, upper-cases, strips a trailing quote currency
    /// (`BTCUSDT`, `BTC-USD`) and maps known long names to their ticker.
    /// Returns `None` for empty input.
    pub fn normalize(raw: &str) -> Option<Self> {
        let upper = raw.trim().to_uppercase();
        if upper.is_empty() {
            return None;
        }

        if let Some((_, ticker)) = KNOWN_ALIASES.iter().find(|(name, _)| *name == upper) {
            return Some(Self(ticker.to_string()));
        }

        let stripped = QUOTE_SUFFIXES
            .iter()
            .find_map(|suffix| upper.strip_suffix(suffix))
            .or_else(|| upper.strip_suffix("USDT").filter(|s| !s.is_empty()))
            .unwrap_or(upper.as_str());

        Some(Self(stripped.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Spellings under which this symbol may be stored in source tables.
    ///
    /// Covers every raw form `normalize` folds into this symbol: the bare
    /// ticker, known long names and the quote-currency pair spellings, each
    /// in upper and lower case.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases = vec![self.0.clone(), format!("{}USDT", self.0)];
        for suffix in QUOTE_SUFFIXES {
            aliases.push(format!("{}{}", self.0, suffix));
        }
        for (name, ticker) in KNOWN_ALIASES {
            if *ticker == self.0 {
                aliases.push(name.to_string());
            }
        }

        let lower: Vec<String> = aliases.iter().map(|a| a.to_lowercase()).collect();
        aliases.extend(lower);
        aliases
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
