use crate::errors::{ConfigError, OracleError};
use crate::quote::Quote;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Mutex;

/// Source of current instrument prices.
///
/// Implementations must be safe to call from many connection threads at once.
/// A remote feed would return [`OracleError::Unavailable`] for transport
/// failures; callers treat that as transient.
pub trait PriceOracle: Send + Sync {
    /// Current price of `instrument`.
    fn quote(&self, instrument: &str) -> Result<f64, OracleError>;

    /// All tracked instrument symbols, sorted.
    fn instruments(&self) -> Vec<String>;
}

/// A price change large enough to be reported as an alert.
#[derive(Clone, Debug, PartialEq)]
pub struct PriceMove {
    /// Instrument that moved.
    pub instrument: String,
    /// Price when the previous move was reported (or the initial price).
    pub from: f64,
    /// Current price.
    pub to: f64,
}

impl PriceMove {
    /// Relative change `to / from - 1`.
    pub fn change(&self) -> f64 {
        self.to / self.from - 1.0
    }
}

/// Local price simulator.
///
/// The instrument universe is fixed at construction. Every quote sits behind
/// its own mutex, so concurrent lookups of different instruments never
/// contend and the per-call jitter of one instrument is applied atomically.
#[derive(Debug)]
pub struct SimulatedOracle {
    quotes: HashMap<String, Mutex<Quote>>,
    /// Maximum relative move per call, in `[0, 1)`.
    jitter: f64,
    /// Cumulative move reported by [`tick`](Self::tick).
    alert_threshold: f64,
}

impl SimulatedOracle {
    /// Creates an oracle over the given quotes.
    ///
    /// # Errors
    /// Returns [`OracleError::InvalidJitter`] if `jitter` is outside `[0, 1)`.
    pub fn new(
        quotes: Vec<Quote>,
        jitter: f64,
        alert_threshold: f64,
    ) -> Result<Self, OracleError> {
        if !(0.0..1.0).contains(&jitter) {
            return Err(OracleError::InvalidJitter(jitter));
        }
        let quotes = quotes
            .into_iter()
            .map(|q| (q.instrument.to_ascii_uppercase(), Mutex::new(q)))
            .collect();
        Ok(Self {
            quotes,
            jitter,
            alert_threshold,
        })
    }

    /// Loads the instrument universe from a file, one instrument per line.
    ///
    /// A line is either `SYMBOL` or `SYMBOL PRICE`. Blank lines and lines
    /// starting with `#` are skipped. Instruments without a price start at a
    /// random one.
    pub fn from_config<P: AsRef<Path>>(
        path: P,
        jitter: f64,
        alert_threshold: f64,
    ) -> Result<Self, ConfigError> {
        log::info!("Loading instruments from: {:?}", path.as_ref());
        let file = File::open(&path)?;
        let reader = BufReader::new(file);

        let mut quotes = Vec::new();
        let mut seen = HashSet::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let symbol = parts.next().unwrap_or_default().to_ascii_uppercase();
            if !seen.insert(symbol.clone()) {
                return Err(ConfigError::InvalidLine {
                    line: idx + 1,
                    reason: format!("duplicate instrument {}", symbol),
                });
            }
            let quote = match (parts.next(), parts.next()) {
                (None, _) => Quote::new(&symbol),
                (Some(price), None) => {
                    let price: f64 = price.parse().map_err(|_| ConfigError::InvalidLine {
                        line: idx + 1,
                        reason: format!("bad price '{}'", price),
                    })?;
                    if !price.is_finite() || price <= 0.0 {
                        return Err(ConfigError::InvalidLine {
                            line: idx + 1,
                            reason: format!("price must be positive, got {}", price),
                        });
                    }
                    Quote::with_price(&symbol, price)
                }
                (Some(_), Some(_)) => {
                    return Err(ConfigError::InvalidLine {
                        line: idx + 1,
                        reason: "expected 'SYMBOL [PRICE]'".to_string(),
                    })
                }
            };
            quotes.push(quote);
        }

        if quotes.is_empty() {
            return Err(ConfigError::NoInstruments);
        }
        log::info!("Loaded {} instruments", quotes.len());

        Ok(Self::new(quotes, jitter, alert_threshold)?)
    }

    /// Price of `instrument` without moving it.
    pub fn peek(&self, instrument: &str) -> Option<f64> {
        let quote = self.quotes.get(&instrument.to_ascii_uppercase())?;
        quote.lock().ok().map(|q| q.price)
    }

    /// Moves every instrument once and returns the moves that crossed the
    /// alert threshold since they were last reported.
    ///
    /// Instruments are updated in parallel; each worker owns its RNG.
    pub fn tick(&self) -> Vec<PriceMove> {
        let mut moves: Vec<PriceMove> = self
            .quotes
            .par_iter()
            .filter_map(|(symbol, quote)| {
                let mut rng = StdRng::from_entropy();
                let factor = self.sample_factor(&mut rng);
                let Ok(mut quote) = quote.lock() else {
                    log::error!("Quote lock poisoned for {}, skipping tick", symbol);
                    return None;
                };
                quote.apply_factor(factor);

                if quote.drift().abs() < self.alert_threshold {
                    return None;
                }
                let price_move = PriceMove {
                    instrument: symbol.clone(),
                    from: quote.reference_price,
                    to: quote.price,
                };
                quote.reference_price = quote.price;
                Some(price_move)
            })
            .collect();

        moves.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        log::trace!(
            "Ticked {} instruments, {} reportable moves",
            self.quotes.len(),
            moves.len()
        );
        moves
    }

    /// Random multiplier in `[1 - jitter, 1 + jitter]`.
    fn sample_factor<R: Rng>(&self, rng: &mut R) -> f64 {
        if self.jitter == 0.0 {
            return 1.0;
        }
        1.0 + Uniform::new_inclusive(-self.jitter, self.jitter).sample(rng)
    }
}

impl PriceOracle for SimulatedOracle {
    fn quote(&self, instrument: &str) -> Result<f64, OracleError> {
        let symbol = instrument.to_ascii_uppercase();
        let quote = self
            .quotes
            .get(&symbol)
            .ok_or_else(|| OracleError::UnknownInstrument(symbol.clone()))?;

        let factor = self.sample_factor(&mut rand::thread_rng());
        let mut quote = quote.lock().map_err(|_| OracleError::Unavailable {
            instrument: symbol.clone(),
            reason: "quote lock poisoned".to_string(),
        })?;
        Ok(quote.apply_factor(factor))
    }

    fn instruments(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.quotes.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::thread;
    use tempfile::NamedTempFile;

    fn oracle(jitter: f64, threshold: f64) -> SimulatedOracle {
        SimulatedOracle::new(
            vec![Quote::with_price("SOL", 100.0), Quote::with_price("ETH", 2000.0)],
            jitter,
            threshold,
        )
        .unwrap()
    }

    #[test]
    fn test_quote_unknown_instrument() {
        let o = oracle(0.02, 0.05);
        assert_eq!(
            o.quote("FOO"),
            Err(OracleError::UnknownInstrument("FOO".into()))
        );
    }

    #[test]
    fn test_quote_is_case_insensitive() {
        let o = oracle(0.0, 0.05);
        assert_eq!(o.quote("sol"), Ok(100.0));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let o = oracle(0.02, 0.05);
        let mut previous = o.peek("SOL").unwrap();
        for _ in 0..500 {
            let price = o.quote("SOL").unwrap();
            let change = (price / previous - 1.0).abs();
            assert!(change <= 0.02 + 1e-12, "change {} out of bounds", change);
            previous = price;
        }
    }

    #[test]
    fn test_invalid_jitter() {
        let res = SimulatedOracle::new(vec![Quote::new("SOL")], 1.5, 0.05);
        assert!(matches!(res, Err(OracleError::InvalidJitter(_))));
    }

    #[test]
    fn test_concurrent_quotes() {
        let o = Arc::new(oracle(0.01, 0.05));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let o = o.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        assert!(o.quote("ETH").unwrap() > 0.0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_tick_reports_and_resets_reference() {
        // Zero threshold: every tick is reportable.
        let o = oracle(0.02, 0.0);
        let moves = o.tick();
        assert_eq!(moves.len(), 2);
        assert_eq!(moves[0].instrument, "ETH");
        assert_eq!(moves[1].instrument, "SOL");

        let sol = o.peek("SOL").unwrap();
        assert_eq!(moves[1].to, sol);
    }

    #[test]
    fn test_tick_without_jitter_reports_nothing() {
        let o = oracle(0.0, 0.05);
        assert!(o.tick().is_empty());
        assert_eq!(o.peek("SOL"), Some(100.0));
    }

    #[test]
    fn test_from_config_valid_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# universe\nsol 150.5\n\nETH").unwrap();

        let o = SimulatedOracle::from_config(file.path(), 0.02, 0.05).unwrap();
        assert_eq!(o.instruments(), vec!["ETH".to_string(), "SOL".to_string()]);
        assert_eq!(o.peek("SOL"), Some(150.5));
    }

    #[test]
    fn test_from_config_invalid_files() {
        assert!(matches!(
            SimulatedOracle::from_config("nonexistent_file.txt", 0.02, 0.05),
            Err(ConfigError::Io(_))
        ));

        let mut empty = NamedTempFile::new().unwrap();
        writeln!(empty, "# nothing here").unwrap();
        assert!(matches!(
            SimulatedOracle::from_config(empty.path(), 0.02, 0.05),
            Err(ConfigError::NoInstruments)
        ));

        let mut bad = NamedTempFile::new().unwrap();
        writeln!(bad, "SOL\nETH abc").unwrap();
        assert!(matches!(
            SimulatedOracle::from_config(bad.path(), 0.02, 0.05),
            Err(ConfigError::InvalidLine { line: 2, .. })
        ));
    }

    #[test]
    fn test_from_config_rejects_duplicate_instrument() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "SOL 100
ETH 2000
sol 150").unwrap();

        match SimulatedOracle::from_config(file.path(), 0.02, 0.05) {
            Err(ConfigError::InvalidLine { line, reason }) => {
                assert_eq!(line, 3);
                assert!(reason.contains("duplicate instrument SOL"));
            }
            other => panic!("expected duplicate rejection, got {:?}", other.map(|_| ())),
        }
    }
}
