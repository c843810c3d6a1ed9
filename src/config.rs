use crate::command::CommandParser;
use crate::connection_manager::ConnectionManager;
use crate::defs::{
    ALERT_LOG_CAPACITY, CLIENT_KEEP_ALIVE_SEC, DEFAULT_INSTRUMENT, MARKET_TICK_PERIOD_MSEC,
    OUTBOUND_BUFFER_SIZE, PRICE_ALERT_THRESHOLD, PRICE_JITTER, RECENT_ALERTS_LIMIT,
};
use crate::errors::ConfigError;
use crate::oracle::SimulatedOracle;
use crate::processor::CommandProcessor;
use crate::state::TerminalState;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Every recognized terminal option.
#[derive(Clone, Debug)]
pub struct TerminalConfig {
    /// Instruments file, one `SYMBOL [PRICE]` per line.
    pub instruments_path: PathBuf,
    /// Instrument used by a bare `/price`.
    pub default_instrument: String,
    /// Alert log capacity.
    pub alert_capacity: usize,
    /// Per-connection outbound queue size, in packets.
    pub outbound_buffer: usize,
    /// Maximum relative price move per oracle call.
    pub jitter: f64,
    /// Alerts returned by `/alerts`.
    pub alerts_limit: usize,
    /// Cumulative move that triggers a price alert.
    pub alert_threshold: f64,
    /// Market ticker period.
    pub tick_period: Duration,
    /// Idle time after which a silent client is disconnected.
    pub keep_alive: Duration,
}

impl TerminalConfig {
    /// Defaults for everything but the instruments file.
    pub fn new(instruments_path: impl Into<PathBuf>) -> Self {
        Self {
            instruments_path: instruments_path.into(),
            default_instrument: DEFAULT_INSTRUMENT.to_string(),
            alert_capacity: ALERT_LOG_CAPACITY,
            outbound_buffer: OUTBOUND_BUFFER_SIZE,
            jitter: PRICE_JITTER,
            alerts_limit: RECENT_ALERTS_LIMIT,
            alert_threshold: PRICE_ALERT_THRESHOLD,
            tick_period: Duration::from_millis(MARKET_TICK_PERIOD_MSEC),
            keep_alive: Duration::from_secs(CLIENT_KEEP_ALIVE_SEC),
        }
    }

    /// Rejects out-of-range options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("alert_capacity", self.alert_capacity),
            ("outbound_buffer", self.outbound_buffer),
            ("alerts_limit", self.alerts_limit),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidOption {
                    name,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidOption {
                name: "jitter",
                reason: format!("{} is outside [0, 1)", self.jitter),
            });
        }
        if !self.alert_threshold.is_finite() || self.alert_threshold <= 0.0 {
            return Err(ConfigError::InvalidOption {
                name: "alert_threshold",
                reason: format!("{} is not a positive number", self.alert_threshold),
            });
        }
        if self.tick_period.is_zero() {
            return Err(ConfigError::InvalidOption {
                name: "tick_period",
                reason: "must be greater than zero".into(),
            });
        }
        if self.default_instrument.trim().is_empty() {
            return Err(ConfigError::InvalidOption {
                name: "default_instrument",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    /// Validates the options, loads the instrument universe and wires the
    /// oracle, state, processor and connection manager together.
    pub fn build(&self) -> Result<Terminal, ConfigError> {
        self.validate()?;

        let oracle = Arc::new(SimulatedOracle::from_config(
            &self.instruments_path,
            self.jitter,
            self.alert_threshold,
        )?);
        if oracle.peek(&self.default_instrument).is_none() {
            log::warn!(
                "Default instrument {} is not in the instruments file",
                self.default_instrument
            );
        }

        let state = Arc::new(TerminalState::new(self.alert_capacity));
        let processor = CommandProcessor::new(state.clone(), oracle.clone(), self.alerts_limit);
        let manager = Arc::new(ConnectionManager::new(
            CommandParser::new(&self.default_instrument),
            processor,
            self.outbound_buffer,
        ));

        Ok(Terminal {
            oracle,
            state,
            manager,
        })
    }
}

/// Wired-up terminal components sharing one state.
pub struct Terminal {
    /// Simulated price source.
    pub oracle: Arc<SimulatedOracle>,
    /// Portfolios and alerts.
    pub state: Arc<TerminalState>,
    /// Live connections.
    pub manager: Arc<ConnectionManager>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::PriceOracle;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        assert!(TerminalConfig::new("tickers.txt").validate().is_ok());
    }

    #[test]
    fn test_invalid_options() {
        let mut cfg = TerminalConfig::new("tickers.txt");
        cfg.outbound_buffer = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidOption { name: "outbound_buffer", .. })
        ));

        let mut cfg = TerminalConfig::new("tickers.txt");
        cfg.jitter = 1.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidOption { name: "jitter", .. })
        ));
    }

    #[test]
    fn test_build() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "SOL 150\nETH 3000").unwrap();

        let terminal = TerminalConfig::new(file.path()).build().unwrap();
        assert_eq!(terminal.oracle.instruments().len(), 2);
        assert_eq!(terminal.manager.connection_count(), 0);
        assert!(terminal.state.get_portfolio("nobody").is_empty());
    }
}
