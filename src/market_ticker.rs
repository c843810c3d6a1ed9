use crate::connection_manager::ConnectionManager;
use crate::errors::TickerError;
use crate::oracle::SimulatedOracle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Background worker that keeps simulated prices moving.
///
/// Every period it ticks the oracle and broadcasts each reported
/// [`PriceMove`](crate::oracle::PriceMove) as an alert.
pub struct MarketTicker {
    oracle: Arc<SimulatedOracle>,
    manager: Arc<ConnectionManager>,
    period: Duration,

    /// Background thread
    bg_thread: Mutex<Option<JoinHandle<()>>>,
    /// Graceful shutdown flag
    shutdown_flag: Arc<AtomicBool>,
}

impl MarketTicker {
    /// Creates a stopped ticker.
    pub fn new(
        oracle: Arc<SimulatedOracle>,
        manager: Arc<ConnectionManager>,
        period: Duration,
    ) -> Self {
        Self {
            oracle,
            manager,
            period,
            bg_thread: Mutex::new(None),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the ticker thread; a second call is a no-op.
    pub fn start(&self) -> Result<(), TickerError> {
        let mut guard = self
            .bg_thread
            .lock()
            .map_err(|_| TickerError::Start("ticker lock poisoned".into()))?;

        if guard.is_some() {
            log::warn!("Market ticker already running");
            return Ok(());
        }

        let oracle = Arc::clone(&self.oracle);
        let manager = Arc::clone(&self.manager);
        let shutdown = Arc::clone(&self.shutdown_flag);
        let period = self.period;

        log::info!("Starting market ticker with period: {:?}", period);

        let handle = thread::Builder::new()
            .name("market-ticker".into())
            .spawn(move || {
                log::info!("Market ticker started");
                while !shutdown.load(Ordering::SeqCst) {
                    thread::sleep(period);
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    for price_move in oracle.tick() {
                        if let Err(e) = manager.broadcast_price_move(&price_move) {
                            log::error!(
                                "Failed to broadcast move of {}: {}",
                                price_move.instrument,
                                e
                            );
                        }
                    }
                }
                log::info!("Market ticker stopped");
            })
            .map_err(|e| TickerError::Start(e.to_string()))?;

        *guard = Some(handle);
        Ok(())
    }

    /// Signals the ticker to stop and joins its thread.
    pub fn shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);

        let handle = match self.bg_thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            log::debug!("Waiting for market ticker to finish");
            handle.join().ok();
        }
    }
}

impl Drop for MarketTicker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandParser;
    use crate::connection::test_support::MemorySink;
    use crate::processor::CommandProcessor;
    use crate::quote::Quote;
    use crate::state::TerminalState;

    #[test]
    fn test_ticker_broadcasts_price_moves() {
        // Zero threshold: every tick produces an alert per instrument.
        let oracle = Arc::new(
            SimulatedOracle::new(vec![Quote::with_price("SOL", 100.0)], 0.01, 0.0).unwrap(),
        );
        let state = Arc::new(TerminalState::new(100));
        let processor = CommandProcessor::new(state.clone(), oracle.clone(), 20);
        let manager = Arc::new(ConnectionManager::new(
            CommandParser::new("SOL"),
            processor,
            64,
        ));
        let sink = MemorySink::default();
        manager.register("watcher", sink.clone()).unwrap();

        let ticker = MarketTicker::new(oracle, manager.clone(), Duration::from_millis(10));
        ticker.start().unwrap();
        ticker.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        ticker.shutdown();

        manager.shutdown("BYE");
        let moves = sink
            .lines()
            .iter()
            .filter(|l| l.starts_with("ALERT SOL moved"))
            .count();
        assert!(moves > 0);
        assert!(state
            .recent_alerts(100)
            .unwrap()
            .iter()
            .any(|a| a.message.starts_with("SOL moved")));
    }
}
