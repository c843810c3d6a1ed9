use crate::errors::StateError;
use crate::quote::now_millis;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

/// Held quantity per instrument of one user.
///
/// Every stored quantity is strictly positive; a position that reaches zero
/// is removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portfolio {
    holdings: BTreeMap<String, Decimal>,
}

impl Portfolio {
    /// Quantity held of `instrument`, zero if none.
    pub fn quantity(&self, instrument: &str) -> Decimal {
        self.holdings
            .get(instrument)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// `true` when nothing is held.
    pub fn is_empty(&self) -> bool {
        self.holdings.is_empty()
    }

    /// Holdings ordered by instrument symbol.
    pub fn holdings(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.holdings.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Applies `delta` unless the result would be negative or overflow.
    fn apply(&mut self, instrument: &str, delta: Decimal) -> Result<Decimal, StateError> {
        let held = self.quantity(instrument);
        let next = held
            .checked_add(delta)
            .ok_or_else(|| StateError::QuantityOverflow {
                instrument: instrument.to_string(),
                held,
                requested: delta,
            })?;
        if next < Decimal::ZERO {
            return Err(StateError::InsufficientHolding {
                instrument: instrument.to_string(),
                held,
                requested: -delta,
            });
        }
        if next.is_zero() {
            self.holdings.remove(instrument);
        } else {
            self.holdings.insert(instrument.to_string(), next);
        }
        Ok(next)
    }
}

/// Immutable system notification visible to every connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    /// Position in the alert stream, strictly increasing.
    pub seq: u64,
    /// Creation time in milliseconds since the UNIX epoch.
    pub timestamp: u64,
    /// Notification text.
    pub message: String,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [{}] {}", self.seq, self.timestamp, self.message)
    }
}

#[derive(Debug)]
struct AlertLog {
    entries: VecDeque<Alert>,
    next_seq: u64,
}

/// Serializable copy of every portfolio.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Portfolios keyed by user identifier.
    pub portfolios: HashMap<String, Portfolio>,
}

/// Shared trading state: portfolios and the alert log.
///
/// Portfolios live in a sharded concurrent map; every read-modify-write of a
/// portfolio runs under that user's entry guard, so two trades of one user
/// serialize while trades of different users proceed in parallel. The alert
/// log has its own lock.
#[derive(Debug)]
pub struct TerminalState {
    portfolios: DashMap<String, Portfolio>,
    alerts: Mutex<AlertLog>,
    alert_capacity: usize,
}

impl TerminalState {
    /// Creates an empty state whose alert log keeps at most `alert_capacity` entries.
    pub fn new(alert_capacity: usize) -> Self {
        Self {
            portfolios: DashMap::new(),
            alerts: Mutex::new(AlertLog {
                entries: VecDeque::with_capacity(alert_capacity),
                next_seq: 1,
            }),
            alert_capacity: alert_capacity.max(1),
        }
    }

    /// Copy of `user`'s portfolio; empty if the user never traded.
    pub fn get_portfolio(&self, user: &str) -> Portfolio {
        self.portfolios
            .get(user)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    /// Atomically adds `delta` to `user`'s holding of `instrument` and returns
    /// the new quantity.
    ///
    /// # Errors
    /// [`StateError::InsufficientHolding`] if the result would be negative and
    /// [`StateError::QuantityOverflow`] if it is not representable; the
    /// portfolio is left untouched in both cases.
    pub fn adjust_portfolio(
        &self,
        user: &str,
        instrument: &str,
        delta: Decimal,
    ) -> Result<Decimal, StateError> {
        let mut portfolio = self.portfolios.entry(user.to_string()).or_default();
        portfolio.apply(instrument, delta)
    }

    /// Poisons the alert log lock, as a thread panicking mid-append would.
    #[cfg(test)]
    pub(crate) fn poison_alert_log(&self) {
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _log = self.alerts.lock().unwrap();
            panic!("alert log poisoned on purpose");
        }));
    }

    /// Appends an alert, evicting the oldest one when the log is full.
    pub fn append_alert(&self, message: impl Into<String>) -> Result<Alert, StateError> {
        let mut log = self
            .alerts
            .lock()
            .map_err(|_| StateError::AlertLogPoisoned)?;

        let alert = Alert {
            seq: log.next_seq,
            timestamp: now_millis(),
            message: message.into(),
        };
        log.next_seq += 1;

        if log.entries.len() == self.alert_capacity {
            log.entries.pop_front();
        }
        log.entries.push_back(alert.clone());
        Ok(alert)
    }

    /// Up to `limit` most recent alerts, oldest first.
    pub fn recent_alerts(&self, limit: usize) -> Result<Vec<Alert>, StateError> {
        let log = self
            .alerts
            .lock()
            .map_err(|_| StateError::AlertLogPoisoned)?;
        let skip = log.entries.len().saturating_sub(limit);
        Ok(log.entries.iter().skip(skip).cloned().collect())
    }

    /// Copies every non-empty portfolio.
    pub fn snapshot(&self) -> StateSnapshot {
        let portfolios = self
            .portfolios
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        StateSnapshot { portfolios }
    }

    /// Replaces the portfolios with the snapshot contents.
    ///
    /// Negative or zero quantities in the snapshot are dropped.
    pub fn restore(&self, snapshot: StateSnapshot) {
        self.portfolios.clear();
        for (user, portfolio) in snapshot.portfolios {
            let mut clean = Portfolio::default();
            for (instrument, qty) in portfolio.holdings {
                if qty > Decimal::ZERO {
                    clean.holdings.insert(instrument, qty);
                }
            }
            if !clean.is_empty() {
                self.portfolios.insert(user, clean);
            }
        }
        log::info!("Restored {} portfolios", self.portfolios.len());
    }
}
