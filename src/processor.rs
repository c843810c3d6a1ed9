use crate::command::{Command, Side};
use crate::errors::{OracleError, StateError};
use crate::oracle::{PriceMove, PriceOracle};
use crate::state::{Alert, TerminalState};

use rust_decimal::Decimal;
use std::sync::Arc;

/// Reply to unrecognized or malformed input.
pub const USAGE: &str =
    "HELP usage: /price [SYMBOL] | /portfolio | /trade <buy|sell> <SYMBOL> <QTY> | /alerts";

/// Lines delivered together, in order, to the connection that sent a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    lines: Vec<String>,
}

impl Response {
    /// Single-line response.
    pub fn line(text: impl Into<String>) -> Self {
        Self {
            lines: vec![text.into()],
        }
    }

    /// Multi-line response.
    pub fn lines(lines: Vec<String>) -> Self {
        Self { lines }
    }

    /// Borrowed view of the lines.
    pub fn as_lines(&self) -> &[String] {
        &self.lines
    }

    /// Consumes the response.
    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }

    /// `true` for error replies.
    pub fn is_error(&self) -> bool {
        self.lines.first().is_some_and(|l| l.starts_with("ERR "))
    }
}

/// An alert to deliver to every live connection except `origin`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastEvent {
    /// Alert already recorded in the terminal state.
    pub alert: Alert,
    /// Connection that caused the event, excluded from delivery.
    pub origin: Option<u64>,
}

impl BroadcastEvent {
    /// Wire form of the event.
    pub fn line(&self) -> String {
        format!("ALERT {}", self.alert.message)
    }
}

/// Result of processing one command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    /// Reply to the issuing connection.
    pub response: Response,
    /// Broadcasts triggered by the command.
    pub events: Vec<BroadcastEvent>,
}

impl From<Response> for Outcome {
    fn from(response: Response) -> Self {
        Self {
            response,
            events: Vec::new(),
        }
    }
}

/// Applies commands to the [`TerminalState`].
///
/// This is the only writer of portfolios and of the alert log. Commands never
/// broadcast; alerts come from connection lifecycle and price moves.
pub struct CommandProcessor {
    state: Arc<TerminalState>,
    oracle: Arc<dyn PriceOracle>,
    alerts_limit: usize,
}

impl CommandProcessor {
    /// Creates a processor returning at most `alerts_limit` alerts per `/alerts`.
    pub fn new(
        state: Arc<TerminalState>,
        oracle: Arc<dyn PriceOracle>,
        alerts_limit: usize,
    ) -> Self {
        Self {
            state,
            oracle,
            alerts_limit,
        }
    }

    /// Shared state handle.
    pub fn state(&self) -> &Arc<TerminalState> {
        &self.state
    }

    /// Executes `command` on behalf of `user`.
    pub fn process(&self, user: &str, command: Command) -> Outcome {
        match command {
            Command::PriceQuery(instrument) => self.price(&instrument).into(),
            Command::PortfolioQuery => self.portfolio(user).into(),
            Command::Trade {
                side,
                instrument,
                quantity,
            } => self.trade(user, side, &instrument, quantity).into(),
            Command::AlertsQuery => self.alerts().into(),
            Command::Unknown(raw) => {
                log::debug!("Usage reply to {} for '{}'", user, raw.trim());
                Response::line(USAGE).into()
            }
        }
    }

    /// Records that `user` joined through connection `connection_id`.
    pub fn on_join(&self, user: &str, connection_id: u64) -> Result<BroadcastEvent, StateError> {
        let alert = self.state.append_alert(format!("{} joined the terminal", user))?;
        Ok(BroadcastEvent {
            alert,
            origin: Some(connection_id),
        })
    }

    /// Records that `user`'s connection `connection_id` left.
    pub fn on_leave(&self, user: &str, connection_id: u64) -> Result<BroadcastEvent, StateError> {
        let alert = self.state.append_alert(format!("{} left the terminal", user))?;
        Ok(BroadcastEvent {
            alert,
            origin: Some(connection_id),
        })
    }

    /// Records a reportable price move; delivered to everyone.
    pub fn on_price_move(&self, price_move: &PriceMove) -> Result<BroadcastEvent, StateError> {
        let alert = self.state.append_alert(format!(
            "{} moved {:+.2}% to {:.4}",
            price_move.instrument,
            price_move.change() * 100.0,
            price_move.to
        ))?;
        Ok(BroadcastEvent {
            alert,
            origin: None,
        })
    }

    fn price(&self, instrument: &str) -> Response {
        match self.oracle.quote(instrument) {
            Ok(price) => Response::line(format!("PRICE {} {:.4}", instrument, price)),
            Err(e) => oracle_failure(instrument, e),
        }
    }

    fn portfolio(&self, user: &str) -> Response {
        let portfolio = self.state.get_portfolio(user);
        if portfolio.is_empty() {
            return Response::line("PORTFOLIO empty");
        }
        let holdings: Vec<String> = portfolio
            .holdings()
            .map(|(instrument, qty)| format!("{}={}", instrument, qty.normalize()))
            .collect();
        Response::line(format!("PORTFOLIO {}", holdings.join(" ")))
    }

    fn trade(&self, user: &str, side: Side, instrument: &str, quantity: Decimal) -> Response {
        let price = match self.oracle.quote(instrument) {
            Ok(price) => price,
            Err(e) => return oracle_failure(instrument, e),
        };

        let delta = match side {
            Side::Buy => quantity,
            Side::Sell => -quantity,
        };

        match self.state.adjust_portfolio(user, instrument, delta) {
            Ok(position) => {
                log::info!(
                    "{} {} {} {} @ {:.4}, position {}",
                    user,
                    side,
                    quantity,
                    instrument,
                    price,
                    position
                );
                Response::line(format!(
                    "OK {} {} {} @ {:.4} (position {})",
                    side,
                    quantity.normalize(),
                    instrument,
                    price,
                    position.normalize()
                ))
            }
            Err(e) => {
                log::debug!("Trade rejected for {}: {}", user, e);
                Response::line(format!("ERR {}", e))
            }
        }
    }

    fn alerts(&self) -> Response {
        match self.state.recent_alerts(self.alerts_limit) {
            Ok(alerts) if alerts.is_empty() => Response::line("ALERTS none"),
            Ok(alerts) => {
                let mut lines = Vec::with_capacity(alerts.len() + 1);
                lines.push(format!("ALERTS {}", alerts.len()));
                lines.extend(alerts.iter().map(|a| a.to_string()));
                Response::lines(lines)
            }
            Err(e) => {
                log::error!("Failed to read alerts: {}", e);
                Response::line("ERR alerts unavailable")
            }
        }
    }
}

fn oracle_failure(instrument: &str, err: OracleError) -> Response {
    match err {
        OracleError::UnknownInstrument(_) => {
            Response::line(format!("ERR unknown instrument {}", instrument))
        }
        other => {
            log::warn!("Price oracle failure for {}: {}", instrument, other);
            Response::line(format!("ERR price unavailable for {}", instrument))
        }
    }
}
