use crate::errors::ParseError;

use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

/// Direction of a trade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// Increase the holding.
    Buy,
    /// Decrease the holding.
    Sell,
}

impl FromStr for Side {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("buy") {
            Ok(Side::Buy)
        } else if s.eq_ignore_ascii_case("sell") {
            Ok(Side::Sell)
        } else {
            Err(ParseError::InvalidSide(s.to_string()))
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("BUY"),
            Side::Sell => f.write_str("SELL"),
        }
    }
}

/// A parsed client request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `/price [INSTRUMENT]`
    PriceQuery(String),
    /// `/portfolio`
    PortfolioQuery,
    /// `/trade <buy|sell> <INSTRUMENT> <QUANTITY>`
    Trade {
        /// Buy or sell.
        side: Side,
        /// Upper-case instrument symbol.
        instrument: String,
        /// Strictly positive quantity.
        quantity: Decimal,
    },
    /// `/alerts`
    AlertsQuery,
    /// Anything that is not a well-formed command; carries the raw line.
    Unknown(String),
}

/// Turns raw command lines into [`Command`]s.
///
/// Grammar: a case-insensitive leading token selects the command, arguments
/// are whitespace-delimited. Malformed input becomes [`Command::Unknown`].
#[derive(Clone, Debug)]
pub struct CommandParser {
    default_instrument: String,
}

impl CommandParser {
    /// Creates a parser that resolves a bare `/price` to `default_instrument`.
    pub fn new(default_instrument: &str) -> Self {
        Self {
            default_instrument: default_instrument.to_ascii_uppercase(),
        }
    }

    /// Parses `raw`, recovering every error into [`Command::Unknown`].
    pub fn parse(&self, raw: &str) -> Command {
        match self.try_parse(raw) {
            Ok(command) => command,
            Err(e) => {
                log::debug!("Unparseable command '{}': {}", raw.trim(), e);
                Command::Unknown(raw.to_string())
            }
        }
    }

    /// Strict variant of [`parse`](Self::parse) that reports why input was rejected.
    pub fn try_parse(&self, raw: &str) -> Result<Command, ParseError> {
        let mut tokens = raw.split_whitespace();
        let keyword = tokens.next().ok_or(ParseError::Empty)?.to_ascii_lowercase();
        let args: Vec<&str> = tokens.collect();

        match keyword.as_str() {
            "/price" => match args.as_slice() {
                [] => Ok(Command::PriceQuery(self.default_instrument.clone())),
                [instrument] => Ok(Command::PriceQuery(instrument.to_ascii_uppercase())),
                _ => Err(arity("/price", "0 or 1", args.len())),
            },
            "/portfolio" if args.is_empty() => Ok(Command::PortfolioQuery),
            "/portfolio" => Err(arity("/portfolio", "0", args.len())),
            "/alerts" if args.is_empty() => Ok(Command::AlertsQuery),
            "/alerts" => Err(arity("/alerts", "0", args.len())),
            "/trade" => match args.as_slice() {
                [side, instrument, quantity] => Ok(Command::Trade {
                    side: side.parse()?,
                    instrument: instrument.to_ascii_uppercase(),
                    quantity: parse_quantity(quantity)?,
                }),
                _ => Err(arity("/trade", "3", args.len())),
            },
            _ => Err(ParseError::UnknownCommand(keyword)),
        }
    }
}

fn arity(command: &'static str, expected: &'static str, got: usize) -> ParseError {
    ParseError::Arity {
        command,
        expected,
        got,
    }
}

/// Positive decimal quantity; rejects zero, negatives and non-numbers.
fn parse_quantity(raw: &str) -> Result<Decimal, ParseError> {
    let quantity =
        Decimal::from_str(raw).map_err(|_| ParseError::InvalidQuantity(raw.to_string()))?;
    if quantity <= Decimal::ZERO {
        return Err(ParseError::InvalidQuantity(raw.to_string()));
    }
    Ok(quantity.normalize())
}
