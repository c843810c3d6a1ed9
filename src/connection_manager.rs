use crate::command::CommandParser;
use crate::connection::{Connection, ConnectionState, PacketSink};
use crate::errors::{ConnectionError, ManagerError};
use crate::oracle::PriceMove;
use crate::processor::{BroadcastEvent, CommandProcessor};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Owns the set of live connections and routes packets between them and the
/// [`CommandProcessor`].
///
/// Every alert append and its fan-out happen under one broadcast lock, so all
/// recipients see broadcasts in alert-log order. Fan-out never waits on a
/// client: a full outbound queue drops the packet for that client only.
pub struct ConnectionManager {
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
    parser: CommandParser,
    processor: CommandProcessor,
    outbound_buffer: usize,
    broadcast_lock: Mutex<()>,
    dropped_broadcasts: AtomicU64,
}

impl ConnectionManager {
    /// Creates a manager; every connection gets an outbound queue of
    /// `outbound_buffer` packets.
    pub fn new(parser: CommandParser, processor: CommandProcessor, outbound_buffer: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            parser,
            processor,
            outbound_buffer,
            broadcast_lock: Mutex::new(()),
            dropped_broadcasts: AtomicU64::new(0),
        }
    }

    /// The processor commands are applied with.
    pub fn processor(&self) -> &CommandProcessor {
        &self.processor
    }

    /// Registers a logged-in client, greets it and announces it to everyone else.
    pub fn register(
        &self,
        user: &str,
        sink: impl PacketSink,
    ) -> Result<Arc<Connection>, ManagerError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let conn = Arc::new(Connection::start(id, user, self.outbound_buffer, sink)?);
        conn.send(vec![format!("WELCOME {}", user)])?;

        let announced = {
            let _order = self
                .broadcast_lock
                .lock()
                .map_err(|_| ManagerError::RegistryPoisoned)?;
            let total = {
                let mut conns = self
                    .connections
                    .write()
                    .map_err(|_| ManagerError::RegistryPoisoned)?;
                conns.insert(id, conn.clone());
                conns.len()
            };
            conn.activate();
            log::info!(
                "Connection {} registered for {}. Live connections: {}",
                id,
                user,
                total
            );

            self.processor
                .on_join(user, id)
                .map_err(ManagerError::from)
                .and_then(|event| self.fan_out(&event))
        };

        if let Err(e) = announced {
            log::error!("Failed to announce connection {} for {}: {}", id, user, e);
            if let Ok(mut conns) = self.connections.write() {
                conns.remove(&id);
            }
            conn.close();
            return Err(e);
        }
        Ok(conn)
    }

    /// Removes a connection, announces the departure and closes it after its
    /// queue drains.
    ///
    /// Only the call that actually removes the connection produces the leave
    /// alert; repeated or concurrent calls for the same id are no-ops.
    pub fn unregister(&self, id: u64) -> Result<(), ManagerError> {
        let (conn, announced) = {
            let _order = self
                .broadcast_lock
                .lock()
                .map_err(|_| ManagerError::RegistryPoisoned)?;
            let removed = self
                .connections
                .write()
                .map_err(|_| ManagerError::RegistryPoisoned)?
                .remove(&id);
            let Some(conn) = removed else {
                log::debug!("Connection {} already unregistered", id);
                return Ok(());
            };

            let announced = self
                .processor
                .on_leave(conn.user(), id)
                .map_err(ManagerError::from)
                .and_then(|event| self.fan_out(&event));
            (conn, announced)
        };

        log::info!("Connection {} for {} unregistered", id, conn.user());
        conn.close();
        announced
    }

    /// Parses `raw`, applies it for the connection's user and queues the reply
    /// on that connection.
    ///
    /// Packets for unknown or non-active connections are dropped.
    pub fn route_inbound(&self, id: u64, raw: &str) -> Result<(), ManagerError> {
        let conn = self
            .connections
            .read()
            .map_err(|_| ManagerError::RegistryPoisoned)?
            .get(&id)
            .cloned();
        let Some(conn) = conn else {
            log::debug!("Dropping packet for unknown connection {}", id);
            return Ok(());
        };
        if conn.state() != ConnectionState::Active {
            log::debug!(
                "Dropping packet for connection {} in state {:?}",
                id,
                conn.state()
            );
            return Ok(());
        }

        log::debug!("Connection {} ({}): '{}'", id, conn.user(), raw);
        let command = self.parser.parse(raw);
        let outcome = self.processor.process(conn.user(), command);
        conn.send(outcome.response.into_lines())?;

        for event in &outcome.events {
            self.broadcast(event)?;
        }
        Ok(())
    }

    /// Delivers `event` to every active connection except its origin.
    pub fn broadcast(&self, event: &BroadcastEvent) -> Result<(), ManagerError> {
        let _order = self
            .broadcast_lock
            .lock()
            .map_err(|_| ManagerError::RegistryPoisoned)?;
        self.fan_out(event)
    }

    /// Records a price-move alert and delivers it to every connection.
    pub fn broadcast_price_move(&self, price_move: &PriceMove) -> Result<(), ManagerError> {
        let _order = self
            .broadcast_lock
            .lock()
            .map_err(|_| ManagerError::RegistryPoisoned)?;
        let event = self.processor.on_price_move(price_move)?;
        self.fan_out(&event)
    }

    /// Sends `notice` to every live connection (best effort) and closes them all.
    ///
    /// No leave alerts are produced.
    pub fn shutdown(&self, notice: &str) {
        let conns: Vec<Arc<Connection>> = match self.connections.write() {
            Ok(mut guard) => guard.drain().map(|(_, c)| c).collect(),
            Err(poisoned) => poisoned.into_inner().drain().map(|(_, c)| c).collect(),
        };
        log::info!("Closing {} live connections", conns.len());

        for conn in conns {
            if let Err(e) = conn.try_send(vec![notice.to_string()]) {
                log::warn!("Final notice to connection {} not queued: {}", conn.id(), e);
            }
            conn.close();
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Broadcast packets dropped because a recipient queue was full.
    pub fn dropped_broadcasts(&self) -> u64 {
        self.dropped_broadcasts.load(Ordering::Relaxed)
    }

    /// Fan-out; the caller holds the broadcast lock.
    fn fan_out(&self, event: &BroadcastEvent) -> Result<(), ManagerError> {
        let recipients: Vec<Arc<Connection>> = self
            .connections
            .read()
            .map_err(|_| ManagerError::RegistryPoisoned)?
            .values()
            .filter(|c| Some(c.id()) != event.origin && c.state() == ConnectionState::Active)
            .cloned()
            .collect();

        let line = event.line();
        log::debug!(
            "Broadcasting alert #{} to {} connections",
            event.alert.seq,
            recipients.len()
        );
        for conn in recipients {
            match conn.try_send(vec![line.clone()]) {
                Ok(()) => {}
                Err(ConnectionError::QueueFull(id)) => {
                    let dropped = self.dropped_broadcasts.fetch_add(1, Ordering::Relaxed) + 1;
                    log::warn!(
                        "Outbound queue of connection {} full, dropped alert #{} (total dropped: {})",
                        id,
                        event.alert.seq,
                        dropped
                    );
                }
                Err(e) => log::debug!("Skipping connection {}: {}", conn.id(), e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::{GatedSink, MemorySink};
    use crate::oracle::SimulatedOracle;
    use crate::processor::USAGE;
    use crate::quote::Quote;
    use crate::state::TerminalState;
    use std::sync::mpsc::channel;
    use std::thread;

    fn manager(buffer: usize) -> ConnectionManager {
        let oracle =
            SimulatedOracle::new(vec![Quote::with_price("SOL", 100.0)], 0.0, 0.05).unwrap();
        let processor =
            CommandProcessor::new(Arc::new(TerminalState::new(100)), Arc::new(oracle), 20);
        ConnectionManager::new(CommandParser::new("SOL"), processor, buffer)
    }

    fn count(lines: &[String], needle: &str) -> usize {
        lines.iter().filter(|l| l.as_str() == needle).count()
    }

    #[test]
    fn test_join_is_broadcast_to_others_only() {
        let m = manager(16);
        let alice_sink = MemorySink::default();
        let bob_sink = MemorySink::default();
        let alice = m.register("alice", alice_sink.clone()).unwrap();
        let bob = m.register("bob", bob_sink.clone()).unwrap();
        assert_eq!(m.connection_count(), 2);

        m.shutdown("BYE");
        assert_eq!(alice.state(), ConnectionState::Closed);
        assert_eq!(bob.state(), ConnectionState::Closed);

        assert_eq!(
            alice_sink.lines(),
            vec!["WELCOME alice", "ALERT bob joined the terminal", "BYE"]
        );
        assert_eq!(bob_sink.lines(), vec!["WELCOME bob", "BYE"]);
    }

    #[test]
    fn test_failed_join_announcement_rolls_back() {
        let m = manager(16);
        m.processor().state().poison_alert_log();

        let sink = MemorySink::default();
        let err = m.register("alice", sink.clone()).unwrap_err();
        assert!(matches!(err, ManagerError::State(_)));
        assert_eq!(m.connection_count(), 0);
        assert!(sink.is_closed());
    }

    #[test]
    fn test_join_then_leave_exactly_once() {
        let m = manager(16);
        let observer = MemorySink::default();
        m.register("observer", observer.clone()).unwrap();

        let conn = m.register("bob", MemorySink::default()).unwrap();
        m.unregister(conn.id()).unwrap();
        m.unregister(conn.id()).unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);

        let alerts = m.processor().state().recent_alerts(100).unwrap();
        let bob_alerts: Vec<_> = alerts
            .iter()
            .filter(|a| a.message.starts_with("bob "))
            .collect();
        assert_eq!(bob_alerts.len(), 2);
        assert_eq!(bob_alerts[0].message, "bob joined the terminal");
        assert_eq!(bob_alerts[1].message, "bob left the terminal");

        m.shutdown("BYE");
        let lines = observer.lines();
        assert_eq!(count(&lines, "ALERT bob joined the terminal"), 1);
        assert_eq!(count(&lines, "ALERT bob left the terminal"), 1);
    }

    #[test]
    fn test_concurrent_unregister_leaves_once() {
        let m = Arc::new(manager(16));
        let observer = MemorySink::default();
        m.register("observer", observer.clone()).unwrap();
        let id = m.register("carol", MemorySink::default()).unwrap().id();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                thread::spawn(move || m.unregister(id).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        m.shutdown("BYE");
        assert_eq!(count(&observer.lines(), "ALERT carol left the terminal"), 1);
    }

    #[test]
    fn test_responses_follow_request_order() {
        let m = manager(4);
        let sink = MemorySink::default();
        let conn = m.register("dave", sink.clone()).unwrap();

        for i in 1..=20 {
            m.route_inbound(conn.id(), &format!("/trade buy SOL {}", i))
                .unwrap();
        }
        m.route_inbound(conn.id(), "/portfolio").unwrap();
        m.unregister(conn.id()).unwrap();

        let lines = sink.lines();
        assert_eq!(lines[0], "WELCOME dave");
        for i in 1..=20 {
            assert!(
                lines[i].starts_with(&format!("OK BUY {} SOL", i)),
                "unexpected line {}",
                lines[i]
            );
        }
        assert_eq!(lines[21], "PORTFOLIO SOL=210");
    }

    #[test]
    fn test_malformed_input_keeps_connection_open() {
        let m = manager(8);
        let sink = MemorySink::default();
        let conn = m.register("erin", sink.clone()).unwrap();

        m.route_inbound(conn.id(), "/trade buy").unwrap();
        assert_eq!(conn.state(), ConnectionState::Active);
        m.route_inbound(conn.id(), "/price").unwrap();
        m.unregister(conn.id()).unwrap();

        let lines = sink.lines();
        assert_eq!(lines[1], USAGE);
        assert_eq!(lines[2], "PRICE SOL 100.0000");
    }

    #[test]
    fn test_packets_after_unregister_are_dropped() {
        let m = manager(8);
        let sink = MemorySink::default();
        let conn = m.register("frank", sink.clone()).unwrap();
        m.unregister(conn.id()).unwrap();

        assert!(m.route_inbound(conn.id(), "/trade buy SOL 1").is_ok());
        assert!(m.processor().state().get_portfolio("frank").is_empty());
        assert_eq!(sink.lines(), vec!["WELCOME frank"]);
    }

    #[test]
    fn test_portfolio_survives_reconnect() {
        let m = manager(8);
        let first = m.register("gina", MemorySink::default()).unwrap();
        m.route_inbound(first.id(), "/trade buy SOL 3").unwrap();
        m.unregister(first.id()).unwrap();

        let sink = MemorySink::default();
        let second = m.register("gina", sink.clone()).unwrap();
        m.route_inbound(second.id(), "/portfolio").unwrap();
        m.unregister(second.id()).unwrap();
        assert_eq!(sink.lines()[1], "PORTFOLIO SOL=3");
    }

    #[test]
    fn test_stalled_connection_does_not_block_broadcast() {
        let m = manager(1);
        let (gate_tx, gate_rx) = channel();
        let stalled = GatedSink {
            gate: Mutex::new(gate_rx),
            inner: MemorySink::default(),
        };
        m.register("stalled", stalled).unwrap();

        let observer = MemorySink::default();
        m.register("observer", observer.clone()).unwrap();

        let price_move = PriceMove {
            instrument: "SOL".into(),
            from: 100.0,
            to: 110.0,
        };
        for _ in 0..10 {
            m.broadcast_price_move(&price_move).unwrap();
            // let the observer's writer keep up with its one-slot queue
            thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(m.dropped_broadcasts() > 0);

        drop(gate_tx);
        m.shutdown("BYE");
        let price_alerts = observer
            .lines()
            .iter()
            .filter(|l| l.starts_with("ALERT SOL moved"))
            .count();
        assert_eq!(price_alerts, 10);
    }
}
