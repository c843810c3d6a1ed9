use crate::errors::ConnectionError;
use crate::quote::now_millis;

use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{
    Mutex,
    mpsc::{Receiver, SyncSender, TrySendError, sync_channel},
};
use std::thread::{self, JoinHandle};

/// Transport half that carries outbound lines to a client.
pub trait PacketSink: Send + Sync + 'static {
    /// Writes one newline-terminated line.
    fn send_line(&self, line: &str) -> io::Result<()>;

    /// Closes the transport; further writes fail.
    fn close(&self);
}

impl PacketSink for TcpStream {
    fn send_line(&self, line: &str) -> io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        let mut stream = self;
        stream.write_all(&buf)?;
        stream.flush()
    }

    fn close(&self) {
        let _ = self.shutdown(Shutdown::Both);
    }
}

/// Lifecycle of a connection.
///
/// `Connecting → Active → Closing → Closed`. Inbound packets are only accepted
/// while `Active`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Registered but not yet announced.
    Connecting = 0,
    /// Accepting commands.
    Active = 1,
    /// Flushing queued packets.
    Closing = 2,
    /// Writer stopped, transport closed.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Messages consumed by the writer thread.
enum Outbound {
    /// Lines written back to back.
    Packet(Vec<String>),
    /// Stop after everything queued before it has been written.
    Close,
}

/// One live client.
///
/// Outbound packets go through a bounded queue drained by a dedicated writer
/// thread, so a slow client only ever stalls its own queue. The connection
/// does not own any trading state; portfolios are keyed by `user` and outlive
/// it.
pub struct Connection {
    id: u64,
    user: String,
    joined_at: u64,
    state: AtomicU8,
    tx: Mutex<Option<SyncSender<Outbound>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Creates the connection in `Connecting` state and starts its writer
    /// thread over `sink`, with room for `buffer` queued packets.
    pub fn start(
        id: u64,
        user: &str,
        buffer: usize,
        sink: impl PacketSink,
    ) -> Result<Self, ConnectionError> {
        let (tx, rx) = sync_channel(buffer.max(1));

        let handle = thread::Builder::new()
            .name(format!("conn-{}-writer", id))
            .spawn(move || writer_loop(id, rx, sink))
            .map_err(|e| ConnectionError::WriterStart(id, e.to_string()))?;

        log::debug!("Connection {} for {} started", id, user);
        Ok(Self {
            id,
            user: user.to_string(),
            joined_at: now_millis(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(handle)),
        })
    }

    /// Connection identifier, unique for the process lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// User this connection logged in as.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Join time in milliseconds since the UNIX epoch.
    pub fn joined_at(&self) -> u64 {
        self.joined_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// `Connecting → Active`. Returns `false` if the connection was not connecting.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Queues a packet, waiting for room if the queue is full.
    ///
    /// Used for replies, so a client's own request/response stream is never
    /// reordered or dropped.
    pub fn send(&self, lines: Vec<String>) -> Result<(), ConnectionError> {
        let tx = self.sender()?;
        tx.send(Outbound::Packet(lines))
            .map_err(|_| ConnectionError::Closed(self.id))
    }

    /// Queues a packet only if there is room right now.
    pub fn try_send(&self, lines: Vec<String>) -> Result<(), ConnectionError> {
        let tx = self.sender()?;
        tx.try_send(Outbound::Packet(lines)).map_err(|e| match e {
            TrySendError::Full(_) => ConnectionError::QueueFull(self.id),
            TrySendError::Disconnected(_) => ConnectionError::Closed(self.id),
        })
    }

    /// Flushes every queued packet, closes the transport and waits for the
    /// writer to finish. Idempotent.
    pub fn close(&self) {
        let closing = ConnectionState::Closing as u8;
        let entered = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                (s < closing).then_some(closing)
            });
        if entered.is_err() {
            return;
        }
        log::debug!("Connection {} closing", self.id);

        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = tx {
            // Fails only if the writer already stopped.
            let _ = tx.send(Outbound::Close);
        }

        let handle = match self.writer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Writer thread of connection {} panicked", self.id);
            }
        }

        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        log::debug!("Connection {} closed", self.id);
    }

    /// Clone of the queue sender, taken without holding the lock while sending.
    fn sender(&self) -> Result<SyncSender<Outbound>, ConnectionError> {
        let guard = self
            .tx
            .lock()
            .map_err(|_| ConnectionError::Closed(self.id))?;
        guard.clone().ok_or(ConnectionError::Closed(self.id))
    }
}

fn writer_loop(id: u64, rx: Receiver<Outbound>, sink: impl PacketSink) {
    loop {
        match rx.recv() {
            Ok(Outbound::Packet(lines)) => {
                if let Err(e) = lines.iter().try_for_each(|line| sink.send_line(line)) {
                    log::warn!("Write to connection {} failed: {}", id, e);
                    break;
                }
            }
            Ok(Outbound::Close) | Err(_) => break,
        }
    }
    sink.close();
    log::trace!("Writer of connection {} stopped", id);
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("joined_at", &self.joined_at)
            .field("state", &self.state())
            // exclude queue and writer handle
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::PacketSink;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::Receiver;
    use std::sync::{Arc, Mutex};

    /// Sink recording every line in memory.
    #[derive(Clone, Default)]
    pub(crate) struct MemorySink {
        pub(crate) lines: Arc<Mutex<Vec<String>>>,
        pub(crate) closed: Arc<AtomicBool>,
    }

    impl MemorySink {
        pub(crate) fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl PacketSink for MemorySink {
        fn send_line(&self, line: &str) -> io::Result<()> {
            if self.is_closed() {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
            }
            self.lines.lock().unwrap().push(line.to_string());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Sink whose every write waits for a token on `gate` (or for the gate
    /// sender to be dropped), simulating a stalled client.
    pub(crate) struct GatedSink {
        pub(crate) gate: Mutex<Receiver<()>>,
        pub(crate) inner: MemorySink,
    }

    impl PacketSink for GatedSink {
        fn send_line(&self, line: &str) -> io::Result<()> {
            let _ = self.gate.lock().unwrap().recv();
            self.inner.send_line(line)
        }

        fn close(&self) {
            self.inner.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{GatedSink, MemorySink};
    use super::*;
    use std::sync::mpsc::channel;

    fn packet(s: &str) -> Vec<String> {
        vec![s.to_string()]
    }

    #[test]
    fn test_lifecycle() {
        let sink = MemorySink::default();
        let conn = Connection::start(1, "alice", 8, sink.clone()).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.activate());
        assert!(!conn.activate());
        assert_eq!(conn.state(), ConnectionState::Active);

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(sink.is_closed());

        // second close is a no-op
        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_close_flushes_in_order() {
        let sink = MemorySink::default();
        let conn = Connection::start(2, "bob", 16, sink.clone()).unwrap();
        conn.activate();
        for i in 0..10 {
            conn.send(vec![format!("line {}", i), format!("more {}", i)])
                .unwrap();
        }
        conn.close();

        let lines = sink.lines();
        assert_eq!(lines.len(), 20);
        assert_eq!(lines[0], "line 0");
        assert_eq!(lines[1], "more 0");
        assert_eq!(lines[19], "more 9");
    }

    #[test]
    fn test_send_after_close_fails() {
        let conn = Connection::start(3, "carol", 4, MemorySink::default()).unwrap();
        conn.close();
        assert!(matches!(
            conn.send(packet("late")),
            Err(ConnectionError::Closed(3))
        ));
        assert!(matches!(
            conn.try_send(packet("late")),
            Err(ConnectionError::Closed(3))
        ));
    }

    #[test]
    fn test_try_send_reports_full_queue() {
        let (gate_tx, gate_rx) = channel();
        let sink = GatedSink {
            gate: Mutex::new(gate_rx),
            inner: MemorySink::default(),
        };
        let recorded = sink.inner.clone();
        let conn = Connection::start(4, "dave", 1, sink).unwrap();

        // Fill the writer and the queue: one in flight, one queued, rest rejected.
        let mut rejected = 0;
        for i in 0..5 {
            if let Err(ConnectionError::QueueFull(4)) = conn.try_send(packet(&format!("{}", i))) {
                rejected += 1;
            }
        }
        assert!(rejected >= 3);

        drop(gate_tx);
        conn.close();
        assert!(!recorded.lines().is_empty());
    }
}
