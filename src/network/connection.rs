use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::blockchain::crypto::PeerId;

/// A live, handshaken link to one peer
///
/// Frames pushed into `outbound` are written in order by the connection's
/// writer task. Dropping the connection aborts its reader and closes the
/// writer channel, which closes the socket.
#[derive(Debug)]
pub struct Connection {
    pub peer_id: PeerId,
    pub session_id: String,

    /// Remote socket address
    pub address: String,

    /// Time of the handshake or the last pong, in milliseconds
    pub last_heartbeat: u64,

    pub alive: bool,

    outbound: mpsc::UnboundedSender<WsMessage>,
    reader: Option<AbortHandle>,
}

/// Serializable view of a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub session_id: String,
    pub address: String,
    pub last_heartbeat: u64,
    pub alive: bool,
}

impl Connection {
    pub fn new(
        peer_id: PeerId,
        session_id: String,
        address: String,
        now: u64,
        outbound: mpsc::UnboundedSender<WsMessage>,
        reader: Option<AbortHandle>,
    ) -> Self {
        Connection {
            peer_id,
            session_id,
            address,
            last_heartbeat: now,
            alive: true,
            outbound,
            reader,
        }
    }

    /// Queues a text frame, false once the writer is gone
    pub fn send_text(&self, text: &str) -> bool {
        self.alive && self.outbound.send(WsMessage::Text(text.to_string().into())).is_ok()
    }

    pub fn refresh(&mut self, now: u64) {
        self.last_heartbeat = now;
        self.alive = true;
    }

    /// Whether no pong arrived within `timeout_ms` of `now`
    pub fn is_stale(&self, now: u64, timeout_ms: u64) -> bool {
        now.saturating_sub(self.last_heartbeat) > timeout_ms
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            peer_id: self.peer_id.clone(),
            session_id: self.session_id.clone(),
            address: self.address.clone(),
            last_heartbeat: self.last_heartbeat,
            alive: self.alive,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.alive = false;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_and_refresh() {
        let (sender, _receiver) = mpsc::unbounded_channel();
        let mut connection = Connection::new(
            PeerId::from("peer"),
            "session".to_string(),
            "127.0.0.1:9000".to_string(),
            1_000,
            sender,
            None,
        );

        assert!(!connection.is_stale(61_000, 60_000));
        assert!(connection.is_stale(61_001, 60_000));

        connection.refresh(50_000);
        assert!(!connection.is_stale(61_001, 60_000));
        assert_eq!(connection.info().last_heartbeat, 50_000);
    }

    #[test]
    fn test_send_text_reaches_writer_channel() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let connection = Connection::new(
            PeerId::from("peer"),
            "session".to_string(),
            "addr".to_string(),
            0,
            sender,
            None,
        );

        assert!(connection.send_text("hello"));
        match receiver.try_recv() {
            Ok(WsMessage::Text(text)) => assert_eq!(text.as_str(), "hello"),
            other => panic!("unexpected frame: {:?}", other),
        }

        drop(receiver);
        assert!(!connection.send_text("lost"));
    }
}
