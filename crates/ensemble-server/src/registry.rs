//! Connection registry.
//!
//! Maps session ids to the outbound queue of their connection. The executor
//! pushes encoded frames and datagrams here; each connection's writer task
//! drains its own queue, so a slow peer never blocks the others.

use std::{collections::HashMap, net::SocketAddr, time::Instant};

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use crate::room_manager::SessionId;

/// Encoded output for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Length-prefixed frame for the control stream.
    Frame(Bytes),
    /// Transform datagram.
    Datagram(Bytes),
}

/// Information about a connected session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Peer address
    pub remote: SocketAddr,
    /// When the connection was accepted
    pub connected_at: Instant,
}

struct Entry {
    info: SessionInfo,
    outbound: UnboundedSender<Outbound>,
}

/// Live connections by session id.
#[derive(Default)]
pub struct ConnectionRegistry {
    sessions: HashMap<SessionId, Entry>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection's outbound queue.
    pub fn insert(
        &mut self,
        session_id: SessionId,
        info: SessionInfo,
        outbound: UnboundedSender<Outbound>,
    ) {
        self.sessions.insert(session_id, Entry { info, outbound });
    }

    /// Forgets a connection.
    pub fn remove(&mut self, session_id: SessionId) -> Option<SessionInfo> {
        self.sessions.remove(&session_id).map(|entry| entry.info)
    }

    /// Connection info of a session.
    pub fn info(&self, session_id: SessionId) -> Option<&SessionInfo> {
        self.sessions.get(&session_id).map(|entry| &entry.info)
    }

    /// Queues work for a session. Returns `false` if it is gone.
    pub fn send(&self, session_id: SessionId, outbound: Outbound) -> bool {
        self.sessions.get(&session_id).is_some_and(|entry| entry.outbound.send(outbound).is_ok())
    }

    /// Number of connections.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn info() -> SessionInfo {
        SessionInfo { remote: "127.0.0.1:4433".parse().unwrap(), connected_at: Instant::now() }
    }

    #[test]
    fn send_reaches_registered_queue() {
        let mut registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.insert(7, info(), tx);

        let frame = Outbound::Frame(Bytes::from_static(b"frame"));
        assert!(registry.send(7, frame.clone()));
        assert_eq!(rx.try_recv().unwrap(), frame);
    }

    #[test]
    fn send_to_unknown_or_closed_session_fails() {
        let mut registry = ConnectionRegistry::new();
        assert!(!registry.send(1, Outbound::Datagram(Bytes::new())));

        let (tx, rx) = mpsc::unbounded_channel();
        registry.insert(2, info(), tx);
        drop(rx);
        assert!(!registry.send(2, Outbound::Datagram(Bytes::new())));

        assert!(registry.remove(2).is_some());
        assert!(registry.is_empty());
    }
}
