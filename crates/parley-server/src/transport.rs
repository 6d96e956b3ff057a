//! Outbound side of live connections.
//!
//! Each WebSocket task owns the receiving half of a bounded channel; the
//! [`SocketHub`] keeps the sending halves by connection id. A push is an
//! enqueue: a closed or missing channel means the connection is gone.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use parley_shared::ConnectionId;

/// Result of a single push attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The connection no longer exists; its registration should be dropped.
    Stale,
    /// Temporary failure; the connection may still be alive.
    Transient(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn push(&self, connection_id: &ConnectionId, payload: &str) -> PushOutcome;

    /// Ask the transport to close a connection. Unknown ids are ignored.
    fn close(&self, connection_id: &ConnectionId);
}

/// What a socket task receives from the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Close,
}

pub struct SocketHub {
    outboxes: DashMap<ConnectionId, mpsc::Sender<Outbound>>,
    buffer: usize,
}

impl SocketHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            outboxes: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Open the outbox of a connection. Re-attaching replaces the old one.
    pub fn attach(&self, connection_id: &ConnectionId) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.outboxes.insert(connection_id.clone(), tx);
        rx
    }

    pub fn detach(&self, connection_id: &ConnectionId) {
        if self.outboxes.remove(connection_id).is_some() {
            debug!(connection = %connection_id, "Detached socket outbox");
        }
    }

    pub fn attached(&self) -> usize {
        self.outboxes.len()
    }
}

#[async_trait]
impl Transport for SocketHub {
    async fn push(&self, connection_id: &ConnectionId, payload: &str) -> PushOutcome {
        let Some(sender) = self.outboxes.get(connection_id).map(|tx| tx.value().clone()) else {
            return PushOutcome::Stale;
        };

        match sender.send(Outbound::Frame(payload.to_string())).await {
            Ok(()) => PushOutcome::Delivered,
            Err(_) => {
                self.outboxes
                    .remove_if(connection_id, |_, tx| tx.same_channel(&sender));
                PushOutcome::Stale
            }
        }
    }

    fn close(&self, connection_id: &ConnectionId) {
        if let Some((_, sender)) = self.outboxes.remove(connection_id) {
            // A full outbox is dropped with the sender; the socket task
            // then sees the channel end.
            let _ = sender.try_send(Outbound::Close);
            debug!(connection = %connection_id, "Closing connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    #[tokio::test]
    async fn test_push_to_unknown_connection_is_stale() {
        let hub = SocketHub::new(4);
        assert_eq!(hub.push(&conn("nope"), "{}").await, PushOutcome::Stale);
    }

    #[tokio::test]
    async fn test_push_reaches_attached_socket() {
        let hub = SocketHub::new(4);
        let mut rx = hub.attach(&conn("c1"));

        assert_eq!(hub.push(&conn("c1"), "hello").await, PushOutcome::Delivered);
        assert_eq!(rx.recv().await, Some(Outbound::Frame("hello".into())));
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_stale_and_detached() {
        let hub = SocketHub::new(4);
        let rx = hub.attach(&conn("c1"));
        drop(rx);

        assert_eq!(hub.push(&conn("c1"), "hello").await, PushOutcome::Stale);
        assert_eq!(hub.attached(), 0);
    }

    #[tokio::test]
    async fn test_full_outbox_blocks_until_caller_gives_up() {
        let hub = SocketHub::new(1);
        let _rx = hub.attach(&conn("slow"));
        assert_eq!(hub.push(&conn("slow"), "one").await, PushOutcome::Delivered);

        let second = tokio::time::timeout(
            Duration::from_millis(20),
            hub.push(&conn("slow"), "two"),
        )
        .await;
        assert!(second.is_err());
        assert_eq!(hub.attached(), 1);
    }

    #[tokio::test]
    async fn test_close_signals_socket_and_detaches() {
        let hub = SocketHub::new(4);
        let mut rx = hub.attach(&conn("c1"));

        hub.close(&conn("c1"));
        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert_eq!(rx.recv().await, None);
        assert_eq!(hub.push(&conn("c1"), "late").await, PushOutcome::Stale);

        // Closing twice is harmless.
        hub.close(&conn("c1"));
    }
}
