//! Message delivery: persist first, then push to the receiver's live
//! connections.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use parley_shared::protocol::ServerEvent;
use parley_shared::{ConnectionId, ConversationId, Message, OutgoingMessage, SequenceClock};
use parley_store::{MessageStore, StoreError};

use crate::error::ServerError;
use crate::registry::ConnectionRegistry;
use crate::transport::{PushOutcome, Transport};

/// What happened to one routed message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryOutcome {
    pub persisted: bool,
    /// At least one live connection accepted the push.
    pub delivered: bool,
    pub delivered_to: usize,
    /// Stale connections dropped from the registry while routing.
    pub pruned: usize,
    pub transient_failures: usize,
}

pub struct DeliveryRouter {
    store: Arc<dyn MessageStore>,
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    clock: SequenceClock,
    push_timeout: Duration,
    append_timeout: Duration,
    /// Per conversation, held from key assignment until the append
    /// completes so a conversation's appends land in sequence-key order.
    /// Entries exist only while a send is in flight.
    append_order: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl DeliveryRouter {
    pub fn new(
        store: Arc<dyn MessageStore>,
        registry: Arc<ConnectionRegistry>,
        transport: Arc<dyn Transport>,
        push_timeout: Duration,
        append_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            transport,
            clock: SequenceClock::new(),
            push_timeout,
            append_timeout,
            append_order: DashMap::new(),
        }
    }

    /// Persist `outgoing` and push it to the receiver.
    ///
    /// `origin` is the sender's connection tied to this request, if any;
    /// it is never pushed to, nor is any other connection of the sender.
    pub async fn route(
        &self,
        outgoing: OutgoingMessage,
        origin: Option<&ConnectionId>,
    ) -> Result<(Message, DeliveryOutcome), ServerError> {
        outgoing.validate()?;
        let self_message = outgoing.is_self_message();

        let message = self.append_in_order(outgoing).await?;

        let mut outcome = DeliveryOutcome {
            persisted: true,
            ..DeliveryOutcome::default()
        };

        if self_message {
            debug!(id = %message.id, user = %message.sender_id, "Self message, stored only");
            return Ok((message, outcome));
        }

        let senders = self.registry.resolve(&message.sender_id);
        let mut targets: Vec<ConnectionId> = self
            .registry
            .resolve(&message.receiver_id)
            .into_iter()
            .filter(|id| !senders.contains(id) && Some(id) != origin)
            .collect();
        targets.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        if targets.is_empty() {
            debug!(
                id = %message.id,
                receiver = %message.receiver_id,
                "Receiver has no live connection, stored only"
            );
            return Ok((message, outcome));
        }

        let payload = ServerEvent::Message(message.clone()).to_json()?;

        for connection_id in &targets {
            let pushed =
                tokio::time::timeout(self.push_timeout, self.transport.push(connection_id, &payload))
                    .await;

            match pushed {
                Ok(PushOutcome::Delivered) => outcome.delivered_to += 1,
                Ok(PushOutcome::Stale) => {
                    if self.registry.unregister(&message.receiver_id, connection_id) {
                        outcome.pruned += 1;
                    }
                    self.transport.close(connection_id);
                    debug!(
                        receiver = %message.receiver_id,
                        connection = %connection_id,
                        "Pruned stale connection"
                    );
                }
                Ok(PushOutcome::Transient(reason)) => {
                    outcome.transient_failures += 1;
                    warn!(connection = %connection_id, reason = %reason, "Push failed");
                }
                Err(_) => {
                    outcome.transient_failures += 1;
                    warn!(
                        connection = %connection_id,
                        timeout = ?self.push_timeout,
                        "Push timed out"
                    );
                }
            }
        }

        outcome.delivered = outcome.delivered_to > 0;
        info!(
            id = %message.id,
            conversation = %message.conversation_id,
            kind = ?message.kind(),
            delivered_to = outcome.delivered_to,
            pruned = outcome.pruned,
            "Routed message"
        );

        Ok((message, outcome))
    }

    /// Stamp a sequence key and append, serialised per conversation only.
    async fn append_in_order(&self, outgoing: OutgoingMessage) -> Result<Message, ServerError> {
        let conversation_id = outgoing.conversation_id();
        let order = Arc::clone(&self.append_order.entry(conversation_id.clone()).or_default());

        let appended = {
            let _order = order.lock().await;
            let message = outgoing.into_message(self.clock.next(), Utc::now());
            match tokio::time::timeout(self.append_timeout, self.store.append(&message)).await {
                Ok(Ok(())) => Ok(message),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(StoreError::Timeout(self.append_timeout)),
            }
        };

        drop(order);
        self.append_order
            .remove_if(&conversation_id, |_, lock| Arc::strong_count(lock) == 1);

        appended.map_err(|e| {
            warn!(conversation = %conversation_id, error = %e, "Append failed");
            ServerError::from(e)
        })
    }

    #[cfg(test)]
    fn conversations_in_flight(&self) -> usize {
        self.append_order.len()
    }
}
