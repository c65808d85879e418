use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::ReadReceipt,
};
use tracing::debug;

use crate::{
    conversation::{ConversationStore, Message, MessagePatch},
    unread::UnreadCounters,
};

/// Delivery lifecycle of a message, derived from its fields. States are
/// reachable only in order; stale acks for an earlier state are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeliveryStatus {
    /// Local only; the server has not acknowledged durable storage.
    Sending,
    /// Durably stored (identity reconciled to a permanent id).
    Saved,
    Delivered,
    Read,
}

impl Message {
    pub fn status(&self) -> DeliveryStatus {
        if self.read_at.is_some() {
            DeliveryStatus::Read
        } else if self.delivered_at.is_some() {
            DeliveryStatus::Delivered
        } else if self.persisted {
            DeliveryStatus::Saved
        } else {
            DeliveryStatus::Sending
        }
    }
}

/// Outcome of local read detection: the permanent ids to acknowledge in
/// one batched read-receipt emit, and the unread-counter decrement that
/// was applied.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub acked_ids: Vec<i64>,
    pub newly_read: u32,
}

/// Advances messages through their delivery state machine and keeps the
/// unread counters in step. Borrows the store and counters for the
/// duration of one handler; the owning client serializes handlers.
pub struct StatusTracker<'a> {
    store: &'a mut ConversationStore,
    unread: &'a mut UnreadCounters,
}

impl<'a> StatusTracker<'a> {
    pub fn new(store: &'a mut ConversationStore, unread: &'a mut UnreadCounters) -> Self {
        Self { store, unread }
    }

    /// Remote delivered-ack, keyed by permanent id. Ignored once the
    /// message is already delivered or read (monotonicity), and a
    /// logged no-op when the id is unknown.
    pub fn apply_delivered_ack(
        &mut self,
        peer_id: UserId,
        message_id: i64,
        delivered_at: DateTime<Utc>,
    ) {
        self.store.update_message(
            peer_id,
            MessageId::Permanent(message_id),
            MessagePatch {
                delivered_at: Some(delivered_at),
                ..MessagePatch::default()
            },
        );
    }

    /// Remote read-ack batch. The server's clock provides `read_at`;
    /// delivery is marked atomically for messages the delivered-ack
    /// never reached.
    pub fn apply_read_ack(&mut self, peer_id: UserId, receipts: &[ReadReceipt]) {
        for receipt in receipts {
            self.store.update_message(
                peer_id,
                MessageId::Permanent(receipt.message_id),
                MessagePatch {
                    read_at: Some(receipt.read_timestamp),
                    ..MessagePatch::default()
                },
            );
        }
    }

    /// Local read detection, run when the user views a conversation:
    /// marks every unread peer-authored message read, decrements the
    /// message counter by the number of newly read messages (floored at
    /// zero), and reports the permanent ids to acknowledge upstream.
    pub fn mark_conversation_read(&mut self, peer_id: UserId, now: DateTime<Utc>) -> ReadOutcome {
        let Some(timeline) = self.store.timeline_mut(peer_id) else {
            return ReadOutcome::default();
        };

        let mut outcome = ReadOutcome::default();
        for message in timeline.iter_mut() {
            if message.sender_id != peer_id || message.read_at.is_some() {
                continue;
            }
            message.read_at = Some(now);
            message.delivered_at.get_or_insert(now);
            outcome.newly_read += 1;
            match message.id.permanent_value() {
                Some(id) => outcome.acked_ids.push(id),
                // peer-authored messages always arrive with permanent
                // ids; anything else cannot be acked meaningfully
                None => debug!(?message.id, "read detection skipped ack for non-permanent id"),
            }
        }

        if outcome.newly_read > 0 {
            self.unread.decrement_messages(outcome.newly_read);
        }
        outcome
    }
}

#[cfg(test)]
#[path = "tests/status_tests.rs"]
mod tests;
