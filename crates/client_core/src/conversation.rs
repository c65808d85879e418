use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, Ordering},
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, UserId},
    protocol::{MessageRecord, PeerSummary},
};
use tracing::debug;

/// Attachment metadata resolved before composition. Width and height
/// are only meaningful for images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    pub name: Option<String>,
    pub size_bytes: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// One unit of conversation content. At least one of `text` or
/// `attachment` is populated. `sent_at` is the client-assigned
/// composition timestamp and never changes; `delivered_at` and
/// `read_at` transition null-to-value at most once.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
    pub sent_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub reply_to: Option<i64>,
    pub persisted: bool,
}

impl Message {
    /// A locally composed message awaiting server acknowledgement.
    pub fn outgoing(
        temp_id: MessageId,
        sender_id: UserId,
        text: Option<String>,
        attachment: Option<Attachment>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: temp_id,
            sender_id,
            text,
            attachment,
            sent_at,
            delivered_at: None,
            read_at: None,
            reply_to: None,
            persisted: false,
        }
    }

    /// Hydrates a message from its REST history wire form. History rows
    /// are durable by definition; delivery flags without an explicit
    /// timestamp fall back to the send timestamp so the status machine
    /// still sees them as advanced.
    pub fn from_record(record: MessageRecord) -> Self {
        let attachment = record.file_url.map(|url| Attachment {
            url,
            name: record.file_name,
            size_bytes: record.file_size.as_deref().and_then(|s| s.parse().ok()),
            width: record.image_width,
            height: record.image_height,
        });
        let delivered_at = record
            .delivered_timestamp
            .or_else(|| (record.delivered || record.read).then_some(record.timestamp));
        let read_at = record
            .read_timestamp
            .or_else(|| record.read.then_some(record.timestamp));
        Self {
            id: MessageId::Permanent(record.message_id),
            sender_id: record.sender_id,
            text: record.message_text,
            attachment,
            sent_at: record.timestamp,
            delivered_at,
            read_at,
            reply_to: record.reply_to,
            persisted: true,
        }
    }
}

/// Partial update applied by `ConversationStore::update_message`.
/// Status fields are forward-only: a patch can never clear a timestamp
/// or regress one that is already set.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePatch {
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub persisted: Option<bool>,
}

/// The other participant in a one-to-one conversation. Read-mostly;
/// replaced wholesale on every roster refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: UserId,
    pub username: String,
    pub avatar_url: Option<String>,
    pub is_online: bool,
}

impl From<PeerSummary> for Peer {
    fn from(summary: PeerSummary) -> Self {
        Self {
            id: summary.id,
            username: summary.username,
            avatar_url: summary.profile_picture,
            is_online: summary.is_online,
        }
    }
}

/// Owns every per-peer timeline and applies all mutations to them.
///
/// Timelines are ordered by `sent_at` ascending with stable ties and
/// are created lazily on first merge or insert. All methods are
/// synchronous; the caller serializes access (the client holds the
/// store behind its session mutex).
#[derive(Debug, Default)]
pub struct ConversationStore {
    timelines: HashMap<UserId, Vec<Message>>,
    roster: Vec<Peer>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeline(&self, peer_id: UserId) -> &[Message] {
        self.timelines.get(&peer_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn roster(&self) -> &[Peer] {
        &self.roster
    }

    pub fn peer(&self, peer_id: UserId) -> Option<&Peer> {
        self.roster.iter().find(|peer| peer.id == peer_id)
    }

    pub fn replace_roster(&mut self, peers: Vec<Peer>) {
        self.roster = peers;
    }

    /// Replaces the persisted portion of a peer's timeline with the
    /// server's snapshot. The server is the source of truth for
    /// everything it has stored; unreconciled optimistic entries (still
    /// carrying a temporary id) survive the merge and are re-slotted by
    /// their `sent_at`, to be cleaned up by a later `reconcile`.
    pub fn merge_fetched_history(&mut self, peer_id: UserId, fetched: Vec<Message>) {
        let survivors: Vec<Message> = self
            .timelines
            .remove(&peer_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|message| !message.id.is_permanent())
            .collect();

        let mut timeline: Vec<Message> = Vec::with_capacity(fetched.len() + survivors.len());
        for message in fetched {
            if timeline.iter().any(|existing| existing.id == message.id) {
                debug!(?message.id, "dropping duplicate id in fetched history");
                continue;
            }
            insert_sorted(&mut timeline, message);
        }
        for message in survivors {
            insert_sorted(&mut timeline, message);
        }
        self.timelines.insert(peer_id, timeline);
    }

    /// Appends a locally composed message under its temporary id. A
    /// repeated id is a no-op, matching the idempotence of the push
    /// path.
    pub fn insert_optimistic(&mut self, peer_id: UserId, message: Message) {
        let timeline = self.timelines.entry(peer_id).or_default();
        if timeline.iter().any(|existing| existing.id == message.id) {
            debug!(?message.id, peer = peer_id.0, "optimistic insert skipped: id already present");
            return;
        }
        insert_sorted(timeline, message);
    }

    /// Inserts a message pushed by the remote party. Duplicate delivery
    /// of the same permanent id is absorbed as a no-op. Returns whether
    /// the message was actually inserted.
    pub fn insert_from_push(&mut self, peer_id: UserId, message: Message) -> bool {
        let timeline = self.timelines.entry(peer_id).or_default();
        if timeline.iter().any(|existing| existing.id == message.id) {
            debug!(?message.id, peer = peer_id.0, "push insert skipped: duplicate delivery");
            return false;
        }
        insert_sorted(timeline, message);
        true
    }

    /// Applies a partial update to one message. A missing id is an
    /// expected race (delivered-ack overtaking reconciliation, timeline
    /// cleared by navigation) and resolves as a logged no-op.
    pub fn update_message(&mut self, peer_id: UserId, id: MessageId, patch: MessagePatch) -> bool {
        let Some(message) = self
            .timelines
            .get_mut(&peer_id)
            .and_then(|timeline| timeline.iter_mut().find(|message| message.id == id))
        else {
            debug!(?id, peer = peer_id.0, "update_message: id not found");
            return false;
        };

        if let Some(read_at) = patch.read_at {
            if message.read_at.is_none() {
                message.read_at = Some(read_at);
                // read implies delivered; set atomically when absent
                message.delivered_at.get_or_insert(read_at);
            }
        }
        if let Some(delivered_at) = patch.delivered_at {
            if message.delivered_at.is_none() {
                message.delivered_at = Some(delivered_at);
            }
        }
        if let Some(persisted) = patch.persisted {
            message.persisted = message.persisted || persisted;
        }
        true
    }

    /// Swaps a temporary id for the server-assigned permanent one,
    /// exactly once, preserving the message's ordinal position and
    /// every other field.
    ///
    /// If a fetch-merge already brought in the server's copy under the
    /// permanent id, the stale temporary entry is removed instead of
    /// swapped, keeping ids unique within the timeline. A missing
    /// temporary id (timeline cleared, session reset) is a no-op.
    pub fn reconcile(&mut self, peer_id: UserId, temp_id: i64, permanent_id: i64) -> bool {
        let Some(timeline) = self.timelines.get_mut(&peer_id) else {
            debug!(temp_id, permanent_id, peer = peer_id.0, "reconcile: no timeline for peer");
            return false;
        };

        let permanent = MessageId::Permanent(permanent_id);
        let temporary = MessageId::Temporary(temp_id);

        if timeline.iter().any(|message| message.id == permanent) {
            let before = timeline.len();
            timeline.retain(|message| message.id != temporary);
            if timeline.len() != before {
                debug!(
                    temp_id,
                    permanent_id,
                    "reconcile: permanent id already fetched, dropped stale temporary entry"
                );
            }
            return false;
        }

        match timeline.iter_mut().find(|message| message.id == temporary) {
            Some(message) => {
                message.id = permanent;
                message.persisted = true;
                true
            }
            None => {
                debug!(temp_id, permanent_id, "reconcile: temporary id not found");
                false
            }
        }
    }

    /// Locates which peer's timeline holds a permanent message id.
    /// Delivery and read acks carry only the message id, so the adapter
    /// resolves the conversation here.
    pub fn find_peer_of(&self, permanent_id: i64) -> Option<UserId> {
        let id = MessageId::Permanent(permanent_id);
        self.timelines.iter().find_map(|(peer_id, timeline)| {
            timeline
                .iter()
                .any(|message| message.id == id)
                .then_some(*peer_id)
        })
    }

    /// Number of peer-authored messages not yet marked read.
    pub fn unread_from(&self, peer_id: UserId) -> usize {
        self.timeline(peer_id)
            .iter()
            .filter(|message| message.sender_id == peer_id && message.read_at.is_none())
            .count()
    }

    /// Session teardown. Timelines are never dropped individually
    /// during a session.
    pub fn clear(&mut self) {
        self.timelines.clear();
        self.roster.clear();
    }

    pub(crate) fn timeline_mut(&mut self, peer_id: UserId) -> Option<&mut Vec<Message>> {
        self.timelines.get_mut(&peer_id)
    }
}

/// Inserts keeping `sent_at` ascending order; equal timestamps keep
/// insertion order (new entry goes after existing ties).
fn insert_sorted(timeline: &mut Vec<Message>, message: Message) {
    let position = timeline
        .iter()
        .rposition(|existing| existing.sent_at <= message.sent_at)
        .map(|index| index + 1)
        .unwrap_or(0);
    timeline.insert(position, message);
}

/// Mints temporary message ids from a clock-seeded counter: unique
/// within a session, monotonically informative across sessions, and
/// structurally unable to collide with permanent ids thanks to the
/// tagged `MessageId`.
#[derive(Debug)]
pub struct TempIdSource {
    next: AtomicI64,
}

impl TempIdSource {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn mint(&self) -> MessageId {
        MessageId::Temporary(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TempIdSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Ephemeral correlation between an in-flight send and its peer. The
/// `messageSaved` ack carries only the temporary and permanent ids, so
/// the conversation has to be looked up here. Entries are discarded on
/// resolution or at session teardown; a send that is never acked keeps
/// its entry (and stays `Sending`) for the rest of the session.
#[derive(Debug, Default)]
pub struct PendingSends {
    in_flight: HashMap<i64, UserId>,
}

impl PendingSends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, temp_id: i64, peer_id: UserId) {
        self.in_flight.insert(temp_id, peer_id);
    }

    pub fn resolve(&mut self, temp_id: i64) -> Option<UserId> {
        self.in_flight.remove(&temp_id)
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
