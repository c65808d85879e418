use std::{collections::HashSet, sync::Arc};

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use shared::{
    domain::{MessageId, UserId},
    protocol::{
        InboundEvent, MediaUploadResponse, MessagesSnapshot, OutboundEvent, UnreadCountsResponse,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod channel;
pub mod conversation;
pub mod error;
pub mod status;
pub mod unread;

use channel::EventChannel;
use conversation::{
    Attachment, ConversationStore, Message, Peer, PendingSends, TempIdSource,
};
use error::SendMessageError;
use status::StatusTracker;
use unread::UnreadCounters;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base url of the REST collaborator, e.g. `http://127.0.0.1:3000`.
    pub server_url: String,
    pub event_buffer: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            event_buffer: 1024,
        }
    }
}

/// Notifications for the rendering layer. Consumers read the actual
/// state back through the accessors; events only say what changed.
#[derive(Debug, Clone)]
pub enum StateEvent {
    TimelineUpdated { peer_id: UserId },
    RosterUpdated,
    UnreadCountsChanged { messages: u32, notifications: u32 },
    PeerTyping { peer_id: UserId, typing: bool },
    Error(String),
}

/// An attachment to resolve through `POST /messages/media` before the
/// message carrying it is composed.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Snapshot of both unread counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadSnapshot {
    pub messages: u32,
    pub notifications: u32,
}

struct ClientState {
    user_id: Option<UserId>,
    active_peer: Option<UserId>,
    conversations: ConversationStore,
    pending: PendingSends,
    unread: UnreadCounters,
    typing_peers: HashSet<UserId>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            user_id: None,
            active_peer: None,
            conversations: ConversationStore::new(),
            pending: PendingSends::new(),
            unread: UnreadCounters::new(),
            typing_peers: HashSet::new(),
        }
    }

    fn reset(&mut self) {
        self.user_id = None;
        self.active_peer = None;
        self.conversations.clear();
        self.pending.clear();
        self.unread = UnreadCounters::new();
        self.typing_peers.clear();
    }
}

/// The message synchronization engine: merges REST history, optimistic
/// local sends, and live push events into per-peer timelines, tracks
/// the sent/delivered/read lifecycle, and keeps the unread counters.
///
/// All state lives behind one mutex; every handler runs to completion
/// under it and must re-validate anything it learned before an await.
pub struct MessengerClient {
    http: Client,
    config: ClientConfig,
    channel: Arc<dyn EventChannel>,
    temp_ids: TempIdSource,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<StateEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MessengerClient {
    pub fn new(config: ClientConfig, channel: Arc<dyn EventChannel>) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_buffer);
        Arc::new(Self {
            http: Client::new(),
            config,
            channel,
            temp_ids: TempIdSource::new(),
            inner: Mutex::new(ClientState::new()),
            events,
            pump: Mutex::new(None),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Binds the session to a user, seeds the unread counters from the
    /// count endpoint, and starts dispatching inbound channel events.
    /// The channel itself has already registered the user; this is the
    /// engine-side half of session start.
    pub async fn start_session(self: &Arc<Self>, user_id: UserId) -> Result<()> {
        {
            let mut guard = self.inner.lock().await;
            guard.reset();
            guard.user_id = Some(user_id);
        }

        let client = Arc::clone(self);
        let mut rx = self.channel.subscribe();
        let pump = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => client.handle_inbound(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event pump lagged behind the channel");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.pump.lock().await.replace(pump) {
            previous.abort();
        }

        self.seed_unread_counts(user_id).await?;
        info!(user_id = user_id.0, "session started");
        Ok(())
    }

    /// Session teardown: stops the pump, clears all in-memory state,
    /// and closes the channel.
    pub async fn end_session(&self) {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.inner.lock().await.reset();
        self.channel.close().await;
        info!("session ended");
    }

    /// Full roster and history fetch; the designated resynchronization
    /// point after any gap. On failure the stores keep their last-known
    /// state and the error propagates to the caller.
    pub async fn refresh_conversations(&self) -> Result<()> {
        let user_id = self.session_user().await?;
        let snapshot: MessagesSnapshot = self
            .http
            .get(format!("{}/messages/{}", self.config.server_url, user_id.0))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid messages snapshot from server")?;

        let mut updated = Vec::new();
        {
            let mut guard = self.inner.lock().await;
            guard
                .conversations
                .replace_roster(snapshot.users.into_iter().map(Peer::from).collect());
            for (peer_key, records) in snapshot.messages {
                let Ok(raw_id) = peer_key.parse::<i64>() else {
                    warn!(%peer_key, "skipping non-numeric peer key in snapshot");
                    continue;
                };
                let peer_id = UserId(raw_id);
                let fetched = records.into_iter().map(Message::from_record).collect();
                guard.conversations.merge_fetched_history(peer_id, fetched);
                updated.push(peer_id);
            }
        }

        let _ = self.events.send(StateEvent::RosterUpdated);
        for peer_id in updated {
            let _ = self.events.send(StateEvent::TimelineUpdated { peer_id });
        }
        Ok(())
    }

    /// Opens a conversation: refreshes from the server, makes the peer
    /// active, and runs local read detection (batched receipt emit plus
    /// counter decrement).
    pub async fn open_conversation(&self, peer_id: UserId) -> Result<()> {
        self.refresh_conversations().await?;
        {
            let mut guard = self.inner.lock().await;
            guard.active_peer = Some(peer_id);
        }
        self.mark_conversation_read(peer_id).await;
        Ok(())
    }

    pub async fn close_conversation(&self) {
        self.inner.lock().await.active_peer = None;
    }

    /// Optimistic send: resolves the attachment first (a failed upload
    /// aborts before anything is inserted), appends the message under a
    /// fresh temporary id, records the pending correlation, and emits
    /// the send request. The message stays `Sending` until the saved
    /// ack reconciles it; there is no timeout or retry.
    pub async fn send_message(
        &self,
        peer_id: UserId,
        text: Option<String>,
        attachment: Option<AttachmentUpload>,
    ) -> Result<MessageId, SendMessageError> {
        let user_id = self
            .session_user()
            .await
            .map_err(|_| SendMessageError::NotLoggedIn)?;

        let text = text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if text.is_none() && attachment.is_none() {
            return Err(SendMessageError::EmptyMessage);
        }

        let uploaded = match attachment {
            Some(upload) => Some(
                self.upload_media(&upload)
                    .await
                    .map_err(SendMessageError::MediaUpload)?,
            ),
            None => None,
        };
        let resolved = uploaded.as_ref().map(|media| Attachment {
            url: media.file_url.clone(),
            name: media.file_name.clone(),
            size_bytes: media.file_size.as_deref().and_then(|s| s.parse().ok()),
            width: media.image_width,
            height: media.image_height,
        });

        let temp_id = self.temp_ids.mint();
        let MessageId::Temporary(temp_value) = temp_id else {
            unreachable!("temp id source mints temporary ids");
        };
        let sent_at = Utc::now();

        {
            let mut guard = self.inner.lock().await;
            guard.conversations.insert_optimistic(
                peer_id,
                Message::outgoing(temp_id, user_id, text.clone(), resolved, sent_at),
            );
            guard.pending.record(temp_value, peer_id);
        }
        let _ = self.events.send(StateEvent::TimelineUpdated { peer_id });

        let request = OutboundEvent::SendMessage {
            temp_id: temp_value,
            sender_id: user_id,
            receiver_id: peer_id,
            text,
            file_url: uploaded.as_ref().map(|media| media.file_url.clone()),
            file_name: uploaded.as_ref().and_then(|media| media.file_name.clone()),
            file_size: uploaded.as_ref().and_then(|media| media.file_size.clone()),
            image_width: uploaded.as_ref().and_then(|media| media.image_width),
            image_height: uploaded.as_ref().and_then(|media| media.image_height),
            reply_to: None,
        };
        self.channel
            .send(request)
            .await
            .map_err(SendMessageError::Channel)?;

        Ok(temp_id)
    }

    /// Clears the notification counter (the notifications tab was
    /// viewed). Messages have no equivalent; their counter only moves
    /// through read detection and server pushes.
    pub async fn reset_notifications(&self) {
        let counts = {
            let mut guard = self.inner.lock().await;
            guard.unread.reset_notifications();
            guard.unread
        };
        let _ = self.events.send(StateEvent::UnreadCountsChanged {
            messages: counts.messages(),
            notifications: counts.notifications(),
        });
    }

    pub async fn timeline(&self, peer_id: UserId) -> Vec<Message> {
        self.inner.lock().await.conversations.timeline(peer_id).to_vec()
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.inner.lock().await.conversations.roster().to_vec()
    }

    pub async fn unread_counts(&self) -> UnreadSnapshot {
        let guard = self.inner.lock().await;
        UnreadSnapshot {
            messages: guard.unread.messages(),
            notifications: guard.unread.notifications(),
        }
    }

    pub async fn is_peer_typing(&self, peer_id: UserId) -> bool {
        self.inner.lock().await.typing_peers.contains(&peer_id)
    }

    async fn session_user(&self) -> Result<UserId> {
        self.inner
            .lock()
            .await
            .user_id
            .ok_or_else(|| anyhow::anyhow!("not logged in: missing user_id"))
    }

    async fn seed_unread_counts(&self, user_id: UserId) -> Result<()> {
        let counts: UnreadCountsResponse = self
            .http
            .get(format!(
                "{}/notifications/count/{}",
                self.config.server_url, user_id.0
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        {
            let mut guard = self.inner.lock().await;
            guard.unread.set_messages(counts.unread_messages);
            guard.unread.set_notifications(counts.unread_notifications);
        }
        let _ = self.events.send(StateEvent::UnreadCountsChanged {
            messages: counts.unread_messages,
            notifications: counts.unread_notifications,
        });
        Ok(())
    }

    async fn upload_media(&self, upload: &AttachmentUpload) -> Result<MediaUploadResponse> {
        let mut part = reqwest::multipart::Part::bytes(upload.bytes.clone())
            .file_name(upload.filename.clone());
        if let Some(mime) = &upload.mime_type {
            part = part
                .mime_str(mime)
                .with_context(|| format!("invalid attachment mime type '{mime}'"))?;
        }
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(format!("{}/messages/media", self.config.server_url))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid media upload response")?;
        Ok(response)
    }

    /// Local read detection for one conversation. Counter and timeline
    /// changes happen under the lock; the batched receipt is emitted
    /// after, and a failed emit only logs (the server will re-push
    /// counts; the local state is already consistent).
    async fn mark_conversation_read(&self, peer_id: UserId) {
        let (outcome, user_id, counts) = {
            let mut guard = self.inner.lock().await;
            let Some(user_id) = guard.user_id else {
                return;
            };
            let ClientState {
                conversations,
                unread,
                ..
            } = &mut *guard;
            let outcome =
                StatusTracker::new(conversations, unread).mark_conversation_read(peer_id, Utc::now());
            (outcome, user_id, *unread)
        };

        if outcome.newly_read == 0 {
            return;
        }
        let _ = self.events.send(StateEvent::TimelineUpdated { peer_id });
        let _ = self.events.send(StateEvent::UnreadCountsChanged {
            messages: counts.messages(),
            notifications: counts.notifications(),
        });

        if outcome.acked_ids.is_empty() {
            return;
        }
        if let Err(err) = self
            .channel
            .send(OutboundEvent::MessageRead {
                sender_id: peer_id,
                receiver_id: user_id,
                message_ids: outcome.acked_ids,
            })
            .await
        {
            warn!(peer = peer_id.0, "failed to emit read receipt batch: {err}");
            let _ = self
                .events
                .send(StateEvent::Error(format!("read receipt emit failed: {err}")));
        }
    }

    async fn handle_inbound(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::ReceiveMessage {
                sender_id,
                message_id,
                message_text,
                file_url,
                file_name,
                file_size,
                image_width,
                image_height,
                reply_to,
            } => {
                let attachment = file_url.map(|url| Attachment {
                    url,
                    name: file_name,
                    size_bytes: file_size.as_deref().and_then(|s| s.parse().ok()),
                    width: image_width,
                    height: image_height,
                });
                let message = Message {
                    id: MessageId::Permanent(message_id),
                    sender_id,
                    text: message_text,
                    attachment,
                    sent_at: Utc::now(),
                    delivered_at: None,
                    read_at: None,
                    reply_to,
                    persisted: true,
                };

                let (inserted, known_peer, conversation_open, counts) = {
                    let mut guard = self.inner.lock().await;
                    let known_peer = guard.conversations.peer(sender_id).is_some();
                    let inserted = guard.conversations.insert_from_push(sender_id, message);
                    let conversation_open = guard.active_peer == Some(sender_id);
                    if inserted && !conversation_open {
                        guard.unread.increment_messages();
                    }
                    (inserted, known_peer, conversation_open, guard.unread)
                };

                if !known_peer {
                    // first contact from this peer; pull the roster so the
                    // conversation list can render them
                    let client = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(err) = client.refresh_conversations().await {
                            warn!("roster refresh after unknown-peer message failed: {err}");
                        }
                    });
                }
                if !inserted {
                    return;
                }
                let _ = self
                    .events
                    .send(StateEvent::TimelineUpdated { peer_id: sender_id });
                if conversation_open {
                    // the user is looking at this timeline right now
                    self.mark_conversation_read(sender_id).await;
                } else {
                    let _ = self.events.send(StateEvent::UnreadCountsChanged {
                        messages: counts.messages(),
                        notifications: counts.notifications(),
                    });
                }
            }
            InboundEvent::MessageSaved { temp_id, message_id } => {
                let peer_id = {
                    let mut guard = self.inner.lock().await;
                    let Some(peer_id) = guard.pending.resolve(temp_id) else {
                        debug!(temp_id, message_id, "saved ack without pending send");
                        return;
                    };
                    guard.conversations.reconcile(peer_id, temp_id, message_id);
                    peer_id
                };
                let _ = self.events.send(StateEvent::TimelineUpdated { peer_id });
            }
            InboundEvent::MessageDelivered {
                message_id,
                delivered_timestamp,
            } => {
                let peer_id = {
                    let mut guard = self.inner.lock().await;
                    let Some(peer_id) = guard.conversations.find_peer_of(message_id) else {
                        debug!(message_id, "delivered ack for unknown message");
                        return;
                    };
                    let ClientState {
                        conversations,
                        unread,
                        ..
                    } = &mut *guard;
                    StatusTracker::new(conversations, unread).apply_delivered_ack(
                        peer_id,
                        message_id,
                        delivered_timestamp,
                    );
                    peer_id
                };
                let _ = self.events.send(StateEvent::TimelineUpdated { peer_id });
            }
            InboundEvent::MessageRead {
                receiver_id,
                message_ids,
            } => {
                {
                    let mut guard = self.inner.lock().await;
                    let ClientState {
                        conversations,
                        unread,
                        ..
                    } = &mut *guard;
                    StatusTracker::new(conversations, unread)
                        .apply_read_ack(receiver_id, &message_ids);
                }
                let _ = self
                    .events
                    .send(StateEvent::TimelineUpdated { peer_id: receiver_id });
            }
            InboundEvent::Typing {
                sender_id,
                receiver_id,
            } => {
                self.set_typing(sender_id, receiver_id, true).await;
            }
            InboundEvent::StopTyping {
                sender_id,
                receiver_id,
            } => {
                self.set_typing(sender_id, receiver_id, false).await;
            }
            InboundEvent::UnreadMessagesCount { unread_count } => {
                let counts = {
                    let mut guard = self.inner.lock().await;
                    guard.unread.set_messages(unread_count);
                    guard.unread
                };
                let _ = self.events.send(StateEvent::UnreadCountsChanged {
                    messages: counts.messages(),
                    notifications: counts.notifications(),
                });
            }
            InboundEvent::UnreadCountResponse {
                target_user_id,
                unread_count,
            } => {
                let counts = {
                    let mut guard = self.inner.lock().await;
                    if guard.user_id != Some(target_user_id) {
                        debug!(
                            target_user = target_user_id.0,
                            "ignoring unread count addressed to another user"
                        );
                        return;
                    }
                    guard.unread.set_messages(unread_count);
                    guard.unread
                };
                let _ = self.events.send(StateEvent::UnreadCountsChanged {
                    messages: counts.messages(),
                    notifications: counts.notifications(),
                });
            }
        }
    }

    async fn set_typing(&self, sender_id: UserId, receiver_id: UserId, typing: bool) {
        let changed = {
            let mut guard = self.inner.lock().await;
            if guard.user_id != Some(receiver_id) {
                return;
            }
            if typing {
                guard.typing_peers.insert(sender_id)
            } else {
                guard.typing_peers.remove(&sender_id)
            }
        };
        if changed {
            let _ = self.events.send(StateEvent::PeerTyping {
                peer_id: sender_id,
                typing,
            });
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
