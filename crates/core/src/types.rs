use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Account referenced by an activity payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub handle: String,
    pub name: String,
}

impl UserRef {
    /// Placeholder used when a direct-message side table does not carry the user.
    pub fn unknown(id: &str) -> Self {
        Self {
            id: id.to_string(),
            handle: id.to_string(),
            name: "Unknown User".to_string(),
        }
    }
}

/// Direction of a direct message relative to the subscribed account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Sent,
    Received,
}

/// Normalized view of one webhook delivery.
///
/// Timestamps keep the representation the provider used for that activity
/// kind (provider date strings or epoch-millisecond strings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityEvent {
    ConnectionAck {
        message: String,
    },
    PostCreated {
        author: UserRef,
        text: String,
        post_id: String,
        created_at: String,
    },
    PostDeleted {
        post_id: String,
        user_id: String,
        event_epoch_ms: String,
    },
    Favorited {
        actor: UserRef,
        favorited_post_id: String,
        favorited_post_author_handle: String,
        created_at: String,
    },
    FollowChanged {
        actor: UserRef,
        target: UserRef,
        is_follow: bool,
        created_timestamp: String,
    },
    MuteChanged {
        actor: UserRef,
        target: UserRef,
        is_mute: bool,
        created_timestamp: String,
    },
    ReplayStatus {
        webhook_id: String,
        job_id: String,
        state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    DirectMessageCreated {
        direction: Direction,
        counterpart: UserRef,
        text: String,
        dm_id: String,
        created_timestamp: String,
    },
    DirectMessageOther {
        raw: Value,
    },
    TypingIndicator {
        sender: UserRef,
        recipient: UserRef,
        directed_at_self: bool,
        created_timestamp: String,
    },
    ReadReceipt {
        reader: UserRef,
        original_sender: UserRef,
        last_read_event_id: String,
        self_is_original_sender: bool,
        created_timestamp: String,
    },
    Unrecognized {
        raw: Value,
    },
}

impl ActivityEvent {
    /// Returns the stable tag used for logs, metric labels, and the debug tap.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionAck { .. } => "connection_ack",
            Self::PostCreated { .. } => "post_created",
            Self::PostDeleted { .. } => "post_deleted",
            Self::Favorited { .. } => "favorited",
            Self::FollowChanged { .. } => "follow_changed",
            Self::MuteChanged { .. } => "mute_changed",
            Self::ReplayStatus { .. } => "replay_status",
            Self::DirectMessageCreated { .. } => "direct_message_created",
            Self::DirectMessageOther { .. } => "direct_message_other",
            Self::TypingIndicator { .. } => "typing_indicator",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }

    /// Identifier-only summary without message bodies or display names.
    pub fn redacted(&self) -> Value {
        match self {
            Self::ConnectionAck { .. } => json!({ "kind": self.kind() }),
            Self::PostCreated {
                author, post_id, ..
            } => json!({ "kind": self.kind(), "post_id": post_id, "user_id": author.id }),
            Self::PostDeleted {
                post_id, user_id, ..
            } => json!({ "kind": self.kind(), "post_id": post_id, "user_id": user_id }),
            Self::Favorited {
                actor,
                favorited_post_id,
                ..
            } => json!({
                "kind": self.kind(),
                "user_id": actor.id,
                "post_id": favorited_post_id,
            }),
            Self::FollowChanged {
                actor,
                target,
                is_follow,
                ..
            } => json!({
                "kind": self.kind(),
                "source_id": actor.id,
                "target_id": target.id,
                "follow": is_follow,
            }),
            Self::MuteChanged {
                actor,
                target,
                is_mute,
                ..
            } => json!({
                "kind": self.kind(),
                "source_id": actor.id,
                "target_id": target.id,
                "mute": is_mute,
            }),
            Self::ReplayStatus {
                webhook_id,
                job_id,
                state,
                ..
            } => json!({
                "kind": self.kind(),
                "webhook_id": webhook_id,
                "job_id": job_id,
                "state": state,
            }),
            Self::DirectMessageCreated {
                direction,
                counterpart,
                dm_id,
                ..
            } => json!({
                "kind": self.kind(),
                "direction": direction,
                "counterpart_id": counterpart.id,
                "dm_id": dm_id,
            }),
            Self::TypingIndicator {
                sender,
                directed_at_self,
                ..
            } => json!({
                "kind": self.kind(),
                "sender_id": sender.id,
                "directed_at_self": directed_at_self,
            }),
            Self::ReadReceipt {
                reader,
                last_read_event_id,
                ..
            } => json!({
                "kind": self.kind(),
                "reader_id": reader.id,
                "last_read_event_id": last_read_event_id,
            }),
            Self::DirectMessageOther { raw } | Self::Unrecognized { raw } => {
                let keys: Vec<&str> = raw
                    .as_object()
                    .map(|map| map.keys().map(String::as_str).collect())
                    .unwrap_or_default();
                json!({ "kind": self.kind(), "keys": keys })
            }
        }
    }
}
