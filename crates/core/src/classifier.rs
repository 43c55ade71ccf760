use serde_json::Value;

use crate::types::{ActivityEvent, Direction, UserRef};

/// Classifies a raw webhook delivery into an [`ActivityEvent`].
///
/// The provider does not tag deliveries; each activity kind arrives under its
/// own array-valued key. Checks run in a fixed order and the first match wins.
/// The function is total: anything unmatched becomes
/// [`ActivityEvent::Unrecognized`] carrying the original payload.
pub fn classify(payload: &Value) -> ActivityEvent {
    if text_at(payload, "/type") == "connection_ack" {
        return ActivityEvent::ConnectionAck {
            message: text_at(payload, "/message"),
        };
    }

    if let Some(post) = first_entry(payload, "tweet_create_events") {
        return ActivityEvent::PostCreated {
            author: user_at(post, "/user"),
            text: text_at(post, "/text"),
            post_id: id_at(post, ""),
            created_at: text_at(post, "/created_at"),
        };
    }

    if let Some(deleted) = first_entry(payload, "tweet_delete_events") {
        return ActivityEvent::PostDeleted {
            post_id: text_at(deleted, "/status/id"),
            user_id: text_at(deleted, "/status/user_id"),
            event_epoch_ms: text_at(deleted, "/timestamp_ms"),
        };
    }

    if let Some(favorite) = first_entry(payload, "favorite_events") {
        return ActivityEvent::Favorited {
            actor: user_at(favorite, "/user"),
            favorited_post_id: id_at(favorite, "/favorited_status"),
            favorited_post_author_handle: text_at(favorite, "/favorited_status/user/screen_name"),
            created_at: text_at(favorite, "/created_at"),
        };
    }

    if let Some(follow) = first_entry(payload, "follow_events") {
        return ActivityEvent::FollowChanged {
            actor: user_at(follow, "/source"),
            target: user_at(follow, "/target"),
            is_follow: text_at(follow, "/type") == "follow",
            created_timestamp: text_at(follow, "/created_timestamp"),
        };
    }

    if let Some(mute) = first_entry(payload, "mute_events") {
        return ActivityEvent::MuteChanged {
            actor: user_at(mute, "/source"),
            target: user_at(mute, "/target"),
            is_mute: text_at(mute, "/type") == "mute",
            created_timestamp: text_at(mute, "/created_timestamp"),
        };
    }

    if let Some(status) = payload.get("replay_job_status").filter(|v| !v.is_null()) {
        let description = text_at(status, "/job_state_description");
        return ActivityEvent::ReplayStatus {
            webhook_id: text_at(status, "/webhook_id"),
            job_id: text_at(status, "/job_id"),
            state: text_at(status, "/job_state"),
            description: (!description.is_empty()).then_some(description),
        };
    }

    let for_user_id = text_at(payload, "/for_user_id");

    if let Some(message) = first_entry(payload, "direct_message_events") {
        if text_at(message, "/type") != "message_create" {
            return ActivityEvent::DirectMessageOther {
                raw: payload.clone(),
            };
        }

        let sender_id = text_at(message, "/message_create/sender_id");
        let recipient_id = text_at(message, "/message_create/target/recipient_id");
        let (direction, counterpart_id) = if sender_id == for_user_id {
            (Direction::Sent, recipient_id)
        } else {
            (Direction::Received, sender_id)
        };

        return ActivityEvent::DirectMessageCreated {
            direction,
            counterpart: side_table_user(payload, &counterpart_id),
            text: text_at(message, "/message_create/message_data/text"),
            dm_id: text_at(message, "/id"),
            created_timestamp: text_at(message, "/created_timestamp"),
        };
    }

    if let Some(typing) = first_entry(payload, "direct_message_indicate_typing_events") {
        let recipient_id = text_at(typing, "/target/recipient_id");
        return ActivityEvent::TypingIndicator {
            sender: side_table_user(payload, &text_at(typing, "/sender_id")),
            directed_at_self: recipient_id == for_user_id,
            recipient: side_table_user(payload, &recipient_id),
            created_timestamp: text_at(typing, "/created_timestamp"),
        };
    }

    if let Some(read) = first_entry(payload, "direct_message_mark_read_events") {
        let original_sender_id = text_at(read, "/target/recipient_id");
        return ActivityEvent::ReadReceipt {
            reader: side_table_user(payload, &text_at(read, "/sender_id")),
            self_is_original_sender: original_sender_id == for_user_id,
            original_sender: side_table_user(payload, &original_sender_id),
            last_read_event_id: text_at(read, "/last_read_event_id"),
            created_timestamp: text_at(read, "/created_timestamp"),
        };
    }

    ActivityEvent::Unrecognized {
        raw: payload.clone(),
    }
}

fn first_entry<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
}

/// Reads a scalar at `pointer` as text; numbers are stringified, anything else is empty.
fn text_at(value: &Value, pointer: &str) -> String {
    match value.pointer(pointer) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::Bool(flag)) => flag.to_string(),
        _ => String::new(),
    }
}

/// v1.1 objects carry both `id_str` and a numeric `id`; prefer the string form.
fn id_at(value: &Value, pointer: &str) -> String {
    let id_str = text_at(value, &format!("{pointer}/id_str"));
    if id_str.is_empty() {
        text_at(value, &format!("{pointer}/id"))
    } else {
        id_str
    }
}

fn user_at(value: &Value, pointer: &str) -> UserRef {
    UserRef {
        id: id_at(value, pointer),
        handle: text_at(value, &format!("{pointer}/screen_name")),
        name: text_at(value, &format!("{pointer}/name")),
    }
}

fn side_table_user(payload: &Value, id: &str) -> UserRef {
    match payload.get("users").and_then(|users| users.get(id)) {
        Some(entry) if entry.is_object() => {
            let mut user = user_at(entry, "");
            if user.id.is_empty() {
                user.id = id.to_string();
            }
            user
        }
        _ => UserRef::unknown(id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connection_ack_is_checked_first() {
        let payload = json!({
            "type": "connection_ack",
            "message": "attached",
            "tweet_create_events": [{ "id_str": "1" }]
        });
        assert_eq!(
            classify(&payload),
            ActivityEvent::ConnectionAck {
                message: "attached".into()
            }
        );
    }

    #[test]
    fn post_created_keeps_id_handle_and_text() {
        let payload = json!({
            "for_user_id": "2244994945",
            "tweet_create_events": [{
                "created_at": "Thu May 15 12:35:18 +0000 2025",
                "id": 1923000000000000000u64,
                "id_str": "1923000000000000001",
                "text": "hello <world>",
                "user": { "id": 7, "id_str": "7", "name": "Seven", "screen_name": "seven" }
            }]
        });

        match classify(&payload) {
            ActivityEvent::PostCreated {
                author,
                text,
                post_id,
                created_at,
            } => {
                assert_eq!(post_id, "1923000000000000001");
                assert_eq!(author.handle, "seven");
                assert_eq!(author.id, "7");
                assert_eq!(text, "hello <world>");
                assert_eq!(created_at, "Thu May 15 12:35:18 +0000 2025");
            }
            other => panic!("expected post_created, got {other:?}"),
        }
    }

    #[test]
    fn empty_arrays_do_not_match() {
        let payload = json!({
            "tweet_create_events": [],
            "tweet_delete_events": [{
                "status": { "id": "99", "user_id": "7" },
                "timestamp_ms": "1700000000000"
            }]
        });
        assert_eq!(
            classify(&payload),
            ActivityEvent::PostDeleted {
                post_id: "99".into(),
                user_id: "7".into(),
                event_epoch_ms: "1700000000000".into(),
            }
        );
    }

    #[test]
    fn favorite_event_extracts_post_author() {
        let payload = json!({
            "favorite_events": [{
                "created_at": "Mon Oct 13 10:00:00 +0000 2025",
                "favorited_status": { "id_str": "55", "user": { "screen_name": "author" } },
                "user": { "id_str": "8", "name": "Eight", "screen_name": "eight" }
            }]
        });
        match classify(&payload) {
            ActivityEvent::Favorited {
                actor,
                favorited_post_id,
                favorited_post_author_handle,
                ..
            } => {
                assert_eq!(actor.handle, "eight");
                assert_eq!(favorited_post_id, "55");
                assert_eq!(favorited_post_author_handle, "author");
            }
            other => panic!("expected favorited, got {other:?}"),
        }
    }

    #[test]
    fn follow_and_unfollow_are_distinguished() {
        let follow = json!({
            "follow_events": [{
                "type": "follow",
                "created_timestamp": "1700000000000",
                "source": { "id": "1", "name": "A", "screen_name": "a" },
                "target": { "id": "2", "name": "B", "screen_name": "b" }
            }]
        });
        let unfollow = json!({
            "follow_events": [{
                "type": "unfollow",
                "source": { "id": "1" },
                "target": { "id": "2" }
            }]
        });
        assert!(matches!(
            classify(&follow),
            ActivityEvent::FollowChanged { is_follow: true, ref target, .. } if target.handle == "b"
        ));
        assert!(matches!(
            classify(&unfollow),
            ActivityEvent::FollowChanged { is_follow: false, .. }
        ));
    }

    #[test]
    fn mute_events_classify_after_follow() {
        let payload = json!({
            "mute_events": [{
                "type": "unmute",
                "source": { "id": "1", "screen_name": "a" },
                "target": { "id": "3", "screen_name": "c" }
            }]
        });
        assert!(matches!(
            classify(&payload),
            ActivityEvent::MuteChanged { is_mute: false, .. }
        ));
    }

    #[test]
    fn replay_status_description_is_optional() {
        let payload = json!({
            "replay_job_status": {
                "webhook_id": "wh-1",
                "job_id": "job-9",
                "job_state": "Complete"
            }
        });
        assert_eq!(
            classify(&payload),
            ActivityEvent::ReplayStatus {
                webhook_id: "wh-1".into(),
                job_id: "job-9".into(),
                state: "Complete".into(),
                description: None,
            }
        );
    }

    fn dm_payload(sender: &str, recipient: &str) -> Value {
        json!({
            "for_user_id": "100",
            "direct_message_events": [{
                "type": "message_create",
                "id": "dm-1",
                "created_timestamp": "1700000000000",
                "message_create": {
                    "target": { "recipient_id": recipient },
                    "sender_id": sender,
                    "message_data": { "text": "hi there" }
                }
            }],
            "users": {
                "100": { "id": "100", "name": "Me", "screen_name": "me" },
                "200": { "id": "200", "name": "Friend", "screen_name": "friend" }
            }
        })
    }

    #[test]
    fn direct_message_direction_follows_for_user_id() {
        match classify(&dm_payload("100", "200")) {
            ActivityEvent::DirectMessageCreated {
                direction,
                counterpart,
                text,
                ..
            } => {
                assert_eq!(direction, Direction::Sent);
                assert_eq!(counterpart.handle, "friend");
                assert_eq!(text, "hi there");
            }
            other => panic!("expected dm, got {other:?}"),
        }

        match classify(&dm_payload("200", "100")) {
            ActivityEvent::DirectMessageCreated {
                direction,
                counterpart,
                ..
            } => {
                assert_eq!(direction, Direction::Received);
                assert_eq!(counterpart.name, "Friend");
            }
            other => panic!("expected dm, got {other:?}"),
        }
    }

    #[test]
    fn direct_message_counterpart_falls_back_to_unknown() {
        match classify(&dm_payload("300", "100")) {
            ActivityEvent::DirectMessageCreated { counterpart, .. } => {
                assert_eq!(counterpart, UserRef::unknown("300"));
                assert_eq!(counterpart.name, "Unknown User");
            }
            other => panic!("expected dm, got {other:?}"),
        }
    }

    #[test]
    fn other_direct_message_types_keep_payload() {
        let payload = json!({
            "direct_message_events": [{ "type": "participants_join", "id": "x" }]
        });
        assert_eq!(
            classify(&payload),
            ActivityEvent::DirectMessageOther {
                raw: payload.clone()
            }
        );
    }

    #[test]
    fn typing_and_read_receipts_compare_against_for_user_id() {
        let typing = json!({
            "for_user_id": "100",
            "direct_message_indicate_typing_events": [{
                "created_timestamp": "1700000000000",
                "sender_id": "200",
                "target": { "recipient_id": "100" }
            }],
            "users": { "200": { "id": "200", "name": "Friend", "screen_name": "friend" } }
        });
        match classify(&typing) {
            ActivityEvent::TypingIndicator {
                sender,
                directed_at_self,
                ..
            } => {
                assert!(directed_at_self);
                assert_eq!(sender.handle, "friend");
            }
            other => panic!("expected typing, got {other:?}"),
        }

        let read = json!({
            "for_user_id": "100",
            "direct_message_mark_read_events": [{
                "created_timestamp": "1700000000000",
                "sender_id": "200",
                "target": { "recipient_id": "100" },
                "last_read_event_id": "dm-7"
            }]
        });
        match classify(&read) {
            ActivityEvent::ReadReceipt {
                reader,
                self_is_original_sender,
                last_read_event_id,
                ..
            } => {
                assert!(self_is_original_sender);
                assert_eq!(reader, UserRef::unknown("200"));
                assert_eq!(last_read_event_id, "dm-7");
            }
            other => panic!("expected read receipt, got {other:?}"),
        }
    }

    #[test]
    fn unknown_payloads_are_preserved() {
        for payload in [
            json!({ "for_user_id": "1", "block_events": [{ "type": "block" }] }),
            json!([1, 2, 3]),
            json!("plain"),
            Value::Null,
        ] {
            assert_eq!(
                classify(&payload),
                ActivityEvent::Unrecognized {
                    raw: payload.clone()
                }
            );
        }
    }

    #[test]
    fn classification_is_deterministic() {
        let payload = dm_payload("100", "200");
        assert_eq!(classify(&payload), classify(&payload));
    }
}
