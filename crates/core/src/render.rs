use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::types::{ActivityEvent, Direction};

const PROVIDER_DATE_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";
const DISPLAY_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Presentation model for one activity event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventCard {
    pub title: String,
    pub css_class: &'static str,
    pub lines: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub footer: Vec<String>,
    pub html: String,
}

impl EventCard {
    fn new(
        title: impl Into<String>,
        css_class: &'static str,
        lines: Vec<String>,
        details: Option<String>,
        footer: Vec<String>,
    ) -> Self {
        let mut card = Self {
            title: title.into(),
            css_class,
            lines,
            details,
            footer,
            html: String::new(),
        };
        card.html = card.to_html();
        card
    }

    /// Renders the card as an HTML fragment. Every interpolated value is escaped.
    pub fn to_html(&self) -> String {
        let mut html = format!(
            "<div class=\"event-card {}\"><h4>{}</h4>",
            self.css_class,
            escape_html(&self.title)
        );
        for line in &self.lines {
            html.push_str(&format!("<p>{}</p>", escape_html(line)));
        }
        if let Some(details) = &self.details {
            html.push_str(&format!("<pre>{}</pre>", escape_html(details)));
        }
        for line in &self.footer {
            html.push_str(&format!("<p><small>{}</small></p>", escape_html(line)));
        }
        html.push_str("</div>");
        html
    }
}

/// Builds the display card for `event`, stamped with the time it reached the server.
pub fn render(event: &ActivityEvent, received_at: DateTime<Utc>) -> EventCard {
    let received = format!("Received: {}", received_at.format(DISPLAY_FORMAT));

    match event {
        ActivityEvent::ConnectionAck { message } => EventCard::new(
            "System Message",
            "event-card-system",
            vec![message.clone()],
            None,
            vec![received],
        ),
        ActivityEvent::PostCreated {
            author,
            text,
            post_id,
            created_at,
        } => EventCard::new(
            "New Post",
            "event-card-tweet-create",
            vec![
                format!("From: {} (@{})", author.name, author.handle),
                format!("Post: {text}"),
            ],
            None,
            vec![
                format!("Post ID: {post_id} | User ID: {}", author.id),
                format!("Posted At: {} | {received}", format_timestamp(created_at)),
            ],
        ),
        ActivityEvent::PostDeleted {
            post_id,
            user_id,
            event_epoch_ms,
        } => EventCard::new(
            "Post Deleted",
            "event-card-tweet-delete",
            vec![format!("Post ID: {post_id}"), format!("User ID: {user_id}")],
            None,
            vec![
                format!(
                    "Event Timestamp (UTC ms): {event_epoch_ms} | Processed: {}",
                    format_timestamp(event_epoch_ms)
                ),
                received,
            ],
        ),
        ActivityEvent::Favorited {
            actor,
            favorited_post_id,
            favorited_post_author_handle,
            created_at,
        } => EventCard::new(
            "Post Favorited",
            "event-card-favorite",
            vec![
                format!("User: {} (@{}) favorited a post.", actor.name, actor.handle),
                format!("Favorited Post ID: {favorited_post_id}"),
                format!("Favorited Post User: @{favorited_post_author_handle}"),
            ],
            None,
            vec![format!(
                "Event At: {} | {received}",
                format_timestamp(created_at)
            )],
        ),
        ActivityEvent::FollowChanged {
            actor,
            target,
            is_follow,
            created_timestamp,
        } => {
            let (verb, title, class) = if *is_follow {
                ("followed", "User Followed", "event-card-follow")
            } else {
                ("unfollowed", "User Unfollowed", "event-card-unfollow")
            };
            EventCard::new(
                title,
                class,
                vec![format!(
                    "{} (@{}) {verb} {} (@{}).",
                    actor.name, actor.handle, target.name, target.handle
                )],
                None,
                vec![format!(
                    "Event Timestamp: {} | {received}",
                    format_timestamp(created_timestamp)
                )],
            )
        }
        ActivityEvent::MuteChanged {
            actor,
            target,
            is_mute,
            created_timestamp,
        } => {
            let (verb, title, class) = if *is_mute {
                ("muted", "User Muted", "event-card-mute")
            } else {
                ("unmuted", "User Unmuted", "event-card-unmute")
            };
            EventCard::new(
                title,
                class,
                vec![format!(
                    "{} (@{}) {verb} {} (@{}).",
                    actor.name, actor.handle, target.name, target.handle
                )],
                None,
                vec![format!(
                    "Event Timestamp: {} | {received}",
                    format_timestamp(created_timestamp)
                )],
            )
        }
        ActivityEvent::ReplayStatus {
            webhook_id,
            job_id,
            state,
            description,
        } => EventCard::new(
            "Replay Job Status",
            "event-card-replay-status",
            vec![
                format!("Webhook ID: {webhook_id}"),
                format!("Job ID: {job_id}"),
                format!("State: {state}"),
                format!("Description: {}", description.as_deref().unwrap_or("N/A")),
            ],
            None,
            vec![received],
        ),
        ActivityEvent::DirectMessageCreated {
            direction,
            counterpart,
            text,
            dm_id,
            created_timestamp,
        } => {
            let (title, class, prefix) = match direction {
                Direction::Sent => ("DM - Sent", "event-card-dm-sent", "To"),
                Direction::Received => ("DM - Received", "event-card-dm-received", "From"),
            };
            EventCard::new(
                title,
                class,
                vec![
                    format!("{prefix}: @{} ({})", counterpart.handle, counterpart.name),
                    format!("Message: {text}"),
                ],
                None,
                vec![
                    format!(
                        "DM ID: {dm_id} | Timestamp: {}",
                        format_timestamp(created_timestamp)
                    ),
                    received,
                ],
            )
        }
        ActivityEvent::DirectMessageOther { raw } => EventCard::new(
            "Direct Message Event",
            "event-card-system",
            Vec::new(),
            Some(pretty(raw)),
            vec![received],
        ),
        ActivityEvent::TypingIndicator {
            sender,
            recipient,
            directed_at_self,
            created_timestamp,
        } => {
            let line = if *directed_at_self {
                format!("@{} ({}) is typing...", sender.handle, sender.name)
            } else {
                format!("@{} is typing to @{}...", sender.handle, recipient.handle)
            };
            EventCard::new(
                "DM - Typing Indicator",
                "event-card-dm-typing",
                vec![line],
                None,
                vec![format!(
                    "Timestamp: {} | {received}",
                    format_timestamp(created_timestamp)
                )],
            )
        }
        ActivityEvent::ReadReceipt {
            reader,
            original_sender,
            last_read_event_id,
            self_is_original_sender,
            created_timestamp,
        } => {
            let line = if *self_is_original_sender {
                format!("@{} ({}) read your messages.", reader.handle, reader.name)
            } else {
                format!(
                    "@{} ({}) read messages from @{} ({}).",
                    reader.handle, reader.name, original_sender.handle, original_sender.name
                )
            };
            EventCard::new(
                "DM - Read Receipt",
                "event-card-dm-read-receipt",
                vec![line, format!("Last read event ID: {last_read_event_id}")],
                None,
                vec![format!(
                    "Timestamp: {} | {received}",
                    format_timestamp(created_timestamp)
                )],
            )
        }
        ActivityEvent::Unrecognized { raw } => EventCard::new(
            "Unrecognized Event",
            "event-card-system",
            Vec::new(),
            Some(pretty(raw)),
            vec![received],
        ),
    }
}

/// Formats provider timestamps for display, returning the input unchanged when
/// it matches none of the known representations.
pub fn format_timestamp(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        if let Some(at) = trimmed
            .parse::<i64>()
            .ok()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        {
            return at.format(DISPLAY_FORMAT).to_string();
        }
    }
    if let Ok(at) = DateTime::parse_from_str(trimmed, PROVIDER_DATE_FORMAT) {
        return at.with_timezone(&Utc).format(DISPLAY_FORMAT).to_string();
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
        return at.with_timezone(&Utc).format(DISPLAY_FORMAT).to_string();
    }
    raw.to_string()
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
