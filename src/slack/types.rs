//! Typed records for the Slack Web API and RTM event stream.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub domain: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelfUser {
    pub id: String,
    pub name: String,
}

/// Returned by `rtm.connect`; fixed for the lifetime of one RTM session.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginInfo {
    pub team: Team,
    #[serde(rename = "self")]
    pub myself: SelfUser,
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Topic {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LatestRef {
    #[serde(default)]
    pub ts: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name_normalized: String,
    #[serde(default)]
    pub topic: Topic,
    #[serde(default)]
    pub purpose: Topic,
    #[serde(default)]
    pub num_members: u64,
    #[serde(default)]
    pub is_member: bool,
    #[serde(default)]
    pub is_channel: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub is_mpim: bool,
    #[serde(default)]
    pub latest: Option<LatestRef>,
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name_normalized
    }

    /// The topic, falling back to the purpose when no topic is set.
    pub fn real_topic(&self) -> &str {
        if self.topic.value.is_empty() {
            &self.purpose.value
        } else {
            &self.topic.value
        }
    }
}

/// A synthetic channel representing one message thread. Never exists on the
/// Slack side; lives only inside the IRC server.
#[derive(Debug, Clone)]
pub struct MessageThread {
    /// Parent channel id; members and sends go through it.
    pub channel_id: String,
    pub thread_ts: String,
    /// Derived `t-<channel>-<ts>` name, without the `#`.
    pub name: String,
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Im {
    pub id: String,
    /// The peer.
    pub user: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub real_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub status_text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct File {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub mimetype: String,
    #[serde(default)]
    pub url_private: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub user: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub channel: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub ts: String,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub files: Vec<File>,
    /// `me_message` subtype; rendered as an IRC ACTION.
    #[serde(skip)]
    pub is_action: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageBot {
    pub channel: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub ts: String,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl MessageBot {
    /// The raw text followed by each attachment's text or fallback, one per
    /// line, prefixed with `| `.
    pub fn rendered_text(&self) -> String {
        let mut out = self.text.clone();
        for a in &self.attachments {
            let line = a.text.as_deref().or(a.fallback.as_deref()).unwrap_or("");
            out.push_str("\n| ");
            out.push_str(line);
        }
        out
    }
}

/// A message body as carried inside edit/delete envelopes, which put the
/// channel on the envelope instead.
#[derive(Debug, Clone, Deserialize)]
pub struct NoChanMessage {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub ts: String,
    #[serde(default)]
    pub thread_ts: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MessageEdit {
    pub channel: String,
    pub previous: NoChanMessage,
    pub current: NoChanMessage,
}

impl MessageEdit {
    pub fn is_changed(&self) -> bool {
        self.previous.text != self.current.text
    }
}

#[derive(Debug, Clone)]
pub struct MessageDelete {
    pub channel: String,
    pub previous: NoChanMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicChange {
    pub channel: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupJoined {
    pub channel: Channel,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembershipChange {
    pub user: String,
    pub channel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserTyping {
    pub user: String,
    pub channel: String,
}

/// One decoded RTM event. `UserChange` and `Typing` are consumed inside the
/// Slack client; the rest flow to the IRC server.
#[derive(Debug, Clone)]
pub enum SlackEvent {
    Message(Message),
    Bot(MessageBot),
    Edit(MessageEdit),
    Delete(MessageDelete),
    TopicChange(TopicChange),
    GroupJoined(GroupJoined),
    Join(MembershipChange),
    Leave(MembershipChange),
    Typing(UserTyping),
    UserChange { user: String },
}

/// RTM event types carrying nothing the bridge cares about.
const USELESS_EVENTS: &[&str] = &[
    "hello",
    "goodbye",
    "accounts_changed",
    "user_interaction_changed",
    "clear_mention_notification",
    "update_global_thread_state",
    "update_thread_state",
    "thread_marked",
    "im_marked",
    "pref_change",
    "draft_create",
    "draft_delete",
    "channel_marked",
    "group_marked",
    "mpim_marked",
    "dnd_updated_user",
    "reaction_added",
    "file_deleted",
    "file_public",
    "file_created",
    "file_shared",
    "desktop_notification",
    "mobile_in_app_notification",
];

pub fn is_useless(event_type: &str) -> bool {
    USELESS_EVENTS.contains(&event_type)
}

/// Slack timestamps are strings on the wire; parse for ordering only.
/// Equality checks should compare the string form.
pub fn parse_ts(ts: &str) -> f64 {
    ts.parse().unwrap_or(0.0)
}

/// Decode one RTM frame into a typed event. Unknown shapes decode to `None`
/// and are dropped by the caller.
pub fn decode_event(value: &serde_json::Value) -> Option<SlackEvent> {
    let event_type = value.get("type")?.as_str()?;
    if is_useless(event_type) {
        return None;
    }

    match event_type {
        "message" => decode_message(value),
        "group_joined" => serde_json::from_value(value.clone())
            .ok()
            .map(SlackEvent::GroupJoined),
        "member_joined_channel" => serde_json::from_value(value.clone())
            .ok()
            .map(SlackEvent::Join),
        "member_left_channel" => serde_json::from_value(value.clone())
            .ok()
            .map(SlackEvent::Leave),
        "user_typing" => serde_json::from_value(value.clone())
            .ok()
            .map(SlackEvent::Typing),
        "user_change" => {
            let user = value.get("user")?.get("id")?.as_str()?;
            Some(SlackEvent::UserChange {
                user: user.to_string(),
            })
        }
        _ => None,
    }
}

fn decode_message(value: &serde_json::Value) -> Option<SlackEvent> {
    let subtype = value.get("subtype").and_then(|s| s.as_str());
    match subtype {
        None | Some("me_message") | Some("file_share") | Some("thread_broadcast") => {
            let mut msg: Message = serde_json::from_value(value.clone()).ok()?;
            msg.is_action = subtype == Some("me_message");
            Some(SlackEvent::Message(msg))
        }
        Some("bot_message") => serde_json::from_value(value.clone())
            .ok()
            .map(SlackEvent::Bot),
        Some("message_changed") => {
            let channel = value.get("channel")?.as_str()?.to_string();
            let current: NoChanMessage =
                serde_json::from_value(value.get("message")?.clone()).ok()?;
            let previous: NoChanMessage =
                serde_json::from_value(value.get("previous_message")?.clone()).ok()?;
            Some(SlackEvent::Edit(MessageEdit {
                channel,
                previous,
                current,
            }))
        }
        Some("message_deleted") => {
            let channel = value.get("channel")?.as_str()?.to_string();
            let previous: NoChanMessage =
                serde_json::from_value(value.get("previous_message")?.clone()).ok()?;
            Some(SlackEvent::Delete(MessageDelete { channel, previous }))
        }
        Some("channel_topic") => serde_json::from_value(value.clone())
            .ok()
            .map(SlackEvent::TopicChange),
        // Join/leave chatter is covered by membership events
        _ => None,
    }
}

/// Per-user autoreaction entry, persisted across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Autoreaction {
    pub reaction: String,
    pub probability: f64,
    /// Unix timestamp; entry is dead afterwards.
    pub expiration: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_plain_message() {
        let v = json!({
            "type": "message",
            "channel": "C1",
            "user": "U1",
            "text": "hi there",
            "ts": "1660000000.000100"
        });
        match decode_event(&v) {
            Some(SlackEvent::Message(m)) => {
                assert_eq!(m.channel, "C1");
                assert_eq!(m.text, "hi there");
                assert!(!m.is_action);
                assert!(m.thread_ts.is_none());
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_decode_me_message() {
        let v = json!({
            "type": "message",
            "subtype": "me_message",
            "channel": "C1",
            "user": "U1",
            "text": "waves",
            "ts": "1.2"
        });
        match decode_event(&v) {
            Some(SlackEvent::Message(m)) => assert!(m.is_action),
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_decode_edit() {
        let v = json!({
            "type": "message",
            "subtype": "message_changed",
            "channel": "C1",
            "message": {"user": "U1", "text": "hello there", "ts": "1.1"},
            "previous_message": {"user": "U1", "text": "hello world", "ts": "1.1"},
            "ts": "1.2"
        });
        match decode_event(&v) {
            Some(SlackEvent::Edit(e)) => {
                assert!(e.is_changed());
                assert_eq!(e.previous.text, "hello world");
                assert_eq!(e.current.text, "hello there");
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_decode_bot_message_rendering() {
        let v = json!({
            "type": "message",
            "subtype": "bot_message",
            "channel": "C1",
            "username": "deploybot",
            "text": "deploy finished",
            "ts": "1.3",
            "attachments": [
                {"text": "all green"},
                {"fallback": "12 checks passed"}
            ]
        });
        match decode_event(&v) {
            Some(SlackEvent::Bot(b)) => {
                assert_eq!(
                    b.rendered_text(),
                    "deploy finished\n| all green\n| 12 checks passed"
                );
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn test_useless_events_dropped() {
        for t in ["hello", "pref_change", "reaction_added", "file_created"] {
            let v = json!({"type": t});
            assert!(decode_event(&v).is_none(), "{t} should be dropped");
        }
    }

    #[test]
    fn test_join_leave_subtypes_not_rendered() {
        let v = json!({
            "type": "message",
            "subtype": "channel_join",
            "channel": "C1",
            "user": "U1",
            "text": "<@U1> has joined the channel",
            "ts": "1.4"
        });
        assert!(decode_event(&v).is_none());
    }

    #[test]
    fn test_real_topic_falls_back_to_purpose() {
        let c: Channel = serde_json::from_value(json!({
            "id": "C1",
            "name_normalized": "general",
            "topic": {"value": ""},
            "purpose": {"value": "the purpose"}
        }))
        .unwrap();
        assert_eq!(c.real_topic(), "the purpose");
    }
}
