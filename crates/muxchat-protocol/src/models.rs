//! Application payload models carried after the frame header.

use std::convert::TryFrom;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of an outbound `Reply`.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ReplyKind {
    /// Chat message.
    Message = 1,
    /// Notification.
    Notify = 2,
    /// Tip shown after an action, e.g. "bob is offline".
    Tip = 3,
    /// Debug text shown in a dedicated message box.
    Debug = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid reply type: {0}")]
pub struct InvalidReplyKind(pub u8);

impl TryFrom<u8> for ReplyKind {
    type Error = InvalidReplyKind;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(ReplyKind::Message),
            2 => Ok(ReplyKind::Notify),
            3 => Ok(ReplyKind::Tip),
            4 => Ok(ReplyKind::Debug),
            other => Err(InvalidReplyKind(other)),
        }
    }
}

impl From<ReplyKind> for u8 {
    fn from(kind: ReplyKind) -> u8 {
        kind as u8
    }
}

/// Uniform envelope for everything the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub reply_type: ReplyKind,
    /// What this kind of reply is used for.
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub tip: String,
    #[serde(default)]
    pub debug: String,
    #[serde(default)]
    pub notice: String,
    #[serde(default)]
    pub reply_value: serde_json::Value,
}

impl Reply {
    fn empty(reply_type: ReplyKind, desc: &str) -> Self {
        Reply {
            reply_type,
            desc: desc.to_string(),
            tip: String::new(),
            debug: String::new(),
            notice: String::new(),
            reply_value: serde_json::Value::Null,
        }
    }

    pub fn message(value: serde_json::Value) -> Self {
        Reply {
            reply_value: value,
            ..Reply::empty(ReplyKind::Message, "chat message")
        }
    }

    pub fn notify(notice: impl Into<String>) -> Self {
        Reply {
            notice: notice.into(),
            ..Reply::empty(ReplyKind::Notify, "notification")
        }
    }

    pub fn tip(tip: impl Into<String>) -> Self {
        Reply {
            tip: tip.into(),
            ..Reply::empty(ReplyKind::Tip, "tip")
        }
    }

    pub fn debug(debug: impl Into<String>) -> Self {
        Reply {
            debug: debug.into(),
            ..Reply::empty(ReplyKind::Debug, "debug")
        }
    }
}

/// Payload of a direct send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendOne {
    pub from: String,
    pub to: String,
    pub send_at: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub extra: Vec<u8>,
}

/// Payload of a send to several users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMany {
    pub from: String,
    pub to: Vec<String>,
    pub send_at: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub extra: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_kind_is_an_integer_on_the_wire() {
        let reply = Reply::tip("bob is offline");
        let v = serde_json::to_value(&reply).unwrap();
        assert_eq!(v["reply_type"], json!(3));
        assert_eq!(v["tip"], json!("bob is offline"));
        assert_eq!(v["reply_value"], json!(null));
    }

    #[test]
    fn invalid_reply_kind_is_an_error() {
        let err = ReplyKind::try_from(0).unwrap_err();
        assert_eq!(err, InvalidReplyKind(0));
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert_eq!(boxed.to_string(), "invalid reply type: 0");
    }

    #[test]
    fn unknown_reply_kind_is_rejected() {
        let err = serde_json::from_value::<Reply>(json!({ "reply_type": 9 })).unwrap_err();
        assert!(err.to_string().contains("invalid reply type: 9"));
    }

    #[test]
    fn missing_text_fields_default_to_empty() {
        let reply: Reply = serde_json::from_value(json!({ "reply_type": 2, "notice": "up" })).unwrap();
        assert_eq!(reply.reply_type, ReplyKind::Notify);
        assert_eq!(reply.notice, "up");
        assert!(reply.tip.is_empty());
    }

    #[test]
    fn send_one_field_names() {
        let v = json!({
            "from": "alice",
            "to": "bob",
            "send_at": "2024-05-01T10:00:00Z",
            "message": "hi"
        });
        let msg: SendOne = serde_json::from_value(v).unwrap();
        assert_eq!(msg.to, "bob");
        assert!(msg.extra.is_empty());
    }
}
