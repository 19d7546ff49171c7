//! Bus event catalogue

use serde::{Deserialize, Serialize};

use crate::permission::{PermissionReply, PermissionRequest};
use crate::snapshot::FileDiff;
use crate::status::SessionStatus;
use crate::types::{Message, Part, Session};

/// Everything the engine publishes for external observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "properties")]
pub enum Event {
    #[serde(rename = "session.created")]
    SessionCreated { session: Session },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: Session },
    #[serde(rename = "session.deleted")]
    SessionDeleted { session: Session },
    /// File changes made during a session
    #[serde(rename = "session.diff")]
    SessionDiff {
        session_id: String,
        diff: Vec<FileDiff>,
    },
    /// A turn failed. `session_id` is absent when the failure could not be
    /// attributed to a session.
    #[serde(rename = "session.error")]
    SessionError {
        session_id: Option<String>,
        error: String,
    },
    #[serde(rename = "session.status")]
    SessionStatus {
        session_id: String,
        status: SessionStatus,
    },
    #[serde(rename = "session.compacted")]
    SessionCompacted { session_id: String },
    #[serde(rename = "message.created")]
    MessageCreated { message: Message },
    #[serde(rename = "message.updated")]
    MessageUpdated { message: Message },
    #[serde(rename = "message.deleted")]
    MessageDeleted {
        session_id: String,
        message_id: String,
    },
    #[serde(rename = "part.updated")]
    PartUpdated { part: Part },
    /// Streaming text appended to a part. Never persisted.
    #[serde(rename = "part.delta")]
    PartDelta {
        session_id: String,
        message_id: String,
        part_id: String,
        delta: String,
    },
    #[serde(rename = "permission.asked")]
    PermissionAsked { request: PermissionRequest },
    #[serde(rename = "permission.replied")]
    PermissionReplied {
        session_id: String,
        request_id: String,
        reply: PermissionReply,
    },
}

/// The topic of an [`Event`], used for exact-type subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionCreated,
    SessionUpdated,
    SessionDeleted,
    SessionDiff,
    SessionError,
    SessionStatus,
    SessionCompacted,
    MessageCreated,
    MessageUpdated,
    MessageDeleted,
    PartUpdated,
    PartDelta,
    PermissionAsked,
    PermissionReplied,
}

impl EventKind {
    /// Dotted topic name, e.g. `part.updated`
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SessionCreated => "session.created",
            EventKind::SessionUpdated => "session.updated",
            EventKind::SessionDeleted => "session.deleted",
            EventKind::SessionDiff => "session.diff",
            EventKind::SessionError => "session.error",
            EventKind::SessionStatus => "session.status",
            EventKind::SessionCompacted => "session.compacted",
            EventKind::MessageCreated => "message.created",
            EventKind::MessageUpdated => "message.updated",
            EventKind::MessageDeleted => "message.deleted",
            EventKind::PartUpdated => "part.updated",
            EventKind::PartDelta => "part.delta",
            EventKind::PermissionAsked => "permission.asked",
            EventKind::PermissionReplied => "permission.replied",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::SessionCreated { .. } => EventKind::SessionCreated,
            Event::SessionUpdated { .. } => EventKind::SessionUpdated,
            Event::SessionDeleted { .. } => EventKind::SessionDeleted,
            Event::SessionDiff { .. } => EventKind::SessionDiff,
            Event::SessionError { .. } => EventKind::SessionError,
            Event::SessionStatus { .. } => EventKind::SessionStatus,
            Event::SessionCompacted { .. } => EventKind::SessionCompacted,
            Event::MessageCreated { .. } => EventKind::MessageCreated,
            Event::MessageUpdated { .. } => EventKind::MessageUpdated,
            Event::MessageDeleted { .. } => EventKind::MessageDeleted,
            Event::PartUpdated { .. } => EventKind::PartUpdated,
            Event::PartDelta { .. } => EventKind::PartDelta,
            Event::PermissionAsked { .. } => EventKind::PermissionAsked,
            Event::PermissionReplied { .. } => EventKind::PermissionReplied,
        }
    }

    /// Session the event concerns, if any
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Event::SessionCreated { session }
            | Event::SessionUpdated { session }
            | Event::SessionDeleted { session } => Some(&session.id),
            Event::SessionDiff { session_id, .. }
            | Event::SessionStatus { session_id, .. }
            | Event::SessionCompacted { session_id }
            | Event::MessageDeleted { session_id, .. }
            | Event::PartDelta { session_id, .. }
            | Event::PermissionReplied { session_id, .. } => Some(session_id),
            Event::SessionError { session_id, .. } => session_id.as_deref(),
            Event::MessageCreated { message } | Event::MessageUpdated { message } => {
                Some(message.session_id())
            }
            Event::PartUpdated { part } => Some(part.session_id()),
            Event::PermissionAsked { request } => Some(&request.session_id),
        }
    }
}
