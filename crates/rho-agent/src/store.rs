//! Conversation store
//!
//! Owns every Session, Message and Part. Mutations are read-modify-write
//! under one lock: the current record is cloned, the caller's closure edits
//! the clone, the result is persisted and committed, and the committed value
//! is returned and published on the bus once the lock is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::id::{self, prefix};
use crate::storage::{MemoryStorage, Storage};
use crate::types::{
    DEFAULT_TITLE, Message, NewSession, Part, Session, SessionSummary, SessionTime, ToolPart,
};

struct Entry<T> {
    seq: u64,
    value: T,
}

#[derive(Default)]
struct Records {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Entry<Message>>,
    parts: HashMap<String, Entry<Part>>,
    /// Message ids per session, in insertion order
    session_messages: HashMap<String, Vec<String>>,
    /// Part ids per message, in insertion order
    message_parts: HashMap<String, Vec<String>>,
}

/// A message together with its parts
#[derive(Debug, Clone)]
pub struct MessageWithParts {
    pub message: Message,
    pub parts: Vec<Part>,
}

#[derive(Clone)]
pub struct ConversationStore {
    records: Arc<RwLock<Records>>,
    storage: Arc<dyn Storage>,
    bus: Bus,
    seq: Arc<AtomicU64>,
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn session_key(session: &Session) -> [&str; 3] {
    ["session", &session.project_id, &session.id]
}

fn message_key(message: &Message) -> [&str; 3] {
    ["message", message.session_id(), message.id()]
}

fn part_key(part: &Part) -> [&str; 3] {
    ["part", part.message_id(), part.id()]
}

impl ConversationStore {
    /// An in-memory store
    pub fn new(bus: Bus) -> Self {
        Self {
            records: Arc::new(RwLock::new(Records::default())),
            storage: Arc::new(MemoryStorage::new()),
            bus,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A store backed by `storage`, loading every record it already holds
    pub fn open(storage: Arc<dyn Storage>, bus: Bus) -> Result<Self> {
        let store = Self {
            records: Arc::new(RwLock::new(Records::default())),
            storage,
            bus,
            seq: Arc::new(AtomicU64::new(0)),
        };
        store.load()?;
        Ok(store)
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn load_all<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for value in self.storage.list(&[prefix])? {
            match serde_json::from_value(value) {
                Ok(record) => out.push(record),
                Err(e) => warn!(prefix, error = %e, "skipping unreadable record"),
            }
        }
        Ok(out)
    }

    fn load(&self) -> Result<()> {
        let sessions: Vec<Session> = self.load_all("session")?;
        let mut messages: Vec<Message> = self.load_all("message")?;
        // Ids ascend with creation, so they break same-millisecond ties
        messages.sort_by(|a, b| (a.created(), a.id()).cmp(&(b.created(), b.id())));
        let mut parts: Vec<Part> = self.load_all("part")?;
        parts.sort_by(|a, b| a.id().cmp(b.id()));

        let mut records = self.records.write();
        for session in sessions {
            records.sessions.insert(session.id.clone(), session);
        }
        for message in messages {
            let seq = self.next_seq();
            records
                .session_messages
                .entry(message.session_id().to_string())
                .or_default()
                .push(message.id().to_string());
            records
                .messages
                .insert(message.id().to_string(), Entry { seq, value: message });
        }
        for part in parts {
            let seq = self.next_seq();
            records
                .message_parts
                .entry(part.message_id().to_string())
                .or_default()
                .push(part.id().to_string());
            records
                .parts
                .insert(part.id().to_string(), Entry { seq, value: part });
        }
        debug!(
            sessions = records.sessions.len(),
            messages = records.messages.len(),
            parts = records.parts.len(),
            "loaded conversation records"
        );
        Ok(())
    }

    // Sessions

    pub fn create_session(&self, input: NewSession) -> Result<Session> {
        let now = id::now();
        let session = Session {
            id: id::ascending(prefix::SESSION),
            title: input.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            project_id: input.project_id,
            directory: input.directory,
            agent: input.agent,
            summary: None,
            time: SessionTime {
                created: now,
                updated: now,
            },
        };
        {
            let mut records = self.records.write();
            self.storage.write(&session_key(&session), &to_value(&session)?)?;
            records.sessions.insert(session.id.clone(), session.clone());
        }
        self.bus.publish(Event::SessionCreated {
            session: session.clone(),
        });
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Session> {
        self.records
            .read()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("Session", id))
    }

    /// Sessions, most recently updated first
    pub fn list_sessions(&self, project_id: Option<&str>) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .records
            .read()
            .sessions
            .values()
            .filter(|s| project_id.is_none_or(|p| s.project_id == p))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.time.updated.cmp(&a.time.updated).then(b.id.cmp(&a.id)));
        sessions
    }

    pub fn update_session(&self, id: &str, f: impl FnOnce(&mut Session)) -> Result<Session> {
        let session = {
            let mut records = self.records.write();
            let current = records
                .sessions
                .get(id)
                .ok_or_else(|| Error::not_found("Session", id))?;
            let mut next = current.clone();
            f(&mut next);
            self.storage.write(&session_key(&next), &to_value(&next)?)?;
            records.sessions.insert(id.to_string(), next.clone());
            next
        };
        self.bus.publish(Event::SessionUpdated {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Bump `updated` to now
    pub fn touch(&self, id: &str) -> Result<Session> {
        self.update_session(id, |s| s.time.updated = id::now())
    }

    pub fn set_title(&self, id: &str, title: impl Into<String>) -> Result<Session> {
        let title = title.into();
        self.update_session(id, |s| s.title = title)
    }

    pub fn set_summary(&self, id: &str, summary: SessionSummary) -> Result<Session> {
        self.update_session(id, |s| s.summary = Some(summary))
    }

    /// Remove a session with all of its messages and parts
    pub fn remove_session(&self, id: &str) -> Result<()> {
        let session = self.get_session(id)?;
        for message_id in self.message_ids(id) {
            self.remove_message(&message_id)?;
        }
        {
            let mut records = self.records.write();
            self.storage.remove(&session_key(&session))?;
            records.sessions.remove(id);
            records.session_messages.remove(id);
        }
        self.bus.publish(Event::SessionDeleted { session });
        Ok(())
    }

    // Messages

    /// Store a new message. Its session must exist.
    pub fn create_message(&self, message: Message) -> Result<Message> {
        {
            let mut records = self.records.write();
            if !records.sessions.contains_key(message.session_id()) {
                return Err(Error::not_found("Session", message.session_id()));
            }
            self.storage.write(&message_key(&message), &to_value(&message)?)?;
            records
                .session_messages
                .entry(message.session_id().to_string())
                .or_default()
                .push(message.id().to_string());
            let seq = self.next_seq();
            records.messages.insert(
                message.id().to_string(),
                Entry {
                    seq,
                    value: message.clone(),
                },
            );
        }
        self.bus.publish(Event::MessageCreated {
            message: message.clone(),
        });
        Ok(message)
    }

    pub fn get_message(&self, id: &str) -> Result<Message> {
        self.records
            .read()
            .messages
            .get(id)
            .map(|e| e.value.clone())
            .ok_or_else(|| Error::not_found("Message", id))
    }

    pub fn update_message(&self, id: &str, f: impl FnOnce(&mut Message)) -> Result<Message> {
        let message = {
            let mut records = self.records.write();
            let entry = records
                .messages
                .get_mut(id)
                .ok_or_else(|| Error::not_found("Message", id))?;
            let mut next = entry.value.clone();
            f(&mut next);
            self.storage.write(&message_key(&next), &to_value(&next)?)?;
            entry.value = next.clone();
            next
        };
        self.bus.publish(Event::MessageUpdated {
            message: message.clone(),
        });
        Ok(message)
    }

    /// Remove a message and its parts
    pub fn remove_message(&self, id: &str) -> Result<()> {
        let session_id = {
            let mut records = self.records.write();
            let Some(entry) = records.messages.get(id) else {
                return Err(Error::not_found("Message", id));
            };
            let message = entry.value.clone();
            for part_id in records.message_parts.remove(id).unwrap_or_default() {
                if let Some(part) = records.parts.remove(&part_id) {
                    self.storage.remove(&part_key(&part.value))?;
                }
            }
            self.storage.remove(&message_key(&message))?;
            records.messages.remove(id);
            if let Some(ids) = records.session_messages.get_mut(message.session_id()) {
                ids.retain(|m| m != id);
            }
            message.session_id().to_string()
        };
        self.bus.publish(Event::MessageDeleted {
            session_id,
            message_id: id.to_string(),
        });
        Ok(())
    }

    fn message_ids(&self, session_id: &str) -> Vec<String> {
        self.records
            .read()
            .session_messages
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages of a session in conversation order
    pub fn list_messages(&self, session_id: &str) -> Vec<Message> {
        let records = self.records.read();
        let mut entries: Vec<&Entry<Message>> = records
            .session_messages
            .get(session_id)
            .into_iter()
            .flatten()
            .filter_map(|id| records.messages.get(id))
            .collect();
        entries.sort_by_key(|e| (e.value.created(), e.seq));
        entries.into_iter().map(|e| e.value.clone()).collect()
    }

    // Parts

    /// Store a new part. Its message must exist.
    pub fn create_part(&self, part: Part) -> Result<Part> {
        {
            let mut records = self.records.write();
            if !records.messages.contains_key(part.message_id()) {
                return Err(Error::not_found("Message", part.message_id()));
            }
            self.storage.write(&part_key(&part), &to_value(&part)?)?;
            records
                .message_parts
                .entry(part.message_id().to_string())
                .or_default()
                .push(part.id().to_string());
            let seq = self.next_seq();
            records.parts.insert(
                part.id().to_string(),
                Entry {
                    seq,
                    value: part.clone(),
                },
            );
        }
        self.bus.publish(Event::PartUpdated { part: part.clone() });
        Ok(part)
    }

    pub fn get_part(&self, id: &str) -> Result<Part> {
        self.records
            .read()
            .parts
            .get(id)
            .map(|e| e.value.clone())
            .ok_or_else(|| Error::not_found("Part", id))
    }

    pub fn update_part(&self, id: &str, f: impl FnOnce(&mut Part)) -> Result<Part> {
        let part = {
            let mut records = self.records.write();
            let entry = records
                .parts
                .get_mut(id)
                .ok_or_else(|| Error::not_found("Part", id))?;
            let mut next = entry.value.clone();
            f(&mut next);
            self.storage.write(&part_key(&next), &to_value(&next)?)?;
            entry.value = next.clone();
            next
        };
        self.bus.publish(Event::PartUpdated { part: part.clone() });
        Ok(part)
    }

    /// Parts of a message in creation order
    pub fn list_parts(&self, message_id: &str) -> Vec<Part> {
        let records = self.records.read();
        let mut entries: Vec<&Entry<Part>> = records
            .message_parts
            .get(message_id)
            .into_iter()
            .flatten()
            .filter_map(|id| records.parts.get(id))
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.value.clone()).collect()
    }

    pub fn find_tool_part(&self, message_id: &str, call_id: &str) -> Option<ToolPart> {
        self.list_parts(message_id).into_iter().find_map(|part| match part {
            Part::Tool(tool) if tool.call_id.as_deref() == Some(call_id) => Some(tool),
            _ => None,
        })
    }

    /// Every message of a session with its parts, in conversation order
    pub fn history(&self, session_id: &str) -> Vec<MessageWithParts> {
        self.list_messages(session_id)
            .into_iter()
            .map(|message| {
                let parts = self.list_parts(message.id());
                MessageWithParts { message, parts }
            })
            .collect()
    }

    /// Publish streaming text for a part without persisting it
    pub fn publish_delta(&self, part: &Part, delta: impl Into<String>) {
        self.bus.publish(Event::PartDelta {
            session_id: part.session_id().to_string(),
            message_id: part.message_id().to_string(),
            part_id: part.id().to_string(),
            delta: delta.into(),
        });
    }
}
