//! Per-session run status

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bus::Bus;
use crate::events::Event;

/// What a session's prompt loop is doing right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
    /// Waiting out a backoff before retrying the model call
    Retry {
        attempt: u32,
        message: String,
        /// When the next attempt starts, ms since epoch
        next: i64,
    },
    Error {
        message: String,
    },
}

/// Tracks and publishes [`SessionStatus`] per session
#[derive(Clone)]
pub struct StatusTracker {
    state: Arc<Mutex<HashMap<String, SessionStatus>>>,
    bus: Bus,
}

impl StatusTracker {
    pub fn new(bus: Bus) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            bus,
        }
    }

    /// Current status; sessions never seen are idle
    pub fn get(&self, session_id: &str) -> SessionStatus {
        self.state
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or(SessionStatus::Idle)
    }

    /// Stop tracking a session without publishing anything
    pub fn forget(&self, session_id: &str) {
        self.state.lock().remove(session_id);
    }

    pub fn set(&self, session_id: &str, status: SessionStatus) {
        {
            let mut state = self.state.lock();
            if status == SessionStatus::Idle {
                state.remove(session_id);
            } else {
                state.insert(session_id.to_string(), status.clone());
            }
        }
        self.bus.publish(Event::SessionStatus {
            session_id: session_id.to_string(),
            status,
        });
    }
}
