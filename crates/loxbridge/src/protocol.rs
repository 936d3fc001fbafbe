//! Messages exchanged between the controller and worker sessions.
//!
//! Every message serializes to a JSON object tagged by `action`, matching the
//! page/worker protocol of the browser build:
//!
//! ```json
//! {"action":"run","sourceCode":"print 1+1;"}
//! {"session":3,"action":"print","msg":"2","isErr":false}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifier of one worker session, unique per controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Controller to worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Request {
    Run {
        #[serde(rename = "sourceCode")]
        source_code: String,
    },
    /// Diagnostic probe; the worker only logs it.
    IsReady,
}

impl Request {
    #[must_use]
    pub fn run(source_code: impl Into<String>) -> Self {
        Self::Run {
            source_code: source_code.into(),
        }
    }

    /// # Errors
    /// Returns [`Error::Protocol`](crate::Error::Protocol) for malformed JSON
    /// or an unknown `action`.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One unit of runtime output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub text: String,
    pub is_error: bool,
}

impl OutputEvent {
    #[must_use]
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: false,
        }
    }

    #[must_use]
    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_error: true,
        }
    }
}

/// Worker to controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum WorkerMessage {
    /// The runtime finished initializing. Sent once per session.
    Ready,
    Print {
        msg: String,
        #[serde(rename = "isErr")]
        is_err: bool,
    },
    /// The current execution is over; always follows its output.
    Finished,
    /// The worker stopped on its own: startup failed, the runtime gave up,
    /// or it panicked. Never sent after a teardown. Last message of a session.
    Exited,
}

impl From<OutputEvent> for WorkerMessage {
    fn from(event: OutputEvent) -> Self {
        Self::Print {
            msg: event.text,
            is_err: event.is_error,
        }
    }
}

/// A [`WorkerMessage`] tagged with the session that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub session: SessionId,
    #[serde(flatten)]
    pub message: WorkerMessage,
}

impl Envelope {
    #[must_use]
    pub const fn new(session: SessionId, message: WorkerMessage) -> Self {
        Self { session, message }
    }

    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// # Errors
    /// Returns [`Error::Protocol`](crate::Error::Protocol) for malformed JSON.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
