//! State store abstraction
//!
//! The adapter never owns the state tree; it describes objects, publishes
//! values and consumes external writes through [`StateStore`].

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use pb_error::Result;
use pb_protocol::{StateSnapshot, StateValue};

pub use memory::MemoryStore;

/// Current value of a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub val: StateValue,
    /// False while the value is a request that hardware has not confirmed
    pub ack: bool,
    /// Milliseconds since the Unix epoch
    pub ts: u64,
}

impl State {
    pub fn new(val: StateValue, ack: bool) -> Self {
        Self {
            val,
            ack,
            ts: now_ms(),
        }
    }

    pub fn snapshot(&self, path: &str) -> StateSnapshot {
        StateSnapshot {
            path: path.to_string(),
            val: Some(self.val.clone()),
            ack: self.ack,
            ts: self.ts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Channel,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Boolean,
    Number,
    Mixed,
}

/// Descriptive part of an object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectCommon {
    pub name: String,
    pub role: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub value_type: Option<ValueType>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub kind: ObjectKind,
    pub common: ObjectCommon,
}

impl ObjectDescriptor {
    pub fn channel(name: impl Into<String>, role: &str) -> Self {
        Self {
            kind: ObjectKind::Channel,
            common: ObjectCommon {
                name: name.into(),
                role: role.to_string(),
                value_type: None,
                read: false,
                write: false,
            },
        }
    }

    pub fn state(
        name: impl Into<String>,
        role: &str,
        value_type: ValueType,
        read: bool,
        write: bool,
    ) -> Self {
        Self {
            kind: ObjectKind::State,
            common: ObjectCommon {
                name: name.into(),
                role: role.to_string(),
                value_type: Some(value_type),
                read,
                write,
            },
        }
    }

    pub fn is_writable_state(&self) -> bool {
        self.kind == ObjectKind::State && self.common.write
    }
}

/// An external, unacknowledged write to a state
#[derive(Debug, Clone, PartialEq)]
pub struct StateCommand {
    pub path: String,
    pub value: StateValue,
}

/// Home-automation state store
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Unconditionally write a value.
    async fn set_state(&self, path: &str, value: StateValue, ack: bool) -> Result<()>;

    /// Write only when value or ack differ from what is stored.
    /// Returns whether a write happened.
    async fn set_state_if_changed(&self, path: &str, value: StateValue, ack: bool) -> Result<bool>;

    async fn get_state(&self, path: &str) -> Result<Option<State>>;

    /// Create the object or update its descriptor when it differs.
    async fn ensure_object(&self, path: &str, descriptor: ObjectDescriptor) -> Result<()>;

    /// Delete an object and its value; `recursive` also removes everything below it.
    /// Deleting a missing object is not an error.
    async fn delete_object(&self, path: &str, recursive: bool) -> Result<()>;

    /// Ids of all objects starting with `prefix`, sorted.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;

    /// Hand out the stream of external writes. Only the first caller gets it.
    fn take_commands(&self) -> Option<mpsc::UnboundedReceiver<StateCommand>>;
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
