//! Frame types for the push channel.
//!
//! Every frame is a JSON object with an `event` name and a `data` payload:
//! - Client → Server: `subscribe` / `unsubscribe` (data = event name), or an
//!   application event carrying a state object
//! - Server → Client: an application event carrying a state object

use serde::{Deserialize, Serialize};
use serde_json::Value;
use statesync_core::hub::{SUBSCRIBE_EVENT, UNSUBSCRIBE_EVENT};

/// Wire envelope shared by both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Frame received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Subscribe(String),
    Unsubscribe(String),
    Event { event: String, data: Value },
}

impl ClientFrame {
    pub fn subscribe(event: impl Into<String>) -> Self {
        ClientFrame::Subscribe(event.into())
    }

    pub fn unsubscribe(event: impl Into<String>) -> Self {
        ClientFrame::Unsubscribe(event.into())
    }

    pub fn event(event: impl Into<String>, data: Value) -> Self {
        ClientFrame::Event {
            event: event.into(),
            data,
        }
    }

    pub fn into_envelope(self) -> Envelope {
        match self {
            ClientFrame::Subscribe(name) => Envelope {
                event: SUBSCRIBE_EVENT.to_string(),
                data: Value::String(name),
            },
            ClientFrame::Unsubscribe(name) => Envelope {
                event: UNSUBSCRIBE_EVENT.to_string(),
                data: Value::String(name),
            },
            ClientFrame::Event { event, data } => Envelope { event, data },
        }
    }
}

/// Frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub event: String,
    pub data: Value,
}

impl ServerFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}
