//! WebSocket frame codec.
//!
//! Frames travel as JSON text. Control frames (`subscribe`/`unsubscribe`)
//! must name the target event as a non-empty string.

use crate::messages::{ClientFrame, Envelope, ServerFrame};
use statesync_core::hub::{SUBSCRIBE_EVENT, UNSUBSCRIBE_EVENT};
use thiserror::Error;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// Received binary frame instead of text.
    #[error("Expected text frame, received binary")]
    BinaryFrame,

    /// Frame has an empty event name.
    #[error("Frame has no event name")]
    MissingEvent,

    /// Control frame without a target event name.
    #[error("{0} frame must carry an event name")]
    InvalidControl(String),
}

/// Encode a server frame for WebSocket transmission.
pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(CodecError::from)
}

/// Encode a client frame. Used by clients and tests.
pub fn encode_client_frame(frame: ClientFrame) -> Result<String, CodecError> {
    serde_json::to_string(&frame.into_envelope()).map_err(CodecError::from)
}

/// Decode a frame received from a client.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, CodecError> {
    let Envelope { event, data } = serde_json::from_str(text)?;

    if event.is_empty() {
        return Err(CodecError::MissingEvent);
    }

    if event == SUBSCRIBE_EVENT {
        control_target(event, &data).map(ClientFrame::Subscribe)
    } else if event == UNSUBSCRIBE_EVENT {
        control_target(event, &data).map(ClientFrame::Unsubscribe)
    } else {
        Ok(ClientFrame::Event { event, data })
    }
}

fn control_target(kind: String, data: &serde_json::Value) -> Result<String, CodecError> {
    match data.as_str() {
        Some(name) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(CodecError::InvalidControl(kind)),
    }
}

/// Decode a frame sent by the server. Used by clients and tests.
pub fn decode_server_frame(text: &str) -> Result<ServerFrame, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}
