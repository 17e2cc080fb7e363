//! # Event Codec
//!
//! The small JSON vocabulary spoken by both halves of a pairing. Every frame on
//! the envelope channel is a JSON object whose `type` field selects the event:
//!
//! ```text
//! {"type":"shell/create","instanceId":"inst-1","clientId":"cli-1"}
//! {"type":"shell/data","instanceId":"inst-1","clientId":"cli-1","data":"ls\r"}
//! ```
//!
//! Decoding happens once at the connection boundary. Callers that get a
//! [`DecodeError`] drop the frame and keep the connection open.

pub mod utf8;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Discriminant of the shell creation event
pub const SHELL_CREATE: &str = "shell/create";
/// Discriminant of the shell data event
pub const SHELL_DATA: &str = "shell/data";

/// A routed event exchanged between a host and a viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Viewer asks the host `instance_id` to open a shell.
    ///
    /// `client_id` names the viewer the shell belongs to. The relay ignores it
    /// and routes on `instance_id` alone.
    #[serde(rename = "shell/create", rename_all = "camelCase")]
    ShellCreate {
        instance_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// A chunk of shell input (viewer to host) or output (host to viewer).
    ///
    /// Both identifiers are always present, whichever side sent the event.
    #[serde(rename = "shell/data", rename_all = "camelCase")]
    ShellData {
        instance_id: String,
        client_id: String,
        data: String,
    },
}

/// Reasons a frame could not be turned into an [`Event`]
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("event has no string `type` field")]
    MissingType,

    #[error("not a recognized event: {0}")]
    Unrecognized(String),
}

impl Event {
    pub fn shell_create(instance_id: impl Into<String>, client_id: Option<String>) -> Self {
        Event::ShellCreate {
            instance_id: instance_id.into(),
            client_id,
        }
    }

    pub fn shell_data(
        instance_id: impl Into<String>,
        client_id: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Event::ShellData {
            instance_id: instance_id.into(),
            client_id: client_id.into(),
            data: data.into(),
        }
    }

    /// Decodes one envelope frame.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(raw)?;
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(DecodeError::MissingType)?;

        if kind != SHELL_CREATE && kind != SHELL_DATA {
            return Err(DecodeError::Unrecognized(kind.to_owned()));
        }

        Ok(serde_json::from_value(value)?)
    }

    pub fn encode(&self) -> String {
        // Only strings and a tag: serialization cannot fail.
        serde_json::to_string(self).expect("event serialization is infallible")
    }

    /// Wire discriminant of this event
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ShellCreate { .. } => SHELL_CREATE,
            Event::ShellData { .. } => SHELL_DATA,
        }
    }

    /// Identifier of the host this event concerns
    pub fn instance_id(&self) -> &str {
        match self {
            Event::ShellCreate { instance_id, .. } | Event::ShellData { instance_id, .. } => {
                instance_id.as_str()
            }
        }
    }

    /// Identifier of the viewer this event concerns, when it carries one
    pub fn client_id(&self) -> Option<&str> {
        match self {
            Event::ShellCreate { client_id, .. } => client_id.as_deref(),
            Event::ShellData { client_id, .. } => Some(client_id.as_str()),
        }
    }
}
