//! Role and identifier extraction from handshake headers.
//!
//! A host announces itself with `x-identifier`. A viewer uses `x-client-id`,
//! or, from a browser that cannot set arbitrary headers, the first entry of
//! `Sec-WebSocket-Protocol`. The host check runs first, so a handshake that
//! carries both identifiers is a host.

use axum::http::HeaderMap;
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use std::fmt;

/// Header naming a host connection
pub const INSTANCE_ID_HEADER: &str = "x-identifier";
/// Header naming a viewer connection
pub const CLIENT_ID_HEADER: &str = "x-client-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Host,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Viewer => f.write_str("viewer"),
        }
    }
}

/// Outcome of classifying a handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub role: Role,
    pub id: String,
    /// The identifier was negotiated as a sub-protocol and must be echoed back.
    pub via_subprotocol: bool,
}

/// Returns `None` for a connection that can be neither a host nor a viewer.
pub fn classify(headers: &HeaderMap) -> Option<Peer> {
    if let Some(id) = header_value(headers, INSTANCE_ID_HEADER) {
        return Some(Peer {
            role: Role::Host,
            id: id.to_owned(),
            via_subprotocol: false,
        });
    }

    if let Some(id) = header_value(headers, CLIENT_ID_HEADER) {
        return Some(Peer {
            role: Role::Viewer,
            id: id.to_owned(),
            via_subprotocol: false,
        });
    }

    let protocol = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())?;

    Some(Peer {
        role: Role::Viewer,
        id: protocol.to_owned(),
        via_subprotocol: true,
    })
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
