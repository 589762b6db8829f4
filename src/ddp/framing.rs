//! # Transport Framing
//!
//! Two framings share the same message catalogue:
//!
//! - **SockJS-style**: the server opens with `o`, sends batches as
//!   `a["<msg>", ...]`, closes with `c[code,"reason"]` and may send `h` as a
//!   heartbeat. The client sends a bare JSON array of message strings.
//! - **Raw**: one extended JSON message per transport frame, both ways.
//!
//! The framing is picked per connection from the upgrade path.

use serde::de::DeserializeOwned;
use serde_json::json;

use super::errors::{DdpError, DdpResult};
use super::message::{decode_message, encode_message, ClientMessage, ServerMessage};

const OPEN_FRAME: &str = "o";
const HEARTBEAT_FRAME: &str = "h";

/// How messages are wrapped into transport frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encapsulation {
    /// `/sockjs/<shard>/<session>/websocket`
    SockJs,
    /// `/websocket`
    Raw,
}

/// A decoded frame as seen by the client
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Open,
    Heartbeat,
    Messages(Vec<ServerMessage>),
    Close { code: u16, reason: String },
}

impl Encapsulation {
    /// Choose the framing from a WebSocket upgrade path
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or(path);
        if path == "/websocket" {
            return Some(Encapsulation::Raw);
        }

        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        match segments.as_slice() {
            ["sockjs", shard, session, "websocket"] if !shard.is_empty() && !session.is_empty() => {
                Some(Encapsulation::SockJs)
            }
            _ => None,
        }
    }

    /// Frame sent by the server right after the upgrade, if any
    pub fn open_frame(&self) -> Option<String> {
        match self {
            Encapsulation::SockJs => Some(OPEN_FRAME.to_string()),
            Encapsulation::Raw => None,
        }
    }

    /// Close frame carrying a code and reason, if the framing has one
    pub fn close_frame(&self, code: u16, reason: &str) -> Option<String> {
        match self {
            Encapsulation::SockJs => Some(format!("c{}", json!([code, reason]))),
            Encapsulation::Raw => None,
        }
    }

    /// Encode a batch of server messages into transport frames
    pub fn encode_server(&self, messages: &[ServerMessage]) -> DdpResult<Vec<String>> {
        match self {
            Encapsulation::SockJs => {
                if messages.is_empty() {
                    return Ok(Vec::new());
                }
                let encoded = messages
                    .iter()
                    .map(encode_message)
                    .collect::<DdpResult<Vec<_>>>()?;
                Ok(vec![format!("a{}", serde_json::to_string(&encoded)?)])
            }
            Encapsulation::Raw => messages.iter().map(encode_message).collect(),
        }
    }

    /// Encode a batch of client messages into transport frames
    pub fn encode_client(&self, messages: &[ClientMessage]) -> DdpResult<Vec<String>> {
        match self {
            Encapsulation::SockJs => {
                if messages.is_empty() {
                    return Ok(Vec::new());
                }
                let encoded = messages
                    .iter()
                    .map(encode_message)
                    .collect::<DdpResult<Vec<_>>>()?;
                Ok(vec![serde_json::to_string(&encoded)?])
            }
            Encapsulation::Raw => messages.iter().map(encode_message).collect(),
        }
    }

    /// Split an inbound client frame into individual message payloads
    ///
    /// Payloads are returned undecoded so that one malformed message in a
    /// batch does not hide the others.
    pub fn client_payloads(&self, frame: &str) -> DdpResult<Vec<String>> {
        match self {
            Encapsulation::SockJs => serde_json::from_str::<Vec<String>>(frame).map_err(|e| {
                DdpError::InvalidFrame(format!("expected an array of message strings: {}", e))
            }),
            Encapsulation::Raw => Ok(vec![frame.to_string()]),
        }
    }

    /// Decode an inbound client frame
    pub fn decode_client(&self, frame: &str) -> DdpResult<Vec<ClientMessage>> {
        self.client_payloads(frame)?
            .iter()
            .map(|payload| parse_message(payload))
            .collect()
    }

    /// Decode an inbound server frame
    pub fn decode_server(&self, frame: &str) -> DdpResult<ServerFrame> {
        match self {
            Encapsulation::Raw => Ok(ServerFrame::Messages(vec![parse_message(frame)?])),
            Encapsulation::SockJs => {
                let head_len = frame.chars().next().map(char::len_utf8).unwrap_or(0);
                let (head, rest) = frame.split_at(head_len);
                match head {
                    OPEN_FRAME => Ok(ServerFrame::Open),
                    HEARTBEAT_FRAME => Ok(ServerFrame::Heartbeat),
                    "a" => {
                        let payloads: Vec<String> = serde_json::from_str(rest).map_err(|e| {
                            DdpError::InvalidFrame(format!("bad message batch: {}", e))
                        })?;
                        let messages = payloads
                            .iter()
                            .map(|payload| parse_message(payload))
                            .collect::<DdpResult<Vec<_>>>()?;
                        Ok(ServerFrame::Messages(messages))
                    }
                    "c" => {
                        let (code, reason): (u16, String) = serde_json::from_str(rest)
                            .map_err(|e| DdpError::InvalidFrame(format!("bad close frame: {}", e)))?;
                        Ok(ServerFrame::Close { code, reason })
                    }
                    _ => Err(DdpError::InvalidFrame(format!(
                        "unknown frame type: {:?}",
                        head
                    ))),
                }
            }
        }
    }
}

/// Parse one message payload
pub fn parse_message<T: DeserializeOwned>(payload: &str) -> DdpResult<T> {
    decode_message(payload)
}
