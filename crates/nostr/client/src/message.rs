//! Wire frames exchanged with relays.

use crate::error::{ClientError, Result};
use nostr::{Event, Filter, verify_event};
use serde_json::{Value, json};
use tracing::debug;

/// Frame sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(Event),
    Req(String, Vec<Filter>),
    Close(String),
}

impl ClientMessage {
    /// Encode as compact JSON text.
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            ClientMessage::Event(event) => json!(["EVENT", event]),
            ClientMessage::Req(subscription_id, filters) => {
                let mut frame = Vec::with_capacity(filters.len() + 2);
                frame.push(json!("REQ"));
                frame.push(json!(subscription_id));
                for filter in filters {
                    frame.push(serde_json::to_value(filter)?);
                }
                Value::Array(frame)
            }
            ClientMessage::Close(subscription_id) => json!(["CLOSE", subscription_id]),
        };
        Ok(serde_json::to_string(&value)?)
    }
}

/// Relay message received from a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Event(String, Event),
    Ok(String, bool, String),
    Eose(String),
    Notice(String),
}

/// Parse relay protocol JSON text message into typed relay message.
///
/// EVENT payloads are verified before they are returned. Frame kinds this
/// client does not handle yield `Ok(None)`.
pub fn parse_relay_message(text: &str) -> Result<Option<RelayMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let array = value
        .as_array()
        .ok_or_else(|| ClientError::Protocol("expected JSON array relay message".to_string()))?;
    if array.is_empty() {
        return Ok(None);
    }

    let kind = array[0]
        .as_str()
        .ok_or_else(|| ClientError::Protocol("missing relay message kind".to_string()))?;

    match kind {
        "EVENT" => {
            if array.len() != 3 {
                return Err(ClientError::Protocol("invalid EVENT message".to_string()));
            }
            let subscription_id = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid EVENT subscription id".to_string()))?
                .to_string();
            let event = verify_event(&array[2]).map_err(|failure| {
                ClientError::Protocol(format!("invalid EVENT payload: {}", failure))
            })?;
            Ok(Some(RelayMessage::Event(subscription_id, event)))
        }
        "OK" => {
            if array.len() != 4 {
                return Err(ClientError::Protocol("invalid OK message".to_string()));
            }
            let event_id = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid OK event id".to_string()))?
                .to_string();
            let accepted = array[2]
                .as_bool()
                .ok_or_else(|| ClientError::Protocol("invalid OK accepted flag".to_string()))?;
            let message = array[3]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid OK message text".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Ok(event_id, accepted, message)))
        }
        "EOSE" => {
            if array.len() != 2 {
                return Err(ClientError::Protocol("invalid EOSE message".to_string()));
            }
            let subscription_id = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid EOSE subscription id".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Eose(subscription_id)))
        }
        "NOTICE" => {
            if array.len() != 2 {
                return Err(ClientError::Protocol("invalid NOTICE message".to_string()));
            }
            let message = array[1]
                .as_str()
                .ok_or_else(|| ClientError::Protocol("invalid NOTICE message text".to_string()))?
                .to_string();
            Ok(Some(RelayMessage::Notice(message)))
        }
        other => {
            debug!("unsupported relay message kind: {}", other);
            Ok(None)
        }
    }
}
