//! Wire codec negotiated per connection. Protobuf is the
//! production format; JSON is a developer-tooling fallback selected by WS
//! subprotocol.

use prost::Message;
use signaling_proto::ws::WebSocketMessage;
use thiserror::Error;

pub const PROTOBUF_SUBPROTOCOL: &str = "signalling.v1.pb";
pub const JSON_SUBPROTOCOL: &str = "signalling.v1.json";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to decode protobuf frame: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("failed to decode json frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Chosen once per connection from the negotiated WS subprotocol and used
/// by the reader/writer tasks for every frame on that connection.
pub trait WsCodec: Send + Sync {
    fn encode(&self, message: &WebSocketMessage) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<WebSocketMessage, CodecError>;
}

#[derive(Default)]
pub struct ProtobufCodec;

impl WsCodec for ProtobufCodec {
    fn encode(&self, message: &WebSocketMessage) -> Vec<u8> {
        message.encode_to_vec()
    }

    fn decode(&self, bytes: &[u8]) -> Result<WebSocketMessage, CodecError> {
        Ok(WebSocketMessage::decode(bytes)?)
    }
}

#[derive(Default)]
pub struct JsonCodec;

#[derive(serde::Serialize, serde::Deserialize)]
struct JsonEnvelope {
    event_type: String,
    #[serde(with = "base64_payload")]
    payload: Vec<u8>,
    correlation_id: Option<String>,
}

impl WsCodec for JsonCodec {
    fn encode(&self, message: &WebSocketMessage) -> Vec<u8> {
        let envelope = JsonEnvelope {
            event_type: message.event_type.clone(),
            payload: message.payload.clone(),
            correlation_id: message.correlation_id.clone(),
        };
        serde_json::to_vec(&envelope).unwrap_or_default()
    }

    fn decode(&self, bytes: &[u8]) -> Result<WebSocketMessage, CodecError> {
        let envelope: JsonEnvelope = serde_json::from_slice(bytes)?;
        Ok(WebSocketMessage {
            event_type: envelope.event_type,
            payload: envelope.payload,
            correlation_id: envelope.correlation_id,
        })
    }
}

mod base64_payload {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .encode(bytes)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        use base64::Engine;
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

pub fn codec_for_subprotocol(subprotocol: Option<&str>) -> Box<dyn WsCodec> {
    match subprotocol {
        Some(JSON_SUBPROTOCOL) => Box::new(JsonCodec),
        _ => Box::new(ProtobufCodec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protobuf_round_trips_a_message() {
        let codec = ProtobufCodec;
        let message = WebSocketMessage {
            event_type: "ping".to_owned(),
            payload: vec![1, 2, 3],
            correlation_id: Some("abc".to_owned()),
        };
        let bytes = codec.encode(&message);
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn json_round_trips_a_message() {
        let codec = JsonCodec;
        let message = WebSocketMessage {
            event_type: "ping".to_owned(),
            payload: vec![9, 9, 9],
            correlation_id: None,
        };
        let bytes = codec.encode(&message);
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn default_subprotocol_selects_protobuf() {
        let codec = codec_for_subprotocol(None);
        let message = WebSocketMessage { event_type: "x".into(), payload: vec![], correlation_id: None };
        assert_eq!(codec.encode(&message), ProtobufCodec.encode(&message));
    }
}
