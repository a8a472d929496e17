//! Coordination message codec.
//!
//! Messages travel as flat JSON records (`message_id`, `sender_id`,
//! `timestamp`, `type`, type-specific fields) inside a single-channel string
//! sample on the coordination stream.

use strata_common::{CoordinationMessage, MessageBody, Result, SampleData, StrataError};

/// Serialize a message to its wire record
pub fn encode(message: &CoordinationMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Parse a wire record
pub fn decode(payload: &str) -> Result<CoordinationMessage> {
    let message: CoordinationMessage = serde_json::from_str(payload)?;
    if message.sender_id.is_empty() {
        return Err(StrataError::Codec("message without sender_id".into()));
    }
    Ok(message)
}

/// Wrap a message into a coordination stream sample
pub fn to_sample(message: &CoordinationMessage) -> Result<SampleData> {
    Ok(SampleData::text(encode(message)?))
}

/// Extract a message from a coordination stream sample
pub fn from_sample(data: &SampleData) -> Result<CoordinationMessage> {
    let payload = data
        .first_text()
        .ok_or_else(|| StrataError::Codec(format!("expected a string sample, got {:?}", data.format())))?;
    decode(payload)
}

/// Stamps outgoing messages with the sender id and a per-sender unique id
#[derive(Debug)]
pub struct MessageBuilder {
    sender_id: String,
    sequence: u64,
}

impl MessageBuilder {
    pub fn new(sender_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            sequence: 0,
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn build(&mut self, timestamp: f64, body: MessageBody) -> CoordinationMessage {
        self.sequence += 1;
        CoordinationMessage::new(
            format!("{}-{}", self.sender_id, self.sequence),
            self.sender_id.clone(),
            timestamp,
            body,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{HeartbeatStatus, Metadata, NetworkNode, NodeRole};

    fn capabilities() -> Metadata {
        Metadata::from([("sensor".to_string(), "eeg".to_string())])
    }

    fn all_variants() -> Vec<MessageBody> {
        let nodes = vec![
            NetworkNode::new("node-a", "A", NodeRole::Coordinator).with_last_seen(3.25),
            NetworkNode::new("node-b", "B", NodeRole::Participant).with_metadata(capabilities()),
        ];
        vec![
            MessageBody::Discovery {
                node_name: "A".into(),
                role: NodeRole::Coordinator,
                capabilities: capabilities(),
            },
            MessageBody::JoinRequest {
                node_name: "B".into(),
                capabilities: Metadata::new(),
            },
            MessageBody::JoinResponse {
                target_id: "node-b".into(),
                accepted: true,
                current_nodes: nodes.clone(),
            },
            MessageBody::Heartbeat {
                status: HeartbeatStatus {
                    role: NodeRole::Participant,
                    known_nodes: 2,
                },
            },
            MessageBody::TopologyUpdate { nodes },
            MessageBody::Application {
                application_type: "protocol_config".into(),
                payload: serde_json::json!({"protocol_id": "gaming", "layers": [1, 2]}),
            },
        ]
    }

    #[test]
    fn test_round_trip_preserves_every_variant() {
        let mut builder = MessageBuilder::new("node-a");
        for (i, body) in all_variants().into_iter().enumerate() {
            let message = builder.build(100.0 + i as f64 * 0.125, body);
            let sample = to_sample(&message).unwrap();
            let decoded = from_sample(&sample).unwrap();
            assert_eq!(decoded, message, "variant {}", message.message_type());
        }
    }

    #[test]
    fn test_round_trip_keeps_timestamps_exact() {
        use rand::Rng;
        let mut rng = rand::rng();
        let mut builder = MessageBuilder::new("node-a");
        let mut timestamps = vec![57414.518664216484, 0.1 + 0.2, 1e-7, 86399.99999999999];
        timestamps.extend((0..2000).map(|_| rng.random_range(0.0..1e5)));

        for timestamp in timestamps {
            let nodes = vec![NetworkNode::new("node-b", "B", NodeRole::Participant).with_last_seen(timestamp / 3.0)];
            let message = builder.build(timestamp, MessageBody::TopologyUpdate { nodes });
            let decoded = decode(&encode(&message).unwrap()).unwrap();
            assert_eq!(decoded.timestamp.to_bits(), timestamp.to_bits(), "{timestamp}");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_message_ids_unique_per_sender() {
        let mut builder = MessageBuilder::new("node-a");
        let a = builder.build(0.0, MessageBody::Unknown);
        let b = builder.build(0.0, MessageBody::Unknown);
        assert_ne!(a.message_id, b.message_id);
        assert_eq!(a.sender_id, "node-a");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"message_id":"1","sender_id":"","timestamp":0.0,"type":"unknown"}"#).is_err());
        assert!(from_sample(&SampleData::Float32(vec![1.0])).is_err());
    }
}
