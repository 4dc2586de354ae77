pub mod mqtt;
pub mod replay_file;

pub use mqtt::MqttSource;
pub use replay_file::ReplayFileSource;

/// One publish as received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl TransportMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}
