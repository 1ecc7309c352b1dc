use super::transport::QoS;
use chrono::NaiveDateTime;
use std::borrow::Cow;

/// A message as it was handed to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub timestamp: NaiveDateTime,
}

impl PublishedMessage {
    pub fn from_topic(topic: impl Into<String>, payload: Vec<u8>, qos: QoS) -> Self {
        PublishedMessage {
            topic: topic.into(),
            payload,
            qos,
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn render(&self) -> String {
        format!(
            "{}: {} (QoS {})\n{}",
            self.timestamp,
            self.topic,
            self.qos.as_u8(),
            self.payload_str()
        )
    }
}
