//! Message and batch types.
//!
//! Messages are opaque byte payloads with a string metadata mapping. The
//! engine never inspects payloads; it moves batches by ownership through
//! transaction channels and deep-copies them only for fan-out.

use std::collections::HashMap;

/// A single message: an opaque payload plus mutable metadata.
///
/// The error flag is set by processors that fail on a message; later
/// processors and outputs may observe it, the engine itself never drops a
/// message because of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    payload: Vec<u8>,
    metadata: HashMap<String, String>,
    error: Option<String>,
}

impl Message {
    /// Create a message from a payload.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            metadata: HashMap::new(),
            error: None,
        }
    }

    /// The message payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Replace the payload.
    pub fn set_payload(&mut self, payload: impl Into<Vec<u8>>) {
        self.payload = payload.into();
    }

    /// The payload interpreted as UTF-8, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Get a metadata value.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|v| v.as_str())
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Iterate over all metadata pairs.
    pub fn metadata_iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.metadata.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Flag this message as having failed processing.
    pub fn set_error(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
    }

    /// The processing error attached to this message, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Clear the processing error flag.
    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Estimated size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.payload.len()
            + self
                .metadata
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// An ordered sequence of messages moved through the engine as a unit.
///
/// A length-0 batch is legal and represents a keep-alive or fully filtered
/// transaction whose acknowledgement still flows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    messages: Vec<Message>,
}

impl Batch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a batch from raw payloads, one message per payload.
    pub fn from_payloads<I, P>(payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        Self {
            messages: payloads.into_iter().map(Message::new).collect(),
        }
    }

    /// Append a message.
    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    /// Number of messages in the batch.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the batch holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Get a message by index.
    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    /// Iterate over messages in order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Iterate mutably over messages in order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Message> {
        self.messages.iter_mut()
    }

    /// Estimated size in bytes across all messages.
    pub fn size_bytes(&self) -> usize {
        self.messages.iter().map(Message::size_bytes).sum()
    }
}

impl IntoIterator for Batch {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl FromIterator<Message> for Batch {
    fn from_iter<I: IntoIterator<Item = Message>>(iter: I) -> Self {
        Self {
            messages: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_metadata() {
        let mut msg = Message::new(b"hello".to_vec());
        assert_eq!(msg.payload(), b"hello");
        assert_eq!(msg.metadata("topic"), None);

        msg.set_metadata("topic", "orders");
        assert_eq!(msg.metadata("topic"), Some("orders"));
        assert_eq!(msg.metadata_iter().count(), 1);
    }

    #[test]
    fn test_message_error_flag() {
        let mut msg = Message::new(b"x".to_vec());
        assert!(msg.error().is_none());

        msg.set_error("mapping failed");
        assert_eq!(msg.error(), Some("mapping failed"));

        msg.clear_error();
        assert!(msg.error().is_none());
    }

    #[test]
    fn test_batch_from_payloads() {
        let batch = Batch::from_payloads(["foo", "bar"]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.get(0).unwrap().payload(), b"foo");
        assert_eq!(batch.get(1).unwrap().payload(), b"bar");
    }

    #[test]
    fn test_empty_batch_is_legal() {
        let batch = Batch::new();
        assert!(batch.is_empty());
        assert_eq!(batch.len(), 0);
        assert_eq!(batch.size_bytes(), 0);
    }

    #[test]
    fn test_deep_copy_is_independent() {
        let original = Batch::from_payloads(["foo"]);
        let mut copy = original.clone();
        copy.iter_mut()
            .next()
            .unwrap()
            .set_payload(b"changed".to_vec());

        assert_eq!(original.get(0).unwrap().payload(), b"foo");
        assert_eq!(copy.get(0).unwrap().payload(), b"changed");
    }

    #[test]
    fn test_batch_size_bytes() {
        let mut batch = Batch::from_payloads(["abc"]);
        assert_eq!(batch.size_bytes(), 3);
        batch.iter_mut().next().unwrap().set_metadata("k", "vv");
        assert_eq!(batch.size_bytes(), 6);
    }
}
