use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Largest device to cloud message IoT Hub accepts
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Reasons an outbound message cannot be built
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// Body was never set on the builder
    #[error("message body was not set")]
    MissingBody,
    /// Empty bodies are not sent
    #[error("message body is empty")]
    EmptyBody,
    /// Body exceeds [`MAX_MESSAGE_SIZE`]
    #[error("message body of {0} bytes exceeds the maximum message size")]
    TooLarge(usize),
}

/// Device to cloud event message
///
/// Ownership of a message moves into [`DeviceSession::send_event_async`](crate::DeviceSession::send_event_async)
/// and comes back either in the confirmation callback or, when submission fails, in the error.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct EventMessage {
    /// Contents of the message
    pub body: Vec<u8>,
    pub(crate) properties: HashMap<String, String>,
    pub(crate) system_properties: HashMap<String, String>,
}

impl EventMessage {
    /// Create a message whose body is the given text
    ///
    /// ```
    /// use iothub_device_method::EventMessage;
    ///
    /// let msg = EventMessage::from_text("Test Async Message").unwrap();
    /// assert_eq!(msg.body, b"Test Async Message");
    /// assert!(EventMessage::from_text("").is_err());
    /// ```
    pub fn from_text(text: &str) -> Result<Self, MessageError> {
        Self::builder().set_body(text.as_bytes().to_vec()).build()
    }

    /// Get a builder instance for building up a message
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Application properties attached to this message
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// System properties attached to this message, keyed by wire id
    pub fn system_properties(&self) -> &HashMap<String, String> {
        &self.system_properties
    }
}

/// Builder for constructing [`EventMessage`] instances
#[derive(Debug, Default)]
pub struct MessageBuilder {
    body: Option<Vec<u8>>,
    properties: HashMap<String, String>,
    system_properties: HashMap<String, String>,
}

impl MessageBuilder {
    /// Set the message body
    pub fn set_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Set the identifier for this message
    pub fn set_message_id(self, message_id: String) -> Self {
        self.set_system_property("$.mid", message_id)
    }

    /// Set the content-type for this message, such as `text/plain`.
    /// To allow routing query on the message body, this value should be set to `application/json`
    pub fn set_content_type(self, content_type: String) -> Self {
        self.set_system_property("$.ct", content_type)
    }

    /// Set the content-encoding for this message.
    /// If the content-type is set to `application/json`, allowed values are `UTF-8`, `UTF-16`, `UTF-32`.
    pub fn set_content_encoding(self, content_encoding: String) -> Self {
        self.set_system_property("$.ce", content_encoding)
    }

    fn set_system_property(mut self, wire_id: &str, value: String) -> Self {
        self.system_properties.insert(wire_id.to_owned(), value);
        self
    }

    /// Add an application property
    pub fn add_message_property(mut self, key: String, value: String) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Validate and build into a message instance
    pub fn build(self) -> Result<EventMessage, MessageError> {
        let body = self.body.ok_or(MessageError::MissingBody)?;
        if body.is_empty() {
            return Err(MessageError::EmptyBody);
        }
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(MessageError::TooLarge(body.len()));
        }

        Ok(EventMessage {
            body,
            properties: self.properties,
            system_properties: self.system_properties,
        })
    }
}

/// Correlates a method invocation with its response
///
/// Not `Clone`: responding consumes it, so an invocation can be answered at most once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct MethodId(String);

impl MethodId {
    /// Wrap a request id received from the hub
    pub fn new(request_id: impl Into<String>) -> Self {
        Self(request_id.into())
    }

    /// The request id as sent on the wire
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Details about a cloud to device method invocation
#[derive(Debug)]
pub struct MethodInvocation {
    /// Name of the invoked method
    pub method_name: String,
    /// Raw payload, not guaranteed to be text
    pub payload: Vec<u8>,
    /// Identifier to pass back when responding
    pub method_id: MethodId,
}

impl MethodInvocation {
    /// Make a new invocation
    pub fn new(method_name: impl Into<String>, payload: Vec<u8>, method_id: MethodId) -> Self {
        Self {
            method_name: method_name.into(),
            payload,
            method_id,
        }
    }
}

/// Response produced by a buffer returning method handler
///
/// The body is owned by the response; whoever receives it takes ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResponse {
    /// Status code sent back to the caller
    pub status: i32,
    /// Response body
    pub body: Vec<u8>,
}

impl MethodResponse {
    /// Make a new method response
    pub fn new(status: i32, body: Vec<u8>) -> Self {
        Self { status, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_content_type() {
        let msg = EventMessage::builder()
            .set_content_type("application/json".to_owned())
            .set_body(b"{}".to_vec())
            .build()
            .unwrap();

        assert_eq!(msg.system_properties["$.ct"], "application/json");
    }

    #[test]
    fn test_setting_content_encoding() {
        let msg = EventMessage::builder()
            .set_content_type("application/json".to_owned())
            .set_content_encoding("UTF-8".to_owned())
            .set_body(b"{}".to_vec())
            .build()
            .unwrap();

        assert_eq!(msg.system_properties["$.ce"], "UTF-8");
    }

    #[test]
    fn builder_without_body_fails() {
        let result = EventMessage::builder()
            .set_message_id("1".to_owned())
            .build();

        assert_eq!(result, Err(MessageError::MissingBody));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let result = EventMessage::builder()
            .set_body(vec![b'a'; MAX_MESSAGE_SIZE + 1])
            .build();

        assert_eq!(result, Err(MessageError::TooLarge(MAX_MESSAGE_SIZE + 1)));
    }

    #[test]
    fn text_message_keeps_properties_empty() {
        let msg = EventMessage::from_text("Test Async Message").unwrap();
        assert!(msg.properties().is_empty());
        assert!(msg.system_properties().is_empty());
    }
}
