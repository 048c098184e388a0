use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::message::{EventMessage, MethodId, MethodInvocation, MethodResponse};

/// Extra pumps after the run loop ends, so in-flight sends complete before destroy
pub const DOWORK_LOOP_NUM: usize = 3;

/// Pause between pumps of a polled session
pub const WORK_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of a device to cloud send, reported to the confirmation callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationResult {
    /// The hub acknowledged the message
    Ok,
    /// The session was destroyed while the message was outstanding
    BecauseDestroy,
    /// The message could not be delivered
    Error,
}

impl fmt::Display for ConfirmationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfirmationResult::Ok => "ok",
            ConfirmationResult::BecauseDestroy => "because destroy",
            ConfirmationResult::Error => "error",
        };
        f.write_str(name)
    }
}

/// Called once when the delivery outcome of a submitted message is known.
/// Receives the message back so releasing it happens here.
pub type ConfirmationCallback = Box<dyn FnOnce(ConfirmationResult, EventMessage) + Send>;

/// Submission of an event was refused. The message is handed back to the caller.
#[derive(Debug, Error)]
#[error("failed to submit event: {reason}")]
pub struct SendEventError {
    /// The message that was not submitted
    pub message: EventMessage,
    /// Why submission failed
    pub reason: String,
}

/// Operations available to method handlers while an invocation is being serviced
pub trait DeviceSession {
    /// Queue `message` for sending; `on_confirm` runs once its outcome is known
    fn send_event_async(
        &mut self,
        message: EventMessage,
        on_confirm: ConfirmationCallback,
    ) -> Result<(), SendEventError>;

    /// Send the response for an invocation. Consumes the id: one response per invocation.
    fn respond_to_method(&mut self, method_id: MethodId, body: &[u8], status: i32)
        -> crate::Result<()>;
}

/// Options accepted by [`Session::set_option`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOption {
    /// Log every protocol exchange
    LogTrace(bool),
    /// PEM encoded certificates to trust, for platforms without a system store
    TrustedCerts(String),
}

impl SessionOption {
    /// Option name as known to the hub client SDKs
    pub fn name(&self) -> &'static str {
        match self {
            SessionOption::LogTrace(_) => "logtrace",
            SessionOption::TrustedCerts(_) => "TrustedCerts",
        }
    }
}

/// Transport used to reach the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// MQTT 3.1.1 over TLS
    Mqtt,
    /// AMQP 1.0, recognised but without a binding
    Amqp,
}

impl Default for TransportProtocol {
    fn default() -> Self {
        TransportProtocol::Mqtt
    }
}

/// Method handler answering through [`DeviceSession::respond_to_method`]
pub trait ExplicitResponseHandler: Send {
    /// Service an invocation. Must respond exactly once via `session`.
    ///
    /// The return value is an internal result, not the status sent to the caller.
    fn on_method(&mut self, session: &mut dyn DeviceSession, invocation: MethodInvocation) -> i32;
}

/// Errors from a [`BufferReturnHandler`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// The response body could not be allocated
    #[error("failed to allocate {0} byte response")]
    Allocation(usize),
}

/// Status sent to the caller when a buffer returning handler fails
pub const HANDLER_FAILURE_STATUS: i32 = -1;

/// Method handler returning an owned response which the session sends
pub trait BufferReturnHandler: Send {
    /// Service an invocation, returning the status and body to send back
    fn on_method(&mut self, invocation: &MethodInvocation) -> Result<MethodResponse, HandlerError>;
}

/// The method handler registered on a session. Exactly one is active at a time.
pub enum MethodCallback {
    /// Handler responds itself, possibly after other work on the session
    ExplicitResponse(Box<dyn ExplicitResponseHandler>),
    /// Handler returns the response for the session to send
    BufferReturn(Box<dyn BufferReturnHandler>),
}

impl fmt::Debug for MethodCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodCallback::ExplicitResponse(_) => f.write_str("MethodCallback::ExplicitResponse"),
            MethodCallback::BufferReturn(_) => f.write_str("MethodCallback::BufferReturn"),
        }
    }
}

impl MethodCallback {
    /// Hand `invocation` to the handler, sending the response for buffer returning handlers
    pub fn dispatch(&mut self, session: &mut dyn DeviceSession, invocation: MethodInvocation) {
        trace!("Dispatching method {} ({})", invocation.method_name, invocation.method_id);
        match self {
            MethodCallback::ExplicitResponse(handler) => {
                let result = handler.on_method(session, invocation);
                trace!("Method handler returned {}", result);
            }
            MethodCallback::BufferReturn(handler) => {
                let (status, body) = match handler.on_method(&invocation) {
                    Ok(response) => (response.status, response.body),
                    Err(err) => {
                        error!("Method {} failed: {}", invocation.method_name, err);
                        (HANDLER_FAILURE_STATUS, Vec::new())
                    }
                };
                if let Err(err) = session.respond_to_method(invocation.method_id, &body, status) {
                    error!("Failed to respond to method {}: {}", invocation.method_name, err);
                }
            }
        }
    }
}

/// Session lifecycle operations used by the owner of the session
pub trait Session: DeviceSession {
    /// Apply an option
    fn set_option(&mut self, option: SessionOption) -> crate::Result<()>;

    /// Install the method handler, replacing any previous one
    fn register_method_handler(&mut self, callback: MethodCallback) -> crate::Result<()>;
}

/// A session whose I/O only progresses when the application pumps it
pub trait PolledSession: Session {
    /// Drive pending I/O; handlers and confirmations are invoked from in here
    fn do_work(&mut self);
}

/// Create a polled session from a device connection string
///
/// No network I/O happens until the session is first pumped.
#[cfg(feature = "mqtt-session")]
pub fn create_session(
    connection_string: &str,
    protocol: TransportProtocol,
) -> crate::Result<crate::mqtt_session::MqttSession> {
    match protocol {
        TransportProtocol::Mqtt => {
            crate::mqtt_session::MqttSession::from_connection_string(connection_string)
        }
        TransportProtocol::Amqp => Err(crate::Error::UnsupportedTransport("amqp")),
    }
}

/// Create a session pumped by a background worker thread
#[cfg(feature = "mqtt-session")]
pub fn create_threaded_session(
    connection_string: &str,
    protocol: TransportProtocol,
) -> crate::Result<crate::threaded::ThreadedSession<crate::mqtt_session::MqttSession>> {
    create_session(connection_string, protocol).map(crate::threaded::ThreadedSession::new)
}
