//! Device method handlers used by the sample
//!
//! [`AsyncResponseHandler`] sends a telemetry event and then answers through the session.
//! [`BufferResponseHandler`] returns its response for the session to send. Both stop the
//! sample's run loop after servicing one call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::message::{EventMessage, MethodInvocation, MethodResponse};
use crate::session::{
    BufferReturnHandler, ConfirmationResult, DeviceSession, ExplicitResponseHandler, HandlerError,
};

/// Body of the event sent while servicing a method call
pub const EVENT_TEXT: &str = "Test Async Message";
/// Response when the event was submitted
pub const SUCCESS_RESPONSE: &str = r#"{"Response": "This is an actual async response from the device"}"#;
/// Response when the event message could not be built
pub const CREATE_FAILED_RESPONSE: &str = r#"{"Response": "Failed IoTHubMessage_CreateFromString"}"#;
/// Response when the event could not be submitted
pub const SEND_FAILED_RESPONSE: &str = r#"{"Response": "Failed IoTHubClient_SendEventAsync"}"#;
/// Response of the buffer returning handler
pub const BUFFER_RESPONSE: &str = r#"{ "Response": "This is the response from the device" }"#;

/// Status for a serviced call
pub const STATUS_SUCCESS: i32 = 200;
/// Status when the event could not be sent
pub const STATUS_FAILURE: i32 = 304;

/// Longest prefix of a method payload written to the log
pub const MAX_LOGGED_PAYLOAD: usize = 1024;

/// Shared shutdown signal: true while the sample should keep running
///
/// Written by the method handler (on the worker thread in threaded mode), read by the run loop.
/// Once stopped it never runs again.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    /// A flag in the running state
    pub fn new() -> Self {
        RunFlag(Arc::new(AtomicBool::new(true)))
    }

    /// Whether the run loop should continue
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Stop the run loop. Returns true only for the call that made the transition.
    pub fn stop(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

fn log_invocation(invocation: &MethodInvocation) {
    let shown = &invocation.payload[..invocation.payload.len().min(MAX_LOGGED_PAYLOAD)];
    info!("Device Method called");
    info!("Device Method name:    {}", invocation.method_name);
    info!("Device Method payload: {}", String::from_utf8_lossy(shown));
}

/// Confirmation sink for the events sent by [`AsyncResponseHandler`]
///
/// Takes ownership of the confirmed message and releases it.
pub fn confirmation_sink(result: ConfirmationResult, message: EventMessage) {
    info!("Confirmation received for message: {}", result);
    drop(message);
}

/// Answers a method call by first sending an event, then responding through the session
#[derive(Debug)]
pub struct AsyncResponseHandler {
    run: RunFlag,
    event_text: String,
}

impl AsyncResponseHandler {
    /// Handler sending [`EVENT_TEXT`] and stopping `run` after each call
    pub fn new(run: RunFlag) -> Self {
        Self::with_event_text(run, EVENT_TEXT)
    }

    /// Handler sending `event_text` instead of the default event
    pub fn with_event_text(run: RunFlag, event_text: impl Into<String>) -> Self {
        Self {
            run,
            event_text: event_text.into(),
        }
    }

    fn send_event(&self, session: &mut dyn DeviceSession) -> (i32, &'static str) {
        let message = match EventMessage::from_text(&self.event_text) {
            Ok(message) => message,
            Err(err) => {
                error!("Failed to create event message: {}", err);
                return (STATUS_FAILURE, CREATE_FAILED_RESPONSE);
            }
        };

        match session.send_event_async(message, Box::new(confirmation_sink)) {
            Ok(()) => (STATUS_SUCCESS, SUCCESS_RESPONSE),
            Err(err) => {
                error!("{}", err);
                // Never submitted, so no confirmation will release it
                drop(err.message);
                (STATUS_FAILURE, SEND_FAILED_RESPONSE)
            }
        }
    }
}

impl ExplicitResponseHandler for AsyncResponseHandler {
    fn on_method(&mut self, session: &mut dyn DeviceSession, invocation: MethodInvocation) -> i32 {
        log_invocation(&invocation);

        let (status, response) = self.send_event(session);
        info!("Response status: {}", status);
        info!("Response payload: {}", response);

        if let Err(err) = session.respond_to_method(invocation.method_id, response.as_bytes(), status)
        {
            error!("Failed to respond to method {}: {}", invocation.method_name, err);
        }

        self.run.stop();
        0
    }
}

/// Returns a fixed response for the session to send
#[derive(Debug)]
pub struct BufferResponseHandler {
    run: RunFlag,
}

impl BufferResponseHandler {
    /// Handler stopping `run` after each call
    pub fn new(run: RunFlag) -> Self {
        Self { run }
    }
}

impl BufferReturnHandler for BufferResponseHandler {
    fn on_method(&mut self, invocation: &MethodInvocation) -> Result<MethodResponse, HandlerError> {
        log_invocation(invocation);
        self.run.stop();

        let mut body = Vec::new();
        body.try_reserve_exact(BUFFER_RESPONSE.len())
            .map_err(|_| HandlerError::Allocation(BUFFER_RESPONSE.len()))?;
        body.extend_from_slice(BUFFER_RESPONSE.as_bytes());

        info!("Response status: {}", STATUS_SUCCESS);
        info!("Response payload: {}", BUFFER_RESPONSE);
        Ok(MethodResponse::new(STATUS_SUCCESS, body))
    }
}
