//! Azure IoT Hub device method sample client
//!
//! A device registers a method handler on a session; when the cloud invokes a method the
//! handler sends a telemetry event, answers the invocation and stops the run loop.
//!
//! Two run modes are supported:
//!
//! - **Polled**: the application pumps [`PolledSession::do_work`] itself. Handlers and
//!   confirmations run inside the pump, on the caller's thread.
//! - **Threaded**: [`ThreadedSession`] pumps a polled session on a worker thread.
//!
//! Two handler contracts are available through [`MethodCallback`]: handlers that answer with
//! [`DeviceSession::respond_to_method`], and handlers that return a [`MethodResponse`] for the
//! session to send.
//!
//! ## Feature flags
//!
//! - `mqtt-session` (default): [`MqttSession`], the session bound to IoT Hub over MQTT.
//!
//! # Examples
//!
//! ```no_run
//! use iothub_device_method::{
//!     create_session, dispatcher::RunFlag, sample::{run_polled, StartupOptions},
//!     TransportProtocol,
//! };
//!
//! fn main() -> iothub_device_method::Result<()> {
//!     let mut session = create_session(
//!         "HostName=iothubname.azure-devices.net;DeviceId=MyDeviceId;SharedAccessKey=TheAccessKey",
//!         TransportProtocol::Mqtt,
//!     )?;
//!     let run = RunFlag::new();
//!     run_polled(&mut session, &StartupOptions::default(), &run)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, missing_docs)]

#[macro_use]
extern crate log;

/// Package version
pub const SDK_VERSION: &str = std::env!("CARGO_PKG_VERSION");

pub mod dispatcher;
/// Errors
pub mod errors;
/// Message types exchanged with the hub
pub mod message;
/// Session bound to IoT Hub over MQTT
#[cfg(feature = "mqtt-session")]
pub mod mqtt_session;
pub mod sample;
/// Session traits and method handler contracts
pub mod session;
/// Sample settings
pub mod settings;
/// Threaded mode
pub mod threaded;
/// Connection strings and shared access tokens
pub mod token;

pub use errors::{Error, Result};
pub use message::{EventMessage, MessageBuilder, MethodId, MethodInvocation, MethodResponse};
#[cfg(feature = "mqtt-session")]
pub use mqtt_session::MqttSession;
#[cfg(feature = "mqtt-session")]
pub use session::{create_session, create_threaded_session};
pub use session::{
    BufferReturnHandler, ConfirmationCallback, ConfirmationResult, DeviceSession,
    ExplicitResponseHandler, HandlerError, MethodCallback, PolledSession, SendEventError, Session,
    SessionOption, TransportProtocol,
};
pub use threaded::ThreadedSession;
pub use token::{ConnectionString, DeviceKeyTokenSource, SasTokenSource, TokenSource};
