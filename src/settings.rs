use std::path::PathBuf;

use serde::Deserialize;

use crate::session::TransportProtocol;

/// Prefix of environment variables overriding settings, e.g. `DEVICE_METHOD_CONNECTION_STRING`
pub const ENV_PREFIX: &str = "DEVICE_METHOD";
/// Settings file looked up next to the working directory (any format `config` understands)
pub const DEFAULT_FILE: &str = "device-method";

/// How the session's I/O is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// The run loop pumps the session itself
    Polled,
    /// A worker thread pumps the session
    Threaded,
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Polled
    }
}

/// Which method handler is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Sends an event, then responds through the session
    Explicit,
    /// Returns a response buffer for the session to send
    Buffer,
}

impl Default for HandlerKind {
    fn default() -> Self {
        HandlerKind::Explicit
    }
}

fn default_log_trace() -> bool {
    true
}

/// Settings of the device method sample
#[derive(Debug, Clone, Deserialize)]
pub struct SampleSettings {
    /// `HostName=...;DeviceId=...;SharedAccessKey=...`
    pub connection_string: String,
    /// Polled or threaded
    #[serde(default)]
    pub mode: RunMode,
    /// Transport to the hub
    #[serde(default)]
    pub protocol: TransportProtocol,
    /// Registered method handler
    #[serde(default)]
    pub handler: HandlerKind,
    /// Turn on protocol tracing in the session
    #[serde(default = "default_log_trace")]
    pub log_trace: bool,
    /// PEM bundle of certificates to trust
    #[serde(default)]
    pub trusted_certs: Option<PathBuf>,
    /// Wait for Enter before destroying the session
    #[serde(default)]
    pub wait_for_key: bool,
}

impl SampleSettings {
    /// Load from [`DEFAULT_FILE`] if present, overridden by `DEVICE_METHOD_*` variables
    pub fn load() -> crate::Result<Self> {
        Self::load_from(DEFAULT_FILE)
    }

    /// Load from the settings file named `file`, extension optional
    pub fn load_from(file: &str) -> crate::Result<Self> {
        let mut cfg = config::Config::default();
        cfg.merge(config::File::with_name(file).required(false))?;
        cfg.merge(config::Environment::with_prefix(ENV_PREFIX))?;
        Ok(cfg.try_into()?)
    }
}
