use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac, NewMac};
use sha2::Sha256;
use thiserror::Error;

const DEVICEID_KEY: &str = "DeviceId";
const HOSTNAME_KEY: &str = "HostName";
const SHAREDACCESSKEY_KEY: &str = "SharedAccessKey";
const SHAREDACCESSSIGNATURE_KEY: &str = "SharedAccessSignature";

/// Errors turning a connection string or key into a token source
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// A required `Key=Value` pair is absent
    #[error("connection string is missing {0}")]
    MissingParameter(&'static str),
    /// A component of the connection string is not `Key=Value`
    #[error("malformed connection string component {0:?}")]
    MalformedComponent(String),
    /// The device key is not valid base64
    #[error("device key is not valid base64")]
    InvalidKey,
}

/// Provides the password presented when connecting
pub trait TokenSource {
    /// A token valid until `expiry`
    fn get(&self, expiry: &DateTime<Utc>) -> String;
}

/// Token source for a pre-generated shared access signature
#[derive(Debug, Clone)]
pub struct SasTokenSource {
    sas: String,
}

impl SasTokenSource {
    /// Wrap an existing signature
    pub fn new(sas: impl Into<String>) -> Self {
        SasTokenSource { sas: sas.into() }
    }
}

impl TokenSource for SasTokenSource {
    fn get(&self, _: &DateTime<Utc>) -> String {
        self.sas.clone()
    }
}

/// Token source generating signatures from the device's shared access key
#[derive(Debug, Clone)]
pub struct DeviceKeyTokenSource {
    resource_uri: String,
    key: Vec<u8>,
}

impl DeviceKeyTokenSource {
    /// Make a token source for `device_id` on `hub`
    pub fn new(hub: &str, device_id: &str, key: &str) -> Result<Self, TokenError> {
        let key = base64::decode(key).map_err(|_| TokenError::InvalidKey)?;
        Ok(DeviceKeyTokenSource {
            resource_uri: format!("{}/devices/{}", hub, device_id),
            key,
        })
    }
}

impl TokenSource for DeviceKeyTokenSource {
    fn get(&self, expiry: &DateTime<Utc>) -> String {
        let sas = generate_sas(&self.resource_uri, &self.key, expiry.timestamp());
        trace!("Using device key token: {}", sas);
        sas
    }
}

/// How the device authenticates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// `SharedAccessKey=` component
    SharedAccessKey(String),
    /// `SharedAccessSignature=` component
    SharedAccessSignature(String),
}

/// A parsed device connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    /// IoT Hub hostname
    pub hostname: String,
    /// Registered device id
    pub device_id: String,
    /// Key or signature
    pub credential: Credential,
}

impl ConnectionString {
    /// Parse `HostName=...;DeviceId=...;SharedAccessKey=...` (or `SharedAccessSignature=...`)
    ///
    /// Unknown components are ignored.
    pub fn parse(connection_string: &str) -> Result<Self, TokenError> {
        let mut hostname = None;
        let mut device_id = None;
        let mut credential = None;

        for part in connection_string.split(';').filter(|p| !p.trim().is_empty()) {
            // Keys and signatures are base64 and may themselves contain '='
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| TokenError::MalformedComponent(part.to_string()))?;
            match key.trim() {
                HOSTNAME_KEY => hostname = Some(value.to_string()),
                DEVICEID_KEY => device_id = Some(value.to_string()),
                SHAREDACCESSKEY_KEY => {
                    credential = Some(Credential::SharedAccessKey(value.to_string()))
                }
                SHAREDACCESSSIGNATURE_KEY => {
                    credential = Some(Credential::SharedAccessSignature(value.to_string()))
                }
                _ => (),
            }
        }

        Ok(ConnectionString {
            hostname: hostname.ok_or(TokenError::MissingParameter(HOSTNAME_KEY))?,
            device_id: device_id.ok_or(TokenError::MissingParameter(DEVICEID_KEY))?,
            credential: credential.ok_or(TokenError::MissingParameter(SHAREDACCESSKEY_KEY))?,
        })
    }

    /// Build the token source matching the credential kind
    pub fn token_source(&self) -> Result<Box<dyn TokenSource + Send>, TokenError> {
        Ok(match &self.credential {
            Credential::SharedAccessKey(key) => Box::new(DeviceKeyTokenSource::new(
                &self.hostname,
                &self.device_id,
                key,
            )?),
            Credential::SharedAccessSignature(sas) => Box::new(SasTokenSource::new(sas.clone())),
        })
    }
}

fn generate_sas(resource_uri: &str, key: &[u8], expiry_timestamp: i64) -> String {
    const FRAGMENT: &percent_encoding::AsciiSet = &percent_encoding::CONTROLS.add(b'/');

    let resource_uri = percent_encoding::utf8_percent_encode(resource_uri, FRAGMENT).to_string();
    let to_sign = format!("{}\n{}", resource_uri, expiry_timestamp);

    format!(
        "SharedAccessSignature sr={}&{}&se={}",
        resource_uri,
        generate_token(key, &to_sign),
        expiry_timestamp
    )
}

fn generate_token(key: &[u8], message: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match Hmac::<Sha256>::new_varkey(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac keys may have any length"),
    };
    mac.update(message.as_bytes());
    let signature = base64::encode(mac.finalize().into_bytes());

    // Only a base64 string: url encoding a single pair cannot fail
    serde_urlencoded::to_string(&[("sig", signature)]).unwrap_or_default()
}
