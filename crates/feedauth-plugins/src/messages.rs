//! Wire messages exchanged with secure plugins.
//!
//! Every message travels inside a [`Message`] envelope serialized as a single
//! line of JSON. Field names use PascalCase to match what existing plugins
//! emit and expect.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{PluginError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Request,
    Response,
    Fault,
    Cancel,
    Progress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageMethod {
    Close,
    GetAuthenticationCredentials,
    GetOperationClaims,
    Handshake,
    Initialize,
    Log,
    MonitorNuGetProcessExit,
    SetCredentials,
    SetLogLevel,
}

impl fmt::Display for MessageMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageMethod::Close => "Close",
            MessageMethod::GetAuthenticationCredentials => "GetAuthenticationCredentials",
            MessageMethod::GetOperationClaims => "GetOperationClaims",
            MessageMethod::Handshake => "Handshake",
            MessageMethod::Initialize => "Initialize",
            MessageMethod::Log => "Log",
            MessageMethod::MonitorNuGetProcessExit => "MonitorNuGetProcessExit",
            MessageMethod::SetCredentials => "SetCredentials",
            MessageMethod::SetLogLevel => "SetLogLevel",
        };
        f.write_str(name)
    }
}

/// Envelope for every message on a plugin connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    pub request_id: String,
    #[serde(rename = "Type")]
    pub message_type: MessageType,
    pub method: MessageMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Message {
    pub fn request<P: Serialize>(
        request_id: impl Into<String>,
        method: MessageMethod,
        payload: &P,
    ) -> Result<Self> {
        Ok(Self {
            request_id: request_id.into(),
            message_type: MessageType::Request,
            method,
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// Build the reply to `self` carrying `payload`.
    pub fn response_to(&self, message_type: MessageType, payload: Value) -> Self {
        Self {
            request_id: self.request_id.clone(),
            message_type,
            method: self.method,
            payload: Some(payload),
        }
    }

    pub fn cancel(request_id: impl Into<String>, method: MessageMethod) -> Self {
        Self {
            request_id: request_id.into(),
            message_type: MessageType::Cancel,
            method,
            payload: None,
        }
    }

    /// Deserialize the payload, treating a missing payload as JSON `null`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self.payload.clone().unwrap_or(Value::Null);
        serde_json::from_value(payload).map_err(|e| {
            PluginError::Protocol(format!("invalid {} payload: {}", self.method, e))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageResponseCode {
    Success,
    Error,
    NotFound,
}

/// A capability a plugin advertises.
///
/// Unknown claims are preserved rather than rejected so that newer plugins
/// can still be used for the claims this host understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationClaim {
    DownloadPackage,
    Authentication,
    Other(String),
}

impl From<String> for OperationClaim {
    fn from(value: String) -> Self {
        match value.as_str() {
            "DownloadPackage" => OperationClaim::DownloadPackage,
            "Authentication" => OperationClaim::Authentication,
            _ => OperationClaim::Other(value),
        }
    }
}

impl From<OperationClaim> for String {
    fn from(claim: OperationClaim) -> Self {
        match claim {
            OperationClaim::DownloadPackage => "DownloadPackage".to_string(),
            OperationClaim::Authentication => "Authentication".to_string(),
            OperationClaim::Other(name) => name,
        }
    }
}

impl fmt::Display for OperationClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationClaim::DownloadPackage => f.write_str("DownloadPackage"),
            OperationClaim::Authentication => f.write_str("Authentication"),
            OperationClaim::Other(name) => f.write_str(name),
        }
    }
}

/// `major.minor.patch` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ProtocolVersion {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PluginError::Protocol(format!("invalid protocol version '{}'", s));
        let mut parts = s.trim().split('.');
        let mut next = |required: bool| -> Result<u32> {
            match parts.next() {
                Some(part) => part.parse().map_err(|_| invalid()),
                None if required => Err(invalid()),
                None => Ok(0),
            }
        };
        let major = next(true)?;
        let minor = next(true)?;
        let patch = next(false)?;
        Ok(Self::new(major, minor, patch))
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Durations on the wire use the `hh:mm:ss` time-span form.
mod timespan {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let total = value.as_secs();
        let formatted = format!(
            "{:02}:{:02}:{:02}",
            total / 3600,
            (total % 3600) / 60,
            total % 60
        );
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid time span '{}'", raw)))
    }

    pub(super) fn parse(raw: &str) -> Option<Duration> {
        let (days, clock) = match raw.split_once('.') {
            Some((days, rest)) if rest.contains(':') => (days.parse::<u64>().ok()?, rest),
            _ => (0, raw),
        };
        let mut fields = clock.split(':');
        let hours: u64 = fields.next()?.parse().ok()?;
        let minutes: u64 = fields.next()?.parse().ok()?;
        let seconds: f64 = fields.next()?.parse().ok()?;
        if fields.next().is_some() || !seconds.is_finite() || seconds < 0.0 {
            return None;
        }
        let whole = days * 86_400 + hours * 3600 + minutes * 60;
        Some(Duration::from_secs(whole) + Duration::from_secs_f64(seconds))
    }
}

// ─── Payloads ───

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeRequest {
    pub protocol_version: ProtocolVersion,
    pub minimum_protocol_version: ProtocolVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeResponse {
    pub response_code: MessageResponseCode,
    #[serde(default)]
    pub protocol_version: Option<ProtocolVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitializeRequest {
    pub client_version: String,
    pub culture: String,
    #[serde(with = "timespan")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MonitorNuGetProcessExitRequest {
    pub process_id: u32,
}

/// Claims query. Both fields are `null` for source-agnostic plugins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetOperationClaimsRequest {
    pub package_source_repository: Option<String>,
    pub service_index: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetOperationClaimsResponse {
    #[serde(default)]
    pub claims: Vec<OperationClaim>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Verbose,
    Information,
    Minimal,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetLogLevelRequest {
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SetCredentialsRequest {
    pub package_source_repository: String,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetAuthenticationCredentialsRequest {
    pub uri: String,
    pub is_retry: bool,
    pub is_non_interactive: bool,
    pub can_show_dialog: bool,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetAuthenticationCredentialsResponse {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub authentication_types: Option<Vec<String>>,
    pub response_code: MessageResponseCode,
}

impl GetAuthenticationCredentialsResponse {
    /// A usable response carries a username or a password.
    pub fn is_valid(&self) -> bool {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());
        present(&self.username) || present(&self.password)
    }
}

impl fmt::Debug for GetAuthenticationCredentialsResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetAuthenticationCredentialsResponse")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("message", &self.message)
            .field("authentication_types", &self.authentication_types)
            .field("response_code", &self.response_code)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogRequest {
    pub log_level: LogLevel,
    pub message: String,
}

/// Response carrying only a code: Initialize, SetLogLevel, SetCredentials,
/// MonitorNuGetProcessExit and Log all reply with this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseCodePayload {
    pub response_code: MessageResponseCode,
}

impl ResponseCodePayload {
    pub fn success() -> Self {
        Self {
            response_code: MessageResponseCode::Success,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Fault {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_uses_pascal_case() {
        let message = Message::request(
            "abc",
            MessageMethod::GetOperationClaims,
            &GetOperationClaimsRequest::default(),
        )
        .unwrap();
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "RequestId": "abc",
                "Type": "Request",
                "Method": "GetOperationClaims",
                "Payload": { "PackageSourceRepository": null, "ServiceIndex": null }
            })
        );
    }

    #[test]
    fn test_unknown_claims_are_preserved() {
        let response: GetOperationClaimsResponse =
            serde_json::from_value(json!({ "Claims": ["Authentication", "Telemetry"] })).unwrap();
        assert_eq!(
            response.claims,
            vec![
                OperationClaim::Authentication,
                OperationClaim::Other("Telemetry".to_string())
            ]
        );
    }

    #[test]
    fn test_protocol_version_parsing() {
        let version: ProtocolVersion = "2.0.0".parse().unwrap();
        assert_eq!(version, ProtocolVersion::new(2, 0, 0));
        assert_eq!("1.5".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::new(1, 5, 0));
        assert!("two".parse::<ProtocolVersion>().is_err());
        assert!(ProtocolVersion::new(1, 0, 0) < ProtocolVersion::new(2, 0, 0));
    }

    #[test]
    fn test_request_timeout_serialized_as_time_span() {
        let request = InitializeRequest {
            client_version: "6.0.0".to_string(),
            culture: "en-US".to_string(),
            request_timeout: Duration::from_secs(3725),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["RequestTimeout"], "01:02:05");

        assert_eq!(timespan::parse("1.00:00:30"), Some(Duration::from_secs(86_430)));
        assert_eq!(timespan::parse("bad"), None);
    }

    #[test]
    fn test_credentials_response_debug_hides_password() {
        let response = GetAuthenticationCredentialsResponse {
            username: Some("user".to_string()),
            password: Some("hunter2".to_string()),
            message: None,
            authentication_types: None,
            response_code: MessageResponseCode::Success,
        };
        let rendered = format!("{:?}", response);
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("hunter2"));
        assert!(response.is_valid());
    }
}
