use crate::{StatusMap, DEFAULT_LOG_LIMIT};
use chrono::Utc;
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;
/// Upper bound a client may ask for in a single `get_logs`.
pub const MAX_LOG_REQUEST: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ProtocolVersionVisitor;

        impl<'de> Visitor<'de> for ProtocolVersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let version = u16::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))?;
                Ok(ProtocolVersion(version))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "protocol version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                let version = cleaned.parse::<u16>().map_err(|err| {
                    E::custom(format!("invalid protocol version '{value}': {err}"))
                })?;
                Ok(ProtocolVersion(version))
            }
        }

        deserializer.deserialize_any(ProtocolVersionVisitor)
    }
}

/// One websocket text frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    #[serde(default)]
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    pub fn new(msg: WireMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            timestamp: Utc::now().to_rfc3339(),
            request_id: None,
            msg,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    // client -> hub
    GetStatus,
    StartService(CategoryPayload),
    StopService(CategoryPayload),
    GetLogs(GetLogsPayload),
    // hub -> client
    Status(StatusPayload),
    Logs(LogsPayload),
    LogMessage(LogMessagePayload),
    ServiceStarted(AckPayload),
    ServiceStopped(AckPayload),
    Connected(ConnectedPayload),
    Error(ErrorPayload),
}

impl WireMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMsg::GetStatus => "get_status",
            WireMsg::StartService(_) => "start_service",
            WireMsg::StopService(_) => "stop_service",
            WireMsg::GetLogs(_) => "get_logs",
            WireMsg::Status(_) => "status",
            WireMsg::Logs(_) => "logs",
            WireMsg::LogMessage(_) => "log_message",
            WireMsg::ServiceStarted(_) => "service_started",
            WireMsg::ServiceStopped(_) => "service_stopped",
            WireMsg::Connected(_) => "connected",
            WireMsg::Error(_) => "error",
        }
    }

    pub fn start(category: impl Into<String>) -> Self {
        WireMsg::StartService(CategoryPayload {
            category: category.into(),
        })
    }

    pub fn stop(category: impl Into<String>) -> Self {
        WireMsg::StopService(CategoryPayload {
            category: category.into(),
        })
    }

    pub fn get_logs(category: impl Into<String>, limit: usize) -> Self {
        WireMsg::GetLogs(GetLogsPayload {
            category: category.into(),
            limit,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryPayload {
    #[serde(default)]
    pub category: String,
}

impl CategoryPayload {
    pub fn validate(&self) -> Result<&str, &'static str> {
        let category = self.category.trim();
        if category.is_empty() {
            return Err("missing_category");
        }
        Ok(category)
    }
}

fn default_log_limit() -> usize {
    DEFAULT_LOG_LIMIT
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetLogsPayload {
    #[serde(default)]
    pub category: String,
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

impl GetLogsPayload {
    /// Category and a limit clamped to `1..=MAX_LOG_REQUEST`.
    pub fn validate(&self) -> Result<(&str, usize), &'static str> {
        let category = self.category.trim();
        if category.is_empty() {
            return Err("missing_category");
        }
        Ok((category, self.limit.clamp(1, MAX_LOG_REQUEST)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct StatusPayload {
    pub services: StatusMap,
}

impl StatusPayload {
    /// Applies the `running == false => no pid` rule to every entry.
    pub fn normalized(self) -> StatusMap {
        self.services
            .into_iter()
            .map(|(category, status)| (category, status.normalized()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogsPayload {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl LogsPayload {
    pub fn validate(self) -> Result<(String, Vec<String>), &'static str> {
        if self.category.trim().is_empty() {
            return Err("missing_category");
        }
        Ok((self.category, self.logs))
    }
}

/// Fields are optional on the wire so a bad push is rejected by `validate`
/// instead of failing the whole frame decode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LogMessagePayload {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl LogMessagePayload {
    pub fn new(category: &str, service: &str, message: String) -> Self {
        Self {
            category: Some(category.to_string()),
            service: Some(service.to_string()),
            message: Some(message),
        }
    }

    pub fn validate(self) -> Result<(String, String), &'static str> {
        let category = match self.category {
            Some(value) if !value.trim().is_empty() => value,
            _ => return Err("missing_category"),
        };
        let message = self.message.ok_or("missing_message")?;
        Ok((category, message))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AckPayload {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectedPayload {
    pub conn_id: String,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),
}

pub fn encode_text<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded =
        serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Decodes an envelope and refuses versions newer than this build speaks.
pub fn decode_envelope(bytes: &[u8], max_frame_bytes: usize) -> Result<WireEnvelope, FrameError> {
    let envelope: WireEnvelope = decode_frame(bytes, max_frame_bytes)?;
    if envelope.version.0 > CURRENT_PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(envelope.version.0));
    }
    Ok(envelope)
}
