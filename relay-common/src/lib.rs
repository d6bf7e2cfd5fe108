// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

pub mod gcp;
pub mod poll;

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 10;

pub const STARTING_MESSAGE: &str = "Starting the instance!";
pub const STOPPING_MESSAGE: &str = "Stopping the instance!";
pub const STOPPED_MESSAGE: &str = "The instance has stopped.";
pub const TAKING_TOO_LONG_MESSAGE: &str =
    "This is taking a while, please check the rest in the Google Cloud console.";
pub const UNSUPPORTED_COMMAND_MESSAGE: &str =
    "Only `status`, `start` and `stop` requests are accepted!";

/// Transport between the receiver and the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    PubSub,
    Kafka,
}

impl QueueBackend {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pubsub" | "" => Ok(Self::PubSub),
            "kafka" => Ok(Self::Kafka),
            other => anyhow::bail!("unsupported QUEUE_BACKEND `{other}` (expected pubsub or kafka)"),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::parse(&std::env::var("QUEUE_BACKEND").unwrap_or_default())
    }
}

/// Reads a variable that has no sensible default.
pub fn required_env(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required environment variable {name}"))
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("request authentication failed: {0}")]
    Authentication(String),
    #[error("missing form field `{0}`")]
    MissingField(&'static str),
    #[error("message publish failed: {0}")]
    Publish(String),
    #[error("compute API call failed: {0}")]
    CloudApi(String),
    #[error("malformed queued message: {0}")]
    MalformedMessage(String),
    #[error("chat callback failed: {0}")]
    Notify(String),
}

pub type RelayResult<T> = Result<T, RelayError>;

/// The three operations the relay understands; anything else is carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Start,
    Stop,
    Other(String),
}

impl Command {
    /// Matches the literal command text. No trimming or case folding.
    pub fn parse(text: &str) -> Self {
        match text {
            "status" => Self::Status,
            "start" => Self::Start,
            "stop" => Self::Stop,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Status => "status",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Other(text) => text,
        }
    }
}

/// A slash command as it travels through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundCommand {
    pub text: String,
    pub response_url: String,
}

impl InboundCommand {
    pub fn new(text: impl Into<String>, response_url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            response_url: response_url.into(),
        }
    }

    pub fn command(&self) -> Command {
        Command::parse(&self.text)
    }

    pub fn to_payload(&self) -> RelayResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|error| RelayError::MalformedMessage(format!("failed to encode: {error}")))
    }

    pub fn to_base64(&self) -> RelayResult<String> {
        Ok(BASE64.encode(self.to_payload()?))
    }

    pub fn from_payload(payload: &[u8]) -> RelayResult<Self> {
        let json = std::str::from_utf8(payload)
            .map_err(|error| RelayError::MalformedMessage(format!("payload is not UTF-8: {error}")))?;
        serde_json::from_str(json)
            .map_err(|error| RelayError::MalformedMessage(format!("invalid command JSON: {error}")))
    }

    pub fn from_base64(data: &str) -> RelayResult<Self> {
        let payload = BASE64
            .decode(data.trim())
            .map_err(|error| RelayError::MalformedMessage(format!("invalid base64: {error}")))?;
        Self::from_payload(&payload)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    InChannel,
}

/// Body of both the webhook acknowledgement and every callback post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlackReply {
    pub response_type: ResponseType,
    pub text: String,
}

impl SlackReply {
    pub fn in_channel(text: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::InChannel,
            text: text.into(),
        }
    }
}

/// Power state as reported by the Compute Engine API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceStatus {
    Provisioning,
    Staging,
    Running,
    Stopping,
    Suspending,
    Suspended,
    Repairing,
    Terminated,
    Other(String),
}

impl InstanceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Staging => "STAGING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Suspending => "SUSPENDING",
            Self::Suspended => "SUSPENDED",
            Self::Repairing => "REPAIRING",
            Self::Terminated => "TERMINATED",
            Self::Other(value) => value,
        }
    }
}

impl From<String> for InstanceStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "PROVISIONING" => Self::Provisioning,
            "STAGING" => Self::Staging,
            "RUNNING" => Self::Running,
            "STOPPING" => Self::Stopping,
            "SUSPENDING" => Self::Suspending,
            "SUSPENDED" => Self::Suspended,
            "REPAIRING" => Self::Repairing,
            "TERMINATED" => Self::Terminated,
            _ => Self::Other(value),
        }
    }
}

impl From<InstanceStatus> for String {
    fn from(value: InstanceStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(default)]
    pub name: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(rename = "natIP", default, skip_serializing_if = "Option::is_none")]
    pub nat_ip: Option<String>,
}

impl Instance {
    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }

    /// NAT IP of the first access config on the first network interface.
    pub fn external_ip(&self) -> Option<&str> {
        self.network_interfaces
            .first()?
            .access_configs
            .first()?
            .nat_ip
            .as_deref()
            .filter(|ip| !ip.is_empty())
    }
}

/// Address clause appended to status reports, empty unless the instance is
/// running and has an external address.
pub fn address_suffix(instance: &Instance, port: &str) -> String {
    if !instance.is_running() {
        return String::new();
    }
    match instance.external_ip() {
        Some(ip) => format!("\nAddress: `{ip}:{port}`"),
        None => String::new(),
    }
}

pub fn status_message(instance: &Instance, port: &str) -> String {
    format!(
        "The instance is currently {}.{}",
        instance.status,
        address_suffix(instance, port)
    )
}

pub fn started_message(instance: &Instance, port: &str) -> String {
    format!(
        "The instance has started!{}",
        address_suffix(instance, port)
    )
}

pub fn operation_failed_message(error: &RelayError) -> String {
    format!("An error occurred while operating the instance!\n{error}")
}

pub fn publish_failed_message(error: &RelayError) -> String {
    format!("Failed to publish the message! {error}")
}
