//! Job payloads.
//!
//! The queue treats a payload as an opaque JSON object. It only ever looks at
//! two keys: `task_id` (record key) and an optional `max_attempts` override.
//! Everything else is handed to the executor verbatim.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::Result;
use super::ids::TaskId;

/// Serialized job input, as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskPayload(Map<String, Value>);

impl TaskPayload {
    /// Accepts any JSON object. Non-object values are a serialization error.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(Self(serde_json::from_value(value)?))
    }

    /// Parse the stored `payload_json` column.
    pub fn parse(json: &str) -> Result<Self> {
        Ok(Self(serde_json::from_str(json)?))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.0
            .get("task_id")
            .and_then(Value::as_str)
            .and_then(TaskId::new)
    }

    /// Per-task attempt budget. Accepts numbers and numeric strings.
    pub fn max_attempts(&self) -> Option<u32> {
        match self.0.get("max_attempts")? {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Typed view for executors.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.0.clone()))?)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// A video-to-note generation request, the payload the HTTP layer submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRequest {
    pub task_id: String,
    pub video_url: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub format: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<String>,
    #[serde(default)]
    pub video_understanding: bool,
    #[serde(default)]
    pub video_interval: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grid_size: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl NoteRequest {
    pub fn new(
        task_id: &TaskId,
        video_url: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            video_url: video_url.into(),
            platform: platform.into(),
            quality: None,
            link: None,
            screenshot: None,
            model_name: None,
            provider_id: None,
            format: Vec::new(),
            style: None,
            extras: None,
            video_understanding: false,
            video_interval: 0,
            grid_size: Vec::new(),
            max_attempts: None,
        }
    }

    pub fn with_model(mut self, provider_id: impl Into<String>, model_name: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self.model_name = Some(model_name.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn into_payload(self) -> Result<TaskPayload> {
        TaskPayload::from_value(serde_json::to_value(self)?)
    }
}
