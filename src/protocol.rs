//! Wire messages.
//!
//! One JSON object per line in each direction over a persistent connection.
//!
//! Requests: `{"type": "get_clip"}`, `{"type": "status"}`.
//!
//! Clip replies carry either the encoded clip (base64 text) and its bounds, or
//! `{"success": false, "error": "..."}`. Malformed requests get the failure shape.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::ClipError;
use crate::server::ServedClip;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    GetClip,
    Status,
}

/// A successfully served clip as seen on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct ClipSuccess {
    /// Base64 of the encoded blob.
    pub clip_data: String,
    pub format: String,
    pub frame_count: usize,
    pub duration: f64,
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    /// Seconds at the head of the window lost to buffer overrun.
    pub gap_seconds: f64,
}

impl ClipSuccess {
    pub fn decode_blob(&self) -> Result<Vec<u8>, ClipError> {
        STANDARD
            .decode(self.clip_data.as_bytes())
            .map_err(|e| ClipError::Protocol(format!("invalid clip_data: {}", e)))
    }
}

impl From<ServedClip> for ClipSuccess {
    fn from(served: ServedClip) -> Self {
        Self {
            clip_data: STANDARD.encode(&served.clip.blob),
            format: served.clip.format.to_string(),
            frame_count: served.clip.frame_count,
            duration: served.clip.duration_secs,
            start_timestamp: served.clip.start_timestamp,
            end_timestamp: served.clip.end_timestamp,
            gap_seconds: served.gap_seconds,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireClipReply", try_from = "WireClipReply")]
pub enum ClipReply {
    Success(ClipSuccess),
    Failure { error: String },
}

impl ClipReply {
    pub fn failure(err: &ClipError) -> Self {
        ClipReply::Failure {
            error: err.to_string(),
        }
    }

    pub fn into_result(self) -> Result<ClipSuccess, ClipError> {
        match self {
            ClipReply::Success(clip) => Ok(clip),
            ClipReply::Failure { error } => Err(ClipError::from_wire(&error)),
        }
    }
}

impl From<Result<ServedClip, ClipError>> for ClipReply {
    fn from(result: Result<ServedClip, ClipError>) -> Self {
        match result {
            Ok(served) => ClipReply::Success(served.into()),
            Err(err) => ClipReply::failure(&err),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct WireClipReply {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    clip_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    frame_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    end_timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gap_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<ClipReply> for WireClipReply {
    fn from(reply: ClipReply) -> Self {
        match reply {
            ClipReply::Success(clip) => WireClipReply {
                success: true,
                clip_data: Some(clip.clip_data),
                format: Some(clip.format),
                frame_count: Some(clip.frame_count),
                duration: Some(clip.duration),
                start_timestamp: Some(clip.start_timestamp),
                end_timestamp: Some(clip.end_timestamp),
                gap_seconds: Some(clip.gap_seconds),
                error: None,
            },
            ClipReply::Failure { error } => WireClipReply {
                success: false,
                clip_data: None,
                format: None,
                frame_count: None,
                duration: None,
                start_timestamp: None,
                end_timestamp: None,
                gap_seconds: None,
                error: Some(error),
            },
        }
    }
}

impl TryFrom<WireClipReply> for ClipReply {
    type Error = String;

    fn try_from(wire: WireClipReply) -> Result<Self, Self::Error> {
        if !wire.success {
            return Ok(ClipReply::Failure {
                error: wire.error.unwrap_or_else(|| "unspecified error".to_string()),
            });
        }
        let missing = |field: &str| format!("clip reply missing '{}'", field);
        Ok(ClipReply::Success(ClipSuccess {
            clip_data: wire.clip_data.ok_or_else(|| missing("clip_data"))?,
            format: wire.format.unwrap_or_else(|| "stack".to_string()),
            frame_count: wire.frame_count.ok_or_else(|| missing("frame_count"))?,
            duration: wire.duration.ok_or_else(|| missing("duration"))?,
            start_timestamp: wire.start_timestamp.ok_or_else(|| missing("start_timestamp"))?,
            end_timestamp: wire.end_timestamp.ok_or_else(|| missing("end_timestamp"))?,
            gap_seconds: wire.gap_seconds.unwrap_or(0.0),
        }))
    }
}

/// Read-only server status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub running: bool,
    pub buffered_frame_count: usize,
    pub buffered_duration_seconds: f64,
    pub last_clip_end: Option<f64>,
    pub uptime: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_request_types() {
        let req: Request = serde_json::from_str(r#"{"type": "get_clip"}"#).unwrap();
        assert_eq!(req, Request::GetClip);
        let req: Request = serde_json::from_str(r#"{"type": "status"}"#).unwrap();
        assert_eq!(req, Request::Status);
        assert!(serde_json::from_str::<Request>(r#"{"type": "reboot"}"#).is_err());
    }

    #[test]
    fn failure_reply_has_error_only() {
        let reply = ClipReply::failure(&ClipError::NoFramesAvailable);
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            value,
            json!({"success": false, "error": "no frames available"})
        );
        let parsed: ClipReply = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.into_result(), Err(ClipError::NoFramesAvailable));
    }

    #[test]
    fn success_reply_carries_clip_fields() {
        let reply = ClipReply::Success(ClipSuccess {
            clip_data: STANDARD.encode(b"blob"),
            format: "stack".to_string(),
            frame_count: 50,
            duration: 5.0,
            start_timestamp: 0.0,
            end_timestamp: 5.0,
            gap_seconds: 0.0,
        });
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["success"], json!(true));
        assert_eq!(value["frame_count"], json!(50));
        assert_eq!(value["duration"], json!(5.0));
        assert_eq!(value["end_timestamp"], json!(5.0));
        assert!(value.get("error").is_none());

        let clip = serde_json::from_value::<ClipReply>(value)
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(clip.decode_blob().unwrap(), b"blob");
    }

    #[test]
    fn success_reply_missing_fields_is_rejected() {
        let value = json!({"success": true, "frame_count": 3});
        assert!(serde_json::from_value::<ClipReply>(value).is_err());
    }

    #[test]
    fn status_serializes_null_cursor() {
        let status = StatusReply {
            running: true,
            buffered_frame_count: 0,
            buffered_duration_seconds: 0.0,
            last_clip_end: None,
            uptime: 1.5,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["last_clip_end"], serde_json::Value::Null);
        assert_eq!(value["running"], json!(true));
    }
}
