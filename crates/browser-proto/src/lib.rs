//! Line-delimited JSON protocol for browser child processes.
//!
//! ## Wire Format
//!
//! One JSON object per line, both directions:
//!
//! ```text
//! H→C  {"action":"get_user_info","username":"alice","tiktok_id":"123"}
//! H→C  {"action":"get_user_videos","username":"alice"}
//! C→H  {"status":"success","data":<payload>}
//! C→H  {"status":"error","message":"<string>"}
//! ```
//!
//! The child answers every request with exactly one response line.
//! Unknown actions elicit `{"status":"error","message":"Unknown action"}`.
//! Anything the child prints that is not a JSON object (browser noise,
//! progress chatter) is not part of the protocol; readers skip it.

use serde::{Deserialize, Serialize};

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The line is not JSON at all. Readers log and skip these.
    #[error("not a JSON line: {0}")]
    NotJson(String),

    /// The line is JSON but does not match the response shape.
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),

    #[error("encode failed: {0}")]
    Encode(String),
}

/// A command sent to the browser child, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScrapeRequest {
    /// Fetch profile + statistics for one account.
    GetUserInfo {
        username: String,
        tiktok_id: Option<String>,
    },
    /// Fetch the account's video list.
    GetUserVideos { username: String },
}

impl ScrapeRequest {
    pub fn user_info(username: impl Into<String>, tiktok_id: Option<String>) -> Self {
        Self::GetUserInfo {
            username: username.into(),
            tiktok_id,
        }
    }

    pub fn user_videos(username: impl Into<String>) -> Self {
        Self::GetUserVideos {
            username: username.into(),
        }
    }

    /// The account handle this request addresses.
    pub fn username(&self) -> &str {
        match self {
            Self::GetUserInfo { username, .. } | Self::GetUserVideos { username } => username,
        }
    }
}

/// A response line from the browser child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ScrapeResponse {
    Success { data: serde_json::Value },
    Error { message: String },
}

impl ScrapeResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Encode a request as one newline-terminated JSON line.
pub fn encode_line(request: &ScrapeRequest) -> Result<String, ProtoError> {
    let mut line =
        serde_json::to_string(request).map_err(|e| ProtoError::Encode(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Decode one line from the child.
///
/// Distinguishes non-JSON noise ([`ProtoError::NotJson`], which readers
/// skip) from JSON that fails to match the response shape
/// ([`ProtoError::UnexpectedShape`]).
pub fn decode_line(line: &str) -> Result<ScrapeResponse, ProtoError> {
    let value: serde_json::Value = serde_json::from_str(line.trim())
        .map_err(|e| ProtoError::NotJson(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| ProtoError::UnexpectedShape(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_user_info_includes_tiktok_id() {
        let req = ScrapeRequest::user_info("alice", Some("123".into()));
        let line = encode_line(&req).unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["action"], "get_user_info");
        assert_eq!(value["username"], "alice");
        assert_eq!(value["tiktok_id"], "123");
    }

    #[test]
    fn encode_user_info_null_tiktok_id() {
        let req = ScrapeRequest::user_info("bob", None);
        let line = encode_line(&req).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert!(value["tiktok_id"].is_null());
    }

    #[test]
    fn encode_user_videos_has_no_tiktok_id() {
        let req = ScrapeRequest::user_videos("alice");
        let line = encode_line(&req).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["action"], "get_user_videos");
        assert!(value.get("tiktok_id").is_none());
    }

    #[test]
    fn request_round_trip() {
        let req = ScrapeRequest::user_info("alice", Some("42".into()));
        let line = encode_line(&req).unwrap();
        let back: ScrapeRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn decode_success_response() {
        let resp = decode_line(r#"{"status":"success","data":{"userInfo":{}}}"#).unwrap();
        match resp {
            ScrapeResponse::Success { data } => assert!(data["userInfo"].is_object()),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn decode_error_response() {
        let resp = decode_line(r#"{"status":"error","message":"Unknown action"}"#).unwrap();
        assert_eq!(
            resp,
            ScrapeResponse::Error {
                message: "Unknown action".into()
            }
        );
    }

    #[test]
    fn decode_trims_trailing_newline() {
        let resp = decode_line("{\"status\":\"success\",\"data\":[]}\n").unwrap();
        assert!(resp.is_success());
    }

    #[test]
    fn decode_non_json_is_not_json() {
        let err = decode_line("EOF received. Exiting.").unwrap_err();
        assert!(matches!(err, ProtoError::NotJson(_)));
    }

    #[test]
    fn decode_wrong_shape_is_unexpected() {
        let err = decode_line(r#"{"status":"weird"}"#).unwrap_err();
        assert!(matches!(err, ProtoError::UnexpectedShape(_)));
    }

    #[test]
    fn username_accessor() {
        assert_eq!(
            ScrapeRequest::user_info("a", None).username(),
            "a"
        );
        assert_eq!(ScrapeRequest::user_videos("b").username(), "b");
    }
}
