//! OCPP-J message framing
//!
//! The OCPP-J (JSON over WebSocket) transport envelope is identical across
//! OCPP 1.6 and 2.0.1:
//!
//! - **Call**       `[2, "<uniqueId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<uniqueId>", {<payload>}]`
//! - **CallError**  `[4, "<uniqueId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`
//!
//! Parsing distinguishes failures where the peer's message id could still be
//! recovered (answerable with a CallError) from failures where it could not
//! (the connection must be closed).

use serde_json::Value;

use super::errors::ProxyError;

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

// ── OcppFrame ──────────────────────────────────────────────────

/// A parsed OCPP-J frame (version-agnostic transport envelope).
#[derive(Debug, Clone, PartialEq)]
pub enum OcppFrame {
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        unique_id: String,
        payload: Value,
    },
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

/// Parse failure carrying the message id when it was recoverable.
#[derive(Debug)]
pub struct FrameParseError {
    /// Message id of the offending frame, if the envelope got that far.
    pub unique_id: Option<String>,
    pub error: ProxyError,
}

impl FrameParseError {
    fn new(unique_id: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            unique_id,
            error: ProxyError::InvalidFrame(detail.into()),
        }
    }
}

impl OcppFrame {
    /// Parse a raw WebSocket text frame.
    pub fn parse(text: &str) -> Result<Self, FrameParseError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| FrameParseError::new(None, format!("not valid JSON: {e}")))?;

        let arr = match value {
            Value::Array(arr) => arr,
            _ => return Err(FrameParseError::new(None, "top level is not an array")),
        };
        if arr.is_empty() {
            return Err(FrameParseError::new(None, "empty message array"));
        }

        // The id sits at index 1 for every message type; recover it early so
        // later failures can still be answered with a CallError.
        let unique_id = arr.get(1).and_then(Value::as_str).map(str::to_owned);

        let msg_type = arr[0].as_u64().ok_or_else(|| {
            FrameParseError::new(unique_id.clone(), "message type is not a number")
        })?;

        match msg_type {
            MSG_TYPE_CALL => Self::parse_call(&arr, unique_id),
            MSG_TYPE_CALL_RESULT => Self::parse_call_result(&arr, unique_id),
            MSG_TYPE_CALL_ERROR => Self::parse_call_error(&arr, unique_id),
            other => Err(FrameParseError::new(
                unique_id,
                format!("unknown message type {other}"),
            )),
        }
    }

    fn parse_call(arr: &[Value], recovered: Option<String>) -> Result<Self, FrameParseError> {
        let unique_id = recovered
            .clone()
            .ok_or_else(|| FrameParseError::new(None, "call uniqueId must be a string"))?;
        if arr.len() < 4 {
            return Err(FrameParseError::new(
                recovered,
                format!("call needs 4 fields, got {}", arr.len()),
            ));
        }
        let action = arr[2]
            .as_str()
            .ok_or_else(|| FrameParseError::new(recovered, "action must be a string"))?
            .to_owned();

        Ok(Self::Call {
            unique_id,
            action,
            payload: arr[3].clone(),
        })
    }

    fn parse_call_result(
        arr: &[Value],
        recovered: Option<String>,
    ) -> Result<Self, FrameParseError> {
        let unique_id = recovered
            .ok_or_else(|| FrameParseError::new(None, "result uniqueId must be a string"))?;
        let payload = arr
            .get(2)
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        Ok(Self::CallResult { unique_id, payload })
    }

    fn parse_call_error(
        arr: &[Value],
        recovered: Option<String>,
    ) -> Result<Self, FrameParseError> {
        let unique_id = recovered
            .ok_or_else(|| FrameParseError::new(None, "error uniqueId must be a string"))?;
        let error_code = arr
            .get(2)
            .and_then(Value::as_str)
            .unwrap_or("InternalError")
            .to_owned();
        let error_description = arr
            .get(3)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();
        let error_details = arr
            .get(4)
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        Ok(Self::CallError {
            unique_id,
            error_code,
            error_description,
            error_details,
        })
    }

    /// Serialize this frame to a JSON string.
    pub fn serialize(&self) -> String {
        let arr: Value = match self {
            Self::Call {
                unique_id,
                action,
                payload,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL.into()),
                Value::String(unique_id.clone()),
                Value::String(action.clone()),
                payload.clone(),
            ]),
            Self::CallResult { unique_id, payload } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_RESULT.into()),
                Value::String(unique_id.clone()),
                payload.clone(),
            ]),
            Self::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => Value::Array(vec![
                Value::Number(MSG_TYPE_CALL_ERROR.into()),
                Value::String(unique_id.clone()),
                Value::String(error_code.clone()),
                Value::String(error_description.clone()),
                error_details.clone(),
            ]),
        };
        // serde_json::to_string on a Value never fails
        serde_json::to_string(&arr).unwrap()
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Self::Call { unique_id, .. }
            | Self::CallResult { unique_id, .. }
            | Self::CallError { unique_id, .. } => unique_id,
        }
    }

    /// Build a CallError answer for a given message id.
    pub fn error_response(
        unique_id: impl Into<String>,
        error_code: impl Into<String>,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            unique_id: unique_id.into(),
            error_code: error_code.into(),
            error_description: error_description.into(),
            error_details: Value::Object(Default::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_call() {
        let text = r#"[2,"19","StartTransaction",{"connectorId":1,"idTag":"ABC","meterStart":1000,"timestamp":"2024-05-01T10:00:00Z"}]"#;
        match OcppFrame::parse(text).unwrap() {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => {
                assert_eq!(unique_id, "19");
                assert_eq!(action, "StartTransaction");
                assert_eq!(payload["meterStart"], 1000);
            }
            other => panic!("expected Call, got {other:?}"),
        }
    }

    #[test]
    fn parse_call_result() {
        let text = r#"[3,"7",{"status":"Accepted"}]"#;
        match OcppFrame::parse(text).unwrap() {
            OcppFrame::CallResult { unique_id, payload } => {
                assert_eq!(unique_id, "7");
                assert_eq!(payload["status"], "Accepted");
            }
            other => panic!("expected CallResult, got {other:?}"),
        }
    }

    #[test]
    fn parse_call_error() {
        let text = r#"[4,"7","NotImplemented","Unknown action",{}]"#;
        match OcppFrame::parse(text).unwrap() {
            OcppFrame::CallError {
                unique_id,
                error_code,
                ..
            } => {
                assert_eq!(unique_id, "7");
                assert_eq!(error_code, "NotImplemented");
            }
            other => panic!("expected CallError, got {other:?}"),
        }
    }

    #[test]
    fn malformed_json_has_no_recoverable_id() {
        let err = OcppFrame::parse("{not json").unwrap_err();
        assert!(err.unique_id.is_none());
    }

    #[test]
    fn unknown_message_type_recovers_id() {
        let err = OcppFrame::parse(r#"[9,"42","Whatever",{}]"#).unwrap_err();
        assert_eq!(err.unique_id.as_deref(), Some("42"));
    }

    #[test]
    fn short_call_recovers_id() {
        let err = OcppFrame::parse(r#"[2,"13","Heartbeat"]"#).unwrap_err();
        assert_eq!(err.unique_id.as_deref(), Some("13"));
    }

    #[test]
    fn non_array_rejected() {
        assert!(OcppFrame::parse(r#"{"op":"subscribe"}"#).is_err());
    }

    #[test]
    fn roundtrip_all_shapes() {
        let frames = [
            OcppFrame::Call {
                unique_id: "1".into(),
                action: "Heartbeat".into(),
                payload: serde_json::json!({}),
            },
            OcppFrame::CallResult {
                unique_id: "2".into(),
                payload: serde_json::json!({"currentTime": "2024-05-01T10:00:00Z"}),
            },
            OcppFrame::error_response("3", "GenericError", "boom"),
        ];
        for frame in frames {
            let parsed = OcppFrame::parse(&frame.serialize()).unwrap();
            assert_eq!(parsed, frame);
        }
    }
}
