//! JSON control messages sent by WebSocket clients.

use serde::Deserialize;
use serde::Serialize;
use serde_json::error::Category;
use thiserror::Error;

use crate::session_types::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    Subscribe {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    Unsubscribe {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
}

impl ControlMessage {
    pub fn session_id(&self) -> &SessionId {
        match self {
            ControlMessage::Subscribe { session_id } | ControlMessage::Unsubscribe { session_id } => {
                session_id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The text is not JSON at all.
    #[error("Control message is not valid JSON: {0}")]
    InvalidJson(String),
    /// Valid JSON that does not describe a known message: missing or unknown
    /// `type`, or a missing or invalid `sessionId`.
    #[error("Malformed control message: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            Category::Data => ProtocolError::Malformed(err.to_string()),
            Category::Syntax | Category::Eof | Category::Io => {
                ProtocolError::InvalidJson(err.to_string())
            }
        }
    }
}

/// Parses one text frame into a [`ControlMessage`].
pub fn parse_control_message(text: &str) -> Result<ControlMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn malformed_reason(text: &str) -> String {
        match parse_control_message(text) {
            Err(ProtocolError::Malformed(reason)) => reason,
            other => panic!("expected a malformed message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_subscribe() {
        let msg = parse_control_message(r#"{"type":"subscribe","sessionId":"abc"}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Subscribe {
                session_id: SessionId::new("abc")
            }
        );
    }

    #[test]
    fn test_parse_unsubscribe_ignores_extra_fields() {
        let msg =
            parse_control_message(r#"{"type":"unsubscribe","sessionId":"abc","extra":1}"#).unwrap();
        assert_eq!(msg.session_id().as_str(), "abc");
        assert!(matches!(msg, ControlMessage::Unsubscribe { .. }));
    }

    #[test]
    fn test_not_json() {
        assert!(matches!(
            parse_control_message("{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_control_message(""),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_missing_or_unknown_type() {
        assert!(malformed_reason(r#"{"sessionId":"a"}"#).contains("type"));
        assert!(malformed_reason(r#"{"type":"resize","sessionId":"a"}"#).contains("resize"));
    }

    #[test]
    fn test_missing_or_invalid_session_id() {
        assert!(malformed_reason(r#"{"type":"subscribe"}"#).contains("sessionId"));
        assert!(malformed_reason(r#"{"type":"subscribe","sessionId":"  "}"#).contains("empty"));
        assert!(!malformed_reason(r#"{"type":"unsubscribe","sessionId":7}"#).is_empty());
    }

    #[test]
    fn test_serialize_matches_wire_shape() {
        let msg = ControlMessage::Subscribe {
            session_id: SessionId::new("s1"),
        };
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"type":"subscribe","sessionId":"s1"}"#
        );
    }
}
