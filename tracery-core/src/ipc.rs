use serde::{Deserialize, Serialize};

use crate::models::CapturedEvent;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TraceryRequest {
    Ping,
    Health,
    StartRecording {
        session_id: String,
    },
    RecordEvent {
        session_id: String,
        event: CapturedEvent,
    },
    Finalize {
        session_id: String,
    },
    DiscardSession {
        session_id: String,
    },
    Stats,
    ListTemplates,
    GetTemplate {
        id: uuid::Uuid,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TraceryResponse {
    pub status: String,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub version: String,
}

impl TraceryResponse {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(msg.into()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(serde_json::json!({"pong": true}))
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;

    #[test]
    fn test_record_event_survives_msgpack() {
        let request = TraceryRequest::RecordEvent {
            session_id: "s-1".to_string(),
            event: CapturedEvent::new(EventType::Submit, "https://app.test/checkout"),
        };
        let bytes = rmp_serde::to_vec_named(&request).unwrap();
        let decoded: TraceryRequest = rmp_serde::from_slice(&bytes).unwrap();
        match decoded {
            TraceryRequest::RecordEvent { session_id, event } => {
                assert_eq!(session_id, "s-1");
                assert_eq!(event.event_type, EventType::Submit);
                assert_eq!(event.url, "https://app.test/checkout");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_template_id_survives_msgpack() {
        let id = uuid::Uuid::new_v4();
        let bytes = rmp_serde::to_vec_named(&TraceryRequest::GetTemplate { id }).unwrap();
        match rmp_serde::from_slice(&bytes).unwrap() {
            TraceryRequest::GetTemplate { id: decoded } => assert_eq!(decoded, id),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_action_tag_on_the_wire() {
        let json = serde_json::to_value(TraceryRequest::Finalize {
            session_id: "abc".to_string(),
        })
        .unwrap();
        assert_eq!(json["action"], "finalize");
        assert_eq!(json["session_id"], "abc");
    }

    #[test]
    fn test_error_response_shape() {
        let resp = TraceryResponse::err("boom");
        assert!(!resp.is_ok());
        assert_eq!(resp.error.as_deref(), Some("boom"));
        assert!(resp.data.is_none());
    }
}
