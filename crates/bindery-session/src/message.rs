//! Wire message construction and inspection.

use bindery_types::{fields, ErrorCode, MessageKind, OperationCode, RequestId};
use serde_json::{json, Map, Value};

use crate::SessionError;

/// Decodes one wire message. It must be a JSON object.
pub fn decode(data: &[u8]) -> Result<Value, SessionError> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| SessionError::Malformed(format!("not JSON: {e}")))?;
    if !value.is_object() {
        return Err(SessionError::Malformed("message is not an object".into()));
    }
    Ok(value)
}

pub fn encode(message: &Value) -> Vec<u8> {
    message.to_string().into_bytes()
}

pub fn request_id(message: &Value) -> Option<RequestId> {
    message.get(fields::REQUEST_ID).and_then(Value::as_i64)
}

pub fn kind(message: &Value) -> Option<MessageKind> {
    message
        .get(fields::MESSAGE)
        .and_then(Value::as_i64)
        .and_then(MessageKind::from_i64)
}

pub fn operation(message: &Value) -> Option<OperationCode> {
    message
        .get(fields::OPERATION_CODE)
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok())
        .and_then(OperationCode::from_i32)
}

pub fn str_field<'a>(message: &'a Value, field: &str) -> Option<&'a str> {
    message
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

pub fn required_str<'a>(message: &'a Value, field: &str) -> Result<&'a str, SessionError> {
    str_field(message, field).ok_or_else(|| SessionError::Malformed(format!("missing {field}")))
}

/// The error a peer reported, if `message` is an error notice.
pub fn peer_error(message: &Value) -> Option<ErrorCode> {
    if kind(message) != Some(MessageKind::Error) {
        return None;
    }
    Some(
        message
            .get(fields::GROUP_ERROR_MSG)
            .and_then(Value::as_i64)
            .map(ErrorCode::from_wire)
            .unwrap_or(ErrorCode::ProtocolError),
    )
}

/// A bare message of `kind` for `request_id`.
pub fn base(kind: MessageKind, request_id: RequestId) -> Map<String, Value> {
    let mut msg = Map::new();
    msg.insert(fields::MESSAGE.into(), json!(kind.as_i64()));
    msg.insert(fields::REQUEST_ID.into(), json!(request_id));
    msg
}

/// The notice sent to a peer when the local side fails. It carries only the
/// request id, the app id, and the error code.
pub fn error_notice(request_id: RequestId, app_id: &str, code: ErrorCode) -> Value {
    let mut msg = base(MessageKind::Error, request_id);
    msg.insert(fields::APP_ID.into(), json!(app_id));
    msg.insert(fields::GROUP_ERROR_MSG.into(), json!(code.as_i32()));
    Value::Object(msg)
}

/// Copy of `doc` safe to log or hand to a finish callback.
pub fn redact(doc: &Value) -> Value {
    let mut doc = doc.clone();
    if let Some(map) = doc.as_object_mut() {
        map.remove(fields::SESSION_KEY);
        map.remove(fields::PIN_CODE);
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_notice_has_only_the_public_fields() {
        let notice = error_notice(42, "app", ErrorCode::NotFound);
        let keys: Vec<_> = notice.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys.len(), 4);
        assert_eq!(notice["message"], 0x8080);
        assert_eq!(notice["groupErrorMsg"], 1002);
        assert_eq!(peer_error(&notice), Some(ErrorCode::NotFound));
    }

    #[test]
    fn decode_rejects_non_objects() {
        assert!(decode(b"[1,2]").is_err());
        assert!(decode(b"not json").is_err());
        let msg = decode(br#"{"message":1,"requestId":7,"operationCode":3}"#).unwrap();
        assert_eq!(kind(&msg), Some(MessageKind::Opening));
        assert_eq!(request_id(&msg), Some(7));
        assert_eq!(operation(&msg), Some(OperationCode::MemberJoin));
        assert_eq!(peer_error(&msg), None);
    }

    #[test]
    fn redact_drops_secrets() {
        let doc = json!({ "sessionKey": "00", "pinCode": "1234", "groupId": "G" });
        assert_eq!(redact(&doc), json!({ "groupId": "G" }));
    }
}
