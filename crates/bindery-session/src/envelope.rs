//! Full and lite message shaping.
//!
//! A full-variant module output carries the peer-facing `payload` next to
//! self-facing fields. A lite output splits them into `sendToPeer` and
//! `sendToSelf`, and lite messages carry a `liteOp` tag and the `moduleType`
//! the receiver must route them to.

use bindery_modules::ModuleType;
use bindery_types::fields;
use serde_json::{json, Map, Value};

use crate::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    Full,
    Lite { unbind: bool },
}

impl Envelope {
    pub fn is_lite(self) -> bool {
        matches!(self, Self::Lite { .. })
    }

    /// The `liteOp` tag for a module, or `None` for the full variant.
    pub fn lite_op(self, module: ModuleType) -> Option<&'static str> {
        match (self, module) {
            (Self::Full, _) => None,
            (Self::Lite { unbind: false }, ModuleType::Identity) => Some("identityBind"),
            (Self::Lite { unbind: false }, ModuleType::Credential) => Some("credentialBind"),
            (Self::Lite { unbind: true }, ModuleType::Identity) => Some("identityUnbind"),
            (Self::Lite { unbind: true }, ModuleType::Credential) => Some("credentialUnbind"),
        }
    }

    /// Peer-facing part of a module output, if there is one.
    pub fn to_peer(self, out: &Value) -> Option<Value> {
        let field = if self.is_lite() {
            fields::SEND_TO_PEER
        } else {
            fields::PAYLOAD
        };
        out.get(field).filter(|v| !v.is_null()).cloned()
    }

    /// Self-facing part of a module output.
    pub fn to_self(self, out: &Value) -> Value {
        if self.is_lite() {
            out.get(fields::SEND_TO_SELF).cloned().unwrap_or(Value::Null)
        } else {
            out.clone()
        }
    }

    /// Adds a peer payload and, for lite messages, the routing tags.
    pub fn wrap(self, msg: &mut Map<String, Value>, payload: Value, module: ModuleType) {
        msg.insert(fields::PAYLOAD.into(), payload);
        if let Some(op) = self.lite_op(module) {
            msg.insert(fields::IS_LITE.into(), json!(true));
            msg.insert(fields::LITE_OP.into(), json!(op));
            msg.insert(fields::MODULE_TYPE.into(), json!(module.as_i32()));
        }
    }

    /// Module that must process an inbound message. Lite messages name it;
    /// full messages go to `expected`.
    pub fn module_for(self, message: &Value, expected: ModuleType) -> Result<ModuleType, SessionError> {
        if !self.is_lite() {
            return Ok(expected);
        }
        match message.get(fields::MODULE_TYPE) {
            None => Ok(expected),
            Some(v) => v
                .as_i64()
                .and_then(|t| i32::try_from(t).ok())
                .and_then(ModuleType::from_i32)
                .ok_or_else(|| SessionError::Malformed(format!("unknown module type {v}"))),
        }
    }
}

/// Whether an inbound opening message uses the lite envelope.
pub fn is_lite_message(message: &Value) -> bool {
    message
        .get(fields::IS_LITE)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lite_wraps_with_tags() {
        let mut msg = Map::new();
        Envelope::Lite { unbind: false }.wrap(&mut msg, json!({ "n": 1 }), ModuleType::Credential);
        assert_eq!(msg["liteOp"], "credentialBind");
        assert_eq!(msg["moduleType"], 0x0010);
        assert_eq!(msg["isLite"], true);

        let mut msg = Map::new();
        Envelope::Full.wrap(&mut msg, json!({ "n": 1 }), ModuleType::Identity);
        assert!(!msg.contains_key("liteOp"));
    }

    #[test]
    fn outputs_split_by_variant() {
        let lite_out = json!({ "sendToPeer": { "a": 1 }, "sendToSelf": { "sessionKey": "00" } });
        let lite = Envelope::Lite { unbind: true };
        assert_eq!(lite.to_peer(&lite_out), Some(json!({ "a": 1 })));
        assert_eq!(lite.to_self(&lite_out)["sessionKey"], "00");

        let full_out = json!({ "payload": null, "sessionKey": "00" });
        assert_eq!(Envelope::Full.to_peer(&full_out), None);
        assert_eq!(Envelope::Full.to_self(&full_out)["sessionKey"], "00");
    }

    #[test]
    fn lite_reads_module_per_message() {
        let lite = Envelope::Lite { unbind: false };
        let msg = json!({ "moduleType": 16 });
        assert_eq!(
            lite.module_for(&msg, ModuleType::Identity).unwrap(),
            ModuleType::Credential
        );
        assert_eq!(
            Envelope::Full.module_for(&msg, ModuleType::Identity).unwrap(),
            ModuleType::Identity
        );
        assert!(lite.module_for(&json!({ "moduleType": 3 }), ModuleType::Identity).is_err());
    }
}
