//! Pin-based key agreement between two devices with no group in common.

use bindery_channels::{ChannelError, ChannelKind};
use bindery_groups::params;
use bindery_modules::ModuleType;
use bindery_types::{fields, LocalDevice, OperationCode};
use serde_json::{json, Value};

use crate::message;
use crate::session::{Completion, Role, TaskParams};
use crate::{SessionContext, SessionError, SessionKind};

fn task_params(local: &LocalDevice, is_client: bool, pin: &str) -> Value {
    TaskParams {
        is_client,
        pin_code: Some(pin),
        ..TaskParams::default()
    }
    .to_value(local)
}

pub(crate) struct KeyAgreeClient {
    pin: String,
    peer_udid: Option<String>,
}

impl KeyAgreeClient {
    pub(crate) fn new(request: &Value, channel: ChannelKind) -> Result<Self, SessionError> {
        if channel == ChannelKind::None {
            return Err(ChannelError::NoChannel.into());
        }
        Ok(Self {
            pin: params::required_str(request, fields::PIN_CODE)?.to_string(),
            peer_udid: None,
        })
    }
}

impl Role for KeyAgreeClient {
    fn kind(&self) -> SessionKind {
        SessionKind::ClientKeyAgree
    }

    fn module_type(&self) -> ModuleType {
        ModuleType::Identity
    }

    fn task_params(&self, local: &LocalDevice) -> Result<Value, SessionError> {
        Ok(task_params(local, true, &self.pin))
    }

    fn read_peer_message(&mut self, msg: &Value) -> Result<(), SessionError> {
        if self.peer_udid.is_none() {
            self.peer_udid = message::str_field(msg, fields::PEER_DEVICE_ID).map(str::to_string);
        }
        Ok(())
    }

    fn complete(&mut self, _ctx: &SessionContext, _own: &Value) -> Result<Completion, SessionError> {
        Ok(Completion {
            events: Vec::new(),
            data: json!({ fields::PEER_DEVICE_ID: self.peer_udid }),
        })
    }
}

/// Answering side. The local user supplies the pin through confirmation.
pub(crate) struct KeyAgreeServer {
    app_id: String,
    peer_udid: String,
    pin: Option<String>,
}

impl KeyAgreeServer {
    pub(crate) fn new(opening: &Value) -> Result<Self, SessionError> {
        Ok(Self {
            app_id: message::required_str(opening, fields::APP_ID)?.to_string(),
            peer_udid: message::required_str(opening, fields::PEER_DEVICE_ID)?.to_string(),
            pin: None,
        })
    }
}

impl Role for KeyAgreeServer {
    fn kind(&self) -> SessionKind {
        SessionKind::ServerKeyAgree
    }

    fn module_type(&self) -> ModuleType {
        ModuleType::Identity
    }

    fn task_params(&self, local: &LocalDevice) -> Result<Value, SessionError> {
        let pin = self
            .pin
            .as_deref()
            .ok_or_else(|| SessionError::InvalidParams("key agreement accepted without a pin".into()))?;
        Ok(task_params(local, false, pin))
    }

    fn confirmation_request(&self) -> Option<Value> {
        Some(json!({
            fields::OPERATION_CODE: OperationCode::KeyAgreement.as_i32(),
            fields::APP_ID: self.app_id,
            fields::PEER_DEVICE_ID: self.peer_udid,
        }))
    }

    fn accept_confirmation(&mut self, doc: &Value) -> Result<(), SessionError> {
        self.pin = Some(params::required_str(doc, fields::PIN_CODE)?.to_string());
        Ok(())
    }

    fn complete(&mut self, _ctx: &SessionContext, _own: &Value) -> Result<Completion, SessionError> {
        Ok(Completion {
            events: Vec::new(),
            data: json!({ fields::PEER_DEVICE_ID: self.peer_udid }),
        })
    }
}
