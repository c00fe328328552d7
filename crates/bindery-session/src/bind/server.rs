use bindery_db::{DeviceEntry, GroupEntry};
use bindery_groups::{params, BindCommit};
use bindery_modules::ModuleType;
use bindery_types::{fields, DeviceType, LocalDevice, OperationCode, OsAccountId};
use serde_json::{json, Map, Value};

use super::{bind_module, envelope, group_fields, peer_record, sender_type};
use crate::envelope::{is_lite_message, Envelope};
use crate::message;
use crate::session::{Completion, Role, TaskParams};
use crate::{SessionContext, SessionError, SessionKind};

fn check_declared_type(opening: &Value, group: &GroupEntry) -> Result<(), SessionError> {
    match params::optional_i64(opening, fields::GROUP_TYPE)? {
        Some(declared) if declared != i64::from(group.group_type.as_i32()) => Err(
            SessionError::InvalidParams(format!("group {} has a different type", group.group_id)),
        ),
        _ => Ok(()),
    }
}

/// Owning side of a join. Always asks the local user first.
pub(crate) struct JoinServer {
    os: OsAccountId,
    app_id: String,
    group: GroupEntry,
    peer_udid: String,
    peer_type: DeviceType,
    envelope: Envelope,
    module: ModuleType,
    pin: Option<String>,
}

impl JoinServer {
    pub(crate) fn new(
        ctx: &SessionContext,
        os: OsAccountId,
        opening: &Value,
    ) -> Result<Self, SessionError> {
        let group_id = message::required_str(opening, fields::GROUP_ID)?;
        let peer_udid = message::required_str(opening, fields::PEER_DEVICE_ID)?;
        let app_id = message::required_str(opening, fields::APP_ID)?;
        let peer_type = sender_type(opening)?;
        let group = ctx.groups.prepare_server_join(os, group_id, peer_udid)?;
        check_declared_type(opening, &group)?;
        let is_lite = is_lite_message(opening);
        let module = bind_module(group.group_type, is_lite, opening)?;
        Ok(Self {
            os,
            app_id: app_id.to_string(),
            peer_udid: peer_udid.to_string(),
            peer_type,
            envelope: envelope(is_lite, false),
            module,
            group,
            pin: None,
        })
    }
}

impl Role for JoinServer {
    fn kind(&self) -> SessionKind {
        SessionKind::ServerBind
    }

    fn module_type(&self) -> ModuleType {
        self.module
    }

    fn envelope(&self) -> Envelope {
        self.envelope
    }

    fn task_params(&self, local: &LocalDevice) -> Result<Value, SessionError> {
        let pin = self
            .pin
            .as_deref()
            .ok_or_else(|| SessionError::InvalidParams("join accepted without a pin".into()))?;
        Ok(TaskParams {
            is_client: false,
            service_type: Some(&self.group.group_id),
            pin_code: Some(pin),
            peer: None,
            is_lite: self.envelope.is_lite(),
        }
        .to_value(local))
    }

    fn first_message_fields(&self, msg: &mut Map<String, Value>) {
        group_fields(msg, &self.group.group_id, self.group.group_type);
        msg.insert(fields::GROUP_NAME.into(), json!(self.group.group_name));
        msg.insert(
            fields::GROUP_VISIBILITY.into(),
            json!(self.group.visibility.as_i32()),
        );
        msg.insert(fields::EXPIRE_TIME.into(), json!(self.group.expire_time));
        msg.insert(fields::GROUP_OWNER.into(), json!(self.group.owner));
    }

    fn confirmation_request(&self) -> Option<Value> {
        Some(json!({
            fields::OPERATION_CODE: OperationCode::MemberJoin.as_i32(),
            fields::APP_ID: self.app_id,
            fields::GROUP_ID: self.group.group_id,
            fields::GROUP_NAME: self.group.group_name,
            fields::GROUP_TYPE: self.group.group_type.as_i32(),
            fields::PEER_DEVICE_ID: self.peer_udid,
            fields::USER_TYPE: self.peer_type.as_i32(),
        }))
    }

    fn accept_confirmation(&mut self, doc: &Value) -> Result<(), SessionError> {
        self.pin = Some(params::required_str(doc, fields::PIN_CODE)?.to_string());
        Ok(())
    }

    fn complete(&mut self, ctx: &SessionContext, own: &Value) -> Result<Completion, SessionError> {
        let peer = peer_record(
            self.os,
            &self.group.group_id,
            &self.peer_udid,
            self.peer_type,
            own,
        );
        let events = ctx.groups.commit_bind(&BindCommit {
            group: self.group.clone(),
            peer,
        })?;
        Ok(Completion {
            events,
            data: json!({
                fields::GROUP_ID: self.group.group_id,
                fields::PEER_DEVICE_ID: self.peer_udid,
            }),
        })
    }
}

/// Removed side of a member removal. Needs no confirmation.
pub(crate) struct UnbindServer {
    group: GroupEntry,
    peer: DeviceEntry,
    envelope: Envelope,
    module: ModuleType,
}

impl UnbindServer {
    pub(crate) fn new(
        ctx: &SessionContext,
        os: OsAccountId,
        opening: &Value,
    ) -> Result<Self, SessionError> {
        let group_id = message::required_str(opening, fields::GROUP_ID)?;
        let peer_udid = message::required_str(opening, fields::PEER_DEVICE_ID)?;
        let (group, peer) = ctx.groups.find_trusted_peer(os, group_id, peer_udid)?;
        check_declared_type(opening, &group)?;
        let is_lite = is_lite_message(opening);
        let module = bind_module(group.group_type, is_lite, opening)?;
        Ok(Self {
            group,
            peer,
            envelope: envelope(is_lite, true),
            module,
        })
    }
}

impl Role for UnbindServer {
    fn kind(&self) -> SessionKind {
        SessionKind::ServerBind
    }

    fn module_type(&self) -> ModuleType {
        self.module
    }

    fn envelope(&self) -> Envelope {
        self.envelope
    }

    fn task_params(&self, local: &LocalDevice) -> Result<Value, SessionError> {
        Ok(TaskParams {
            is_client: false,
            service_type: Some(&self.group.group_id),
            pin_code: None,
            peer: Some((&self.peer.auth_id, self.peer.user_type)),
            is_lite: self.envelope.is_lite(),
        }
        .to_value(local))
    }

    fn first_message_fields(&self, msg: &mut Map<String, Value>) {
        group_fields(msg, &self.group.group_id, self.group.group_type);
    }

    fn complete(&mut self, ctx: &SessionContext, _own: &Value) -> Result<Completion, SessionError> {
        let events = ctx.groups.commit_unbind(&self.group, &self.peer)?;
        Ok(Completion {
            events,
            data: json!({
                fields::GROUP_ID: self.group.group_id,
                fields::DELETE_ID: self.peer.udid,
            }),
        })
    }
}
