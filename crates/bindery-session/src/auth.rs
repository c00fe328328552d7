//! Authentication of an already trusted peer. Produces a session key and
//! changes no trust records.

use bindery_channels::{ChannelError, ChannelKind};
use bindery_db::{DeviceEntry, GroupEntry};
use bindery_groups::{module_type_for, params};
use bindery_modules::ModuleType;
use bindery_types::{fields, LocalDevice, OsAccountId};
use serde_json::{json, Map, Value};

use crate::message;
use crate::session::{Completion, Role, TaskParams};
use crate::{SessionContext, SessionError, SessionKind};

fn task_params(
    local: &LocalDevice,
    is_client: bool,
    group: &GroupEntry,
    peer: &DeviceEntry,
) -> Value {
    TaskParams {
        is_client,
        service_type: Some(&group.group_id),
        pin_code: None,
        peer: Some((&peer.auth_id, peer.user_type)),
        is_lite: false,
    }
    .to_value(local)
}

fn completion(group: &GroupEntry, peer: &DeviceEntry) -> Completion {
    Completion {
        events: Vec::new(),
        data: json!({
            fields::GROUP_ID: group.group_id,
            fields::PEER_UDID: peer.udid,
        }),
    }
}

pub(crate) struct AuthClient {
    group: GroupEntry,
    peer: DeviceEntry,
}

impl AuthClient {
    pub(crate) fn new(
        ctx: &SessionContext,
        os: OsAccountId,
        app_id: &str,
        request: &Value,
        channel: ChannelKind,
    ) -> Result<Self, SessionError> {
        if channel == ChannelKind::None {
            return Err(ChannelError::NoChannel.into());
        }
        let peer_udid = params::required_str(request, fields::PEER_UDID)?;
        let group_id = params::optional_str(request, fields::GROUP_ID);
        let (group, peer) = ctx.groups.prepare_auth(os, app_id, peer_udid, group_id)?;
        Ok(Self { group, peer })
    }
}

impl Role for AuthClient {
    fn kind(&self) -> SessionKind {
        SessionKind::ClientAuth
    }

    fn module_type(&self) -> ModuleType {
        module_type_for(self.group.group_type)
    }

    fn task_params(&self, local: &LocalDevice) -> Result<Value, SessionError> {
        Ok(task_params(local, true, &self.group, &self.peer))
    }

    fn first_message_fields(&self, msg: &mut Map<String, Value>) {
        msg.insert(fields::GROUP_ID.into(), json!(self.group.group_id));
        msg.insert(fields::GROUP_TYPE.into(), json!(self.group.group_type.as_i32()));
    }

    fn complete(&mut self, _ctx: &SessionContext, _own: &Value) -> Result<Completion, SessionError> {
        Ok(completion(&self.group, &self.peer))
    }
}

pub(crate) struct AuthServer {
    group: GroupEntry,
    peer: DeviceEntry,
}

impl AuthServer {
    pub(crate) fn new(
        ctx: &SessionContext,
        os: OsAccountId,
        opening: &Value,
    ) -> Result<Self, SessionError> {
        let group_id = message::required_str(opening, fields::GROUP_ID)?;
        let peer_udid = message::required_str(opening, fields::PEER_DEVICE_ID)?;
        let (group, peer) = ctx.groups.find_trusted_peer(os, group_id, peer_udid)?;
        Ok(Self { group, peer })
    }
}

impl Role for AuthServer {
    fn kind(&self) -> SessionKind {
        SessionKind::ServerAuth
    }

    fn module_type(&self) -> ModuleType {
        module_type_for(self.group.group_type)
    }

    fn task_params(&self, local: &LocalDevice) -> Result<Value, SessionError> {
        Ok(task_params(local, false, &self.group, &self.peer))
    }

    fn complete(&mut self, _ctx: &SessionContext, _own: &Value) -> Result<Completion, SessionError> {
        Ok(completion(&self.group, &self.peer))
    }
}
