use bindery_channels::{ChannelError, ChannelKind};
use bindery_db::GroupEntry;
use bindery_groups::{params, BindCommit, JoinPlan, UnbindPlan};
use bindery_modules::ModuleType;
use bindery_types::{
    fields, DeviceType, GroupVisibility, LocalDevice, OsAccountId, EXPIRE_NEVER,
};
use serde_json::{json, Map, Value};

use super::{bind_module, envelope, group_fields, peer_record, sender_type};
use crate::envelope::Envelope;
use crate::session::{Completion, Role, TaskParams};
use crate::{SessionContext, SessionError, SessionKind};

/// Requesting side of a join.
pub(crate) struct JoinClient {
    os: OsAccountId,
    app_id: String,
    plan: JoinPlan,
    pin: String,
    envelope: Envelope,
    module: ModuleType,
    /// Group whose local key this session registered, until it commits.
    registered_key: Option<GroupEntry>,
    /// The group as the owning side described it.
    learned_group: Option<GroupEntry>,
    peer: Option<(String, DeviceType)>,
}

impl JoinClient {
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
        let plan = ctx.groups.prepare_join(os, request)?;
        let pin = params::required_str(request, fields::PIN_CODE)?.to_string();
        let is_lite = params::optional_bool(request, fields::IS_LITE);
        let module = bind_module(plan.group_type, is_lite, request)?;

        let mut registered_key = None;
        if !plan.group_exists {
            // A new group needs a fresh local identity before the exchange.
            let placeholder =
                GroupEntry::new(os, plan.group_id.as_str(), "", plan.group_type, app_id);
            ctx.groups.register_local_key(&placeholder)?;
            registered_key = Some(placeholder);
        }

        Ok(Self {
            os,
            app_id: app_id.to_string(),
            plan,
            pin,
            envelope: envelope(is_lite, false),
            module,
            registered_key,
            learned_group: None,
            peer: None,
        })
    }

    fn learn_group(&self, msg: &Value) -> GroupEntry {
        let name = msg
            .get(fields::GROUP_NAME)
            .and_then(Value::as_str)
            .unwrap_or(&self.plan.group_id);
        if let Some(peer_owner) = msg.get(fields::GROUP_OWNER).and_then(Value::as_str) {
            tracing::debug!(group_id = %self.plan.group_id, peer_owner, "owner on the peer device");
        }
        // The local record belongs to the app that asked to join.
        let mut group = GroupEntry::new(
            self.os,
            self.plan.group_id.as_str(),
            name,
            self.plan.group_type,
            self.app_id.as_str(),
        );
        group.visibility = msg
            .get(fields::GROUP_VISIBILITY)
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
            .and_then(GroupVisibility::from_i32)
            .unwrap_or(GroupVisibility::Public);
        group.expire_time = msg
            .get(fields::EXPIRE_TIME)
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(EXPIRE_NEVER);
        group
    }
}

impl Role for JoinClient {
    fn kind(&self) -> SessionKind {
        SessionKind::ClientBind
    }

    fn module_type(&self) -> ModuleType {
        self.module
    }

    fn envelope(&self) -> Envelope {
        self.envelope
    }

    fn task_params(&self, local: &LocalDevice) -> Result<Value, SessionError> {
        Ok(TaskParams {
            is_client: true,
            service_type: Some(&self.plan.group_id),
            pin_code: Some(&self.pin),
            peer: None,
            is_lite: self.envelope.is_lite(),
        }
        .to_value(local))
    }

    fn first_message_fields(&self, msg: &mut Map<String, Value>) {
        group_fields(msg, &self.plan.group_id, self.plan.group_type);
    }

    fn read_peer_message(&mut self, msg: &Value) -> Result<(), SessionError> {
        if self.peer.is_some() {
            return Ok(());
        }
        if let Some(group_id) = msg.get(fields::GROUP_ID).and_then(Value::as_str) {
            if group_id != self.plan.group_id {
                return Err(SessionError::Malformed(format!(
                    "response names group {group_id}"
                )));
            }
        }
        let udid = crate::message::required_str(msg, fields::PEER_DEVICE_ID)?;
        self.peer = Some((udid.to_string(), sender_type(msg)?));
        if !self.plan.group_exists {
            self.learned_group = Some(self.learn_group(msg));
        }
        Ok(())
    }

    fn complete(&mut self, ctx: &SessionContext, own: &Value) -> Result<Completion, SessionError> {
        let (udid, user_type) = self
            .peer
            .clone()
            .ok_or_else(|| SessionError::Malformed("owner never identified itself".into()))?;
        let group = self.learned_group.clone().unwrap_or_else(|| {
            GroupEntry::new(
                self.os,
                self.plan.group_id.as_str(),
                self.plan.group_id.as_str(),
                self.plan.group_type,
                self.app_id.as_str(),
            )
        });
        let peer = peer_record(self.os, &self.plan.group_id, &udid, user_type, own);
        let events = ctx.groups.commit_bind(&BindCommit { group, peer })?;
        self.registered_key = None;
        Ok(Completion {
            events,
            data: json!({
                fields::GROUP_ID: self.plan.group_id,
                fields::PEER_DEVICE_ID: udid,
            }),
        })
    }

    fn rollback(&mut self, ctx: &SessionContext) {
        if let Some(group) = self.registered_key.take() {
            tracing::info!(group_id = %group.group_id, "rolling back local key of failed join");
            ctx.groups.unregister_local_key(&group);
        }
    }
}

/// Requesting side of a member removal.
pub(crate) struct UnbindClient {
    plan: UnbindPlan,
    envelope: Envelope,
    module: ModuleType,
    local_only: bool,
    committed: bool,
}

impl UnbindClient {
    pub(crate) fn new(
        ctx: &SessionContext,
        os: OsAccountId,
        app_id: &str,
        request: &Value,
        channel: ChannelKind,
    ) -> Result<Self, SessionError> {
        let plan = ctx.groups.prepare_unbind(os, app_id, request)?;
        let local_only = plan.ignore_channel || channel == ChannelKind::None;
        if local_only && !plan.is_force {
            return Err(ChannelError::NoChannel.into());
        }
        let is_lite = params::optional_bool(request, fields::IS_LITE);
        let module = bind_module(plan.group.group_type, is_lite, request)?;
        Ok(Self {
            plan,
            envelope: envelope(is_lite, true),
            module,
            local_only,
            committed: false,
        })
    }

    fn commit(&mut self, ctx: &SessionContext) -> Result<Completion, SessionError> {
        let events = ctx.groups.commit_unbind(&self.plan.group, &self.plan.peer)?;
        self.committed = true;
        Ok(Completion {
            events,
            data: json!({
                fields::GROUP_ID: self.plan.group.group_id,
                fields::DELETE_ID: self.plan.peer.udid,
            }),
        })
    }
}

impl Role for UnbindClient {
    fn kind(&self) -> SessionKind {
        SessionKind::ClientBind
    }

    fn module_type(&self) -> ModuleType {
        self.module
    }

    fn envelope(&self) -> Envelope {
        self.envelope
    }

    fn task_params(&self, local: &LocalDevice) -> Result<Value, SessionError> {
        Ok(TaskParams {
            is_client: true,
            service_type: Some(&self.plan.group.group_id),
            pin_code: None,
            peer: Some((&self.plan.peer.auth_id, self.plan.peer.user_type)),
            is_lite: self.envelope.is_lite(),
        }
        .to_value(local))
    }

    fn first_message_fields(&self, msg: &mut Map<String, Value>) {
        group_fields(msg, &self.plan.group.group_id, self.plan.group.group_type);
    }

    fn commits_without_peer(&self) -> bool {
        self.local_only
    }

    fn complete(&mut self, ctx: &SessionContext, _own: &Value) -> Result<Completion, SessionError> {
        self.commit(ctx)
    }

    fn recover(&mut self, ctx: &SessionContext, err: &SessionError) -> Option<Completion> {
        if !self.plan.is_force || self.committed {
            return None;
        }
        match self.commit(ctx) {
            Ok(completion) => {
                tracing::warn!(
                    group_id = %self.plan.group.group_id,
                    peer = %self.plan.peer.udid,
                    error = %err,
                    "forced unbind committed locally after handshake failure"
                );
                Some(completion)
            }
            Err(e) => {
                tracing::error!(group_id = %self.plan.group.group_id, error = %e, "forced unbind could not commit");
                None
            }
        }
    }
}
