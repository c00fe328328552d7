//! Public entry points.
//!
//! Anything that creates, drives, or destroys a session, and every trust
//! store mutation, runs on the worker. Entry points reject malformed input
//! before enqueueing, so a synchronous error always means nothing was
//! queued. Read-only queries bypass the worker and go straight to the
//! group layer.
//!
//! Operations that run a handshake (`add_member`, `delete_member`,
//! `auth_device`, `agree_key`) return once the session has been created and
//! started. Their outcome arrives later through the app's callback.

use std::sync::Arc;

use bindery_channels::ChannelKind;
use bindery_db::GroupQuery;
use bindery_groups::{GroupError, GroupManager};
use bindery_session::{
    message, InboundChannel, SessionError, SessionEvent, SessionOrigin, SessionStatus,
};
use bindery_types::{
    fields, GroupType, MessageKind, OperationCode, OsAccountId, RequestId, TrustEvent,
};
use serde_json::{json, Value};

use crate::error::parse_params;
use crate::worker::Worker;
use crate::{DeviceAuthService, ServiceError};

fn check_app_id(app_id: &str) -> Result<(), ServiceError> {
    if app_id.trim().is_empty() {
        return Err(ServiceError::InvalidParams("appId must not be empty".into()));
    }
    Ok(())
}

fn deliver(worker: &Worker, events: &[TrustEvent]) {
    let listener = worker.registry.context().listener.as_ref();
    for event in events {
        tracing::debug!(event = event.name(), "trust change");
        event.deliver(listener);
    }
}

/// Decodes inbound bytes, requiring a request id.
fn decode_inbound(data: &[u8]) -> Result<(RequestId, Value), ServiceError> {
    let msg = message::decode(data)?;
    let request_id = message::request_id(&msg)
        .ok_or_else(|| ServiceError::InvalidParams("message has no requestId".into()))?;
    Ok((request_id, msg))
}

fn log_inbound(request_id: RequestId, outcome: Result<Option<SessionStatus>, SessionError>) {
    match outcome {
        Ok(Some(status)) => tracing::debug!(request_id, ?status, "inbound message handled"),
        Ok(None) => {}
        Err(e) => tracing::warn!(request_id, error = %e, "inbound message dropped"),
    }
}

impl DeviceAuthService {
    /// Creates a group owned by `app_id` and returns its id.
    ///
    /// The app's callback, if registered, also receives `on_finish` with
    /// `{"groupId": ...}`.
    pub async fn create_group(
        &self,
        os: OsAccountId,
        request_id: RequestId,
        app_id: &str,
        params: &str,
    ) -> Result<String, ServiceError> {
        check_app_id(app_id)?;
        let params = parse_params(params)?;
        let os = self.os_account(os);
        let app_id = app_id.to_string();
        let groups = Arc::clone(&self.groups);

        let group_id = self
            .worker
            .call(move |w| -> Result<String, ServiceError> {
                let (group_id, events) = groups.create_group(os, &app_id, &params)?;
                deliver(w, &events);
                if let Some(callback) = w.callbacks.get(&app_id) {
                    let data = json!({ fields::GROUP_ID: group_id });
                    callback.on_finish(request_id, OperationCode::GroupCreate, &data.to_string());
                }
                Ok(group_id)
            })
            .await??;
        Ok(group_id)
    }

    /// Deletes a group. Owner or manager only.
    pub async fn delete_group(
        &self,
        os: OsAccountId,
        request_id: RequestId,
        app_id: &str,
        params: &str,
    ) -> Result<(), ServiceError> {
        check_app_id(app_id)?;
        let params = parse_params(params)?;
        let os = self.os_account(os);
        let app_id = app_id.to_string();
        let groups = Arc::clone(&self.groups);

        self.worker
            .call(move |w| -> Result<(), ServiceError> {
                let events = groups.delete_group(os, &app_id, &params)?;
                deliver(w, &events);
                if let Some(callback) = w.callbacks.get(&app_id) {
                    let data = json!({ fields::GROUP_ID: params.get(fields::GROUP_ID) });
                    callback.on_finish(request_id, OperationCode::GroupDisband, &data.to_string());
                }
                Ok(())
            })
            .await??;
        Ok(())
    }

    /// Creates and starts a client session.
    async fn start_session(
        &self,
        os: OsAccountId,
        request_id: RequestId,
        app_id: &str,
        operation: OperationCode,
        params: &str,
    ) -> Result<(), ServiceError> {
        check_app_id(app_id)?;
        let params = parse_params(params)?;
        let os = self.os_account(os);
        let app_id = app_id.to_string();

        self.worker
            .call(move |w| -> Result<(), SessionError> {
                let callback = w.callbacks.get(&app_id);
                let origin = SessionOrigin::Client {
                    os,
                    app_id,
                    operation,
                };
                w.registry.create_session(request_id, origin, &params, callback)?;
                w.registry.process_session(request_id, SessionEvent::Start)?;
                Ok(())
            })
            .await??;
        Ok(())
    }

    /// Joins the peer's group. The local device is the client.
    pub async fn add_member(
        &self,
        os: OsAccountId,
        request_id: RequestId,
        app_id: &str,
        params: &str,
    ) -> Result<(), ServiceError> {
        self.start_session(os, request_id, app_id, OperationCode::MemberJoin, params)
            .await
    }

    /// Removes `deleteId` from a group, telling the peer when a channel is
    /// available.
    pub async fn delete_member(
        &self,
        os: OsAccountId,
        request_id: RequestId,
        app_id: &str,
        params: &str,
    ) -> Result<(), ServiceError> {
        self.start_session(os, request_id, app_id, OperationCode::MemberDelete, params)
            .await
    }

    /// Authenticates an already trusted peer and returns a session key.
    pub async fn auth_device(
        &self,
        os: OsAccountId,
        request_id: RequestId,
        app_id: &str,
        params: &str,
    ) -> Result<(), ServiceError> {
        self.start_session(os, request_id, app_id, OperationCode::Authenticate, params)
            .await
    }

    /// Agrees a session key from a shared pin. No group is involved.
    pub async fn agree_key(
        &self,
        os: OsAccountId,
        request_id: RequestId,
        app_id: &str,
        params: &str,
    ) -> Result<(), ServiceError> {
        self.start_session(os, request_id, app_id, OperationCode::KeyAgreement, params)
            .await
    }

    /// Hands bytes received out of band for `app_id` to the worker.
    ///
    /// Fails synchronously only if the bytes do not decode or the queue is
    /// unavailable; routing problems are logged on the worker.
    pub fn process_data(
        &self,
        request_id: RequestId,
        app_id: &str,
        data: &[u8],
    ) -> Result<(), ServiceError> {
        check_app_id(app_id)?;
        let (msg_request_id, msg) = decode_inbound(data)?;
        if msg_request_id != request_id {
            tracing::warn!(
                request_id,
                msg_request_id,
                "requestId in the message differs from the caller's"
            );
        }
        let app_id = app_id.to_string();

        self.worker.post(move |w| {
            let callback = w.callbacks.get(&app_id);
            let os = w.os_account(-1);
            let outcome = w.registry.handle_inbound(os, msg, InboundChannel::direct(), callback);
            log_inbound(msg_request_id, outcome);
        })
    }

    /// Answers a confirmation request previously raised through
    /// `on_request` that returned no decision.
    pub fn confirm_request(
        &self,
        os: OsAccountId,
        request_id: RequestId,
        app_id: &str,
        params: &str,
    ) -> Result<(), ServiceError> {
        check_app_id(app_id)?;
        let doc = parse_params(params)?;
        let os = self.os_account(os);
        let app_id = app_id.to_string();

        self.worker.post(move |w| {
            match w.registry.get(request_id) {
                None => {
                    tracing::warn!(request_id, os, "confirmation for an unknown request");
                    return;
                }
                Some(session) if session.app_id() != app_id => {
                    tracing::warn!(
                        request_id,
                        app_id = %app_id,
                        "confirmation from an app that does not own the request"
                    );
                    return;
                }
                Some(_) => {}
            }
            match w.registry.process_session(request_id, SessionEvent::Confirmed(doc)) {
                Ok(status) => tracing::debug!(request_id, ?status, "confirmation handled"),
                Err(e) => tracing::warn!(request_id, error = %e, "confirmation dropped"),
            }
        })
    }

    /// Destroys a session without notifying anyone. Idempotent.
    pub async fn destroy_session(&self, request_id: RequestId) -> Result<(), ServiceError> {
        self.worker
            .call(move |w| w.registry.destroy_session(request_id))
            .await
    }

    pub async fn session_exists(&self, request_id: RequestId) -> Result<bool, ServiceError> {
        self.worker
            .call(move |w| w.registry.session_exists(request_id))
            .await
    }

    pub async fn live_sessions(&self) -> Result<usize, ServiceError> {
        self.worker.call(|w| w.registry.len()).await
    }

    /// The proximity transport finished opening `channel_id` for
    /// `request_id`.
    pub fn on_channel_opened(&self, request_id: RequestId, channel_id: i64) -> Result<(), ServiceError> {
        self.worker.post(move |w| {
            let channels = Arc::clone(&w.registry.context().channels);
            if !w.registry.session_exists(request_id) {
                tracing::warn!(request_id, channel_id, "channel opened for an unknown request");
                channels.close(ChannelKind::ProximityNetwork, channel_id);
                return;
            }
            channels.on_opened(request_id, channel_id);
            match w
                .registry
                .process_session(request_id, SessionEvent::ChannelOpened { channel_id })
            {
                Ok(status) => tracing::debug!(request_id, ?status, "channel open handled"),
                Err(e) => tracing::warn!(request_id, error = %e, "channel open dropped"),
            }
        })
    }

    /// The proximity transport closed `channel_id`.
    pub fn on_channel_closed(&self, channel_id: i64) -> Result<(), ServiceError> {
        self.worker.post(move |w| w.registry.on_channel_closed(channel_id))
    }

    /// Bytes arrived on proximity channel `channel_id`.
    pub fn on_channel_data(&self, channel_id: i64, data: &[u8]) -> Result<(), ServiceError> {
        let (request_id, msg) = decode_inbound(data)?;

        self.worker.post(move |w| {
            let channels = &w.registry.context().channels;
            if let Some(bound) = channels.request_for_channel(channel_id) {
                if bound != request_id {
                    tracing::warn!(channel_id, bound, request_id, "message for another request on this channel");
                    return;
                }
            }
            // Only an opening may arrive on a channel no request owns yet.
            let opening = message::kind(&msg) == Some(MessageKind::Opening);
            if !opening && !channels.serves(request_id, channel_id) {
                tracing::warn!(channel_id, request_id, "message off its request's channel");
                return;
            }
            let callback = message::str_field(&msg, fields::APP_ID)
                .and_then(|app_id| w.callbacks.get(app_id));
            let os = w.os_account(-1);
            let outcome = w.registry.handle_inbound(
                os,
                msg,
                InboundChannel::proximity(channel_id),
                callback,
            );
            log_inbound(request_id, outcome);
        })
    }

    async fn mutate_groups<R, F>(&self, f: F) -> Result<R, ServiceError>
    where
        F: FnOnce(&GroupManager) -> Result<R, GroupError> + Send + 'static,
        R: Send + 'static,
    {
        let groups = Arc::clone(&self.groups);
        Ok(self.worker.call(move |_| f(&groups)).await??)
    }

    /// Owner only.
    pub async fn add_group_manager(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
        manager_app_id: &str,
    ) -> Result<(), ServiceError> {
        let (os, app_id, group_id, target) = (
            self.os_account(os),
            app_id.to_string(),
            group_id.to_string(),
            manager_app_id.to_string(),
        );
        self.mutate_groups(move |g| g.add_group_manager(os, &app_id, &group_id, &target))
            .await
    }

    /// Owner only.
    pub async fn delete_group_manager(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
        manager_app_id: &str,
    ) -> Result<(), ServiceError> {
        let (os, app_id, group_id, target) = (
            self.os_account(os),
            app_id.to_string(),
            group_id.to_string(),
            manager_app_id.to_string(),
        );
        self.mutate_groups(move |g| g.delete_group_manager(os, &app_id, &group_id, &target))
            .await
    }

    /// Owner or manager.
    pub async fn add_group_friend(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
        friend_app_id: &str,
    ) -> Result<(), ServiceError> {
        let (os, app_id, group_id, target) = (
            self.os_account(os),
            app_id.to_string(),
            group_id.to_string(),
            friend_app_id.to_string(),
        );
        self.mutate_groups(move |g| g.add_group_friend(os, &app_id, &group_id, &target))
            .await
    }

    /// Owner or manager.
    pub async fn delete_group_friend(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
        friend_app_id: &str,
    ) -> Result<(), ServiceError> {
        let (os, app_id, group_id, target) = (
            self.os_account(os),
            app_id.to_string(),
            group_id.to_string(),
            friend_app_id.to_string(),
        );
        self.mutate_groups(move |g| g.delete_group_friend(os, &app_id, &group_id, &target))
            .await
    }

    pub fn get_group_managers(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
    ) -> Result<Vec<String>, ServiceError> {
        Ok(self.groups.get_group_managers(self.os_account(os), app_id, group_id)?)
    }

    pub fn get_group_friends(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
    ) -> Result<Vec<String>, ServiceError> {
        Ok(self.groups.get_group_friends(self.os_account(os), app_id, group_id)?)
    }

    pub fn check_access_to_group(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
    ) -> Result<bool, ServiceError> {
        Ok(self.groups.check_access_to_group(self.os_account(os), app_id, group_id)?)
    }

    pub fn get_group_info_by_id(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
    ) -> Result<Value, ServiceError> {
        Ok(self.groups.get_group_info_by_id(self.os_account(os), app_id, group_id)?)
    }

    pub fn get_group_info(
        &self,
        os: OsAccountId,
        app_id: &str,
        query: &GroupQuery,
    ) -> Result<Vec<Value>, ServiceError> {
        Ok(self.groups.get_group_info(self.os_account(os), app_id, query)?)
    }

    pub fn get_joined_groups(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_type: GroupType,
    ) -> Result<Vec<Value>, ServiceError> {
        Ok(self.groups.get_joined_groups(self.os_account(os), app_id, group_type)?)
    }

    pub fn get_related_groups(
        &self,
        os: OsAccountId,
        app_id: &str,
        peer_udid: &str,
    ) -> Result<Vec<Value>, ServiceError> {
        Ok(self.groups.get_related_groups(self.os_account(os), app_id, peer_udid)?)
    }

    pub fn get_device_info_by_id(
        &self,
        os: OsAccountId,
        app_id: &str,
        peer_udid: &str,
        group_id: &str,
    ) -> Result<Value, ServiceError> {
        Ok(self
            .groups
            .get_device_info_by_id(self.os_account(os), app_id, peer_udid, group_id)?)
    }

    pub fn get_trusted_devices(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
    ) -> Result<Vec<Value>, ServiceError> {
        Ok(self.groups.get_trusted_devices(self.os_account(os), app_id, group_id)?)
    }

    pub fn is_device_in_group(
        &self,
        os: OsAccountId,
        app_id: &str,
        group_id: &str,
        udid: &str,
    ) -> Result<bool, ServiceError> {
        Ok(self
            .groups
            .is_device_in_group(self.os_account(os), app_id, group_id, udid)?)
    }
}
