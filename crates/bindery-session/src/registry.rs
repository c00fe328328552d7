//! Session registry and effect driver.
//!
//! The registry is owned by the service worker and is never shared, so it
//! takes `&mut self` everywhere and holds no locks of its own.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bindery_channels::{ChannelError, ChannelKind};
use bindery_groups::module_type_for;
use bindery_modules::{ModuleError, ModuleType};
use bindery_types::{
    fields, DeviceAuthCallback, GroupType, MessageKind, OperationCode, OsAccountId, RequestId,
    DEFAULT_CHANNEL_ID,
};
use serde_json::Value;

use crate::auth::{AuthClient, AuthServer};
use crate::bind::{JoinClient, JoinServer, UnbindClient, UnbindServer};
use crate::envelope::is_lite_message;
use crate::key_agree::{KeyAgreeClient, KeyAgreeServer};
use crate::message;
use crate::session::{Role, Session};
use crate::{Effect, SessionContext, SessionError, SessionEvent, SessionStatus};

/// Who started a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOrigin {
    /// A local application request.
    Client {
        os: OsAccountId,
        app_id: String,
        operation: OperationCode,
    },
    /// A peer's opening message, which is passed as the session params.
    Server {
        os: OsAccountId,
        channel: InboundChannel,
    },
}

/// The channel an inbound message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundChannel {
    pub kind: ChannelKind,
    pub channel_id: i64,
}

impl InboundChannel {
    /// Bytes handed over by an application's `process_data` call.
    pub fn direct() -> Self {
        Self {
            kind: ChannelKind::DirectCallback,
            channel_id: DEFAULT_CHANNEL_ID,
        }
    }

    pub fn proximity(channel_id: i64) -> Self {
        Self {
            kind: ChannelKind::ProximityNetwork,
            channel_id,
        }
    }
}

/// Module an opening message will be processed by.
fn opening_module(opening: &Value) -> ModuleType {
    if is_lite_message(opening) {
        if let Some(module) = opening
            .get(fields::MODULE_TYPE)
            .and_then(Value::as_i64)
            .and_then(|t| i32::try_from(t).ok())
            .and_then(ModuleType::from_i32)
        {
            return module;
        }
    }
    opening
        .get(fields::GROUP_TYPE)
        .and_then(Value::as_i64)
        .and_then(|t| i32::try_from(t).ok())
        .and_then(GroupType::from_i32)
        .map(module_type_for)
        .unwrap_or(ModuleType::Identity)
}

/// Maps request ids to live sessions.
pub struct SessionRegistry {
    ctx: SessionContext,
    sessions: HashMap<RequestId, Session>,
}

impl SessionRegistry {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            sessions: HashMap::new(),
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn session_exists(&self, request_id: RequestId) -> bool {
        self.sessions.contains_key(&request_id)
    }

    pub fn get(&self, request_id: RequestId) -> Option<&Session> {
        self.sessions.get(&request_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn client_role(
        &self,
        os: OsAccountId,
        app_id: &str,
        operation: OperationCode,
        params: &Value,
        channel: ChannelKind,
    ) -> Result<Box<dyn Role>, SessionError> {
        let ctx = &self.ctx;
        Ok(match operation {
            OperationCode::MemberJoin => {
                Box::new(JoinClient::new(ctx, os, app_id, params, channel)?)
            }
            OperationCode::MemberDelete => {
                Box::new(UnbindClient::new(ctx, os, app_id, params, channel)?)
            }
            OperationCode::Authenticate => {
                Box::new(AuthClient::new(ctx, os, app_id, params, channel)?)
            }
            OperationCode::KeyAgreement => Box::new(KeyAgreeClient::new(params, channel)?),
            other => return Err(SessionError::NotSupported(other.label())),
        })
    }

    fn server_role(
        &self,
        os: OsAccountId,
        operation: OperationCode,
        opening: &Value,
    ) -> Result<Box<dyn Role>, SessionError> {
        let ctx = &self.ctx;
        Ok(match operation {
            OperationCode::MemberJoin => Box::new(JoinServer::new(ctx, os, opening)?),
            OperationCode::MemberDelete => Box::new(UnbindServer::new(ctx, os, opening)?),
            OperationCode::Authenticate => Box::new(AuthServer::new(ctx, os, opening)?),
            OperationCode::KeyAgreement => Box::new(KeyAgreeServer::new(opening)?),
            other => return Err(SessionError::NotSupported(other.label())),
        })
    }

    /// Creates a session for `request_id` without starting it.
    ///
    /// Fails if one already exists, if no callback is supplied, or if the
    /// variant rejects `params`. A failed creation leaves no state behind.
    pub fn create_session(
        &mut self,
        request_id: RequestId,
        origin: SessionOrigin,
        params: &Value,
        callback: Option<Arc<dyn DeviceAuthCallback>>,
    ) -> Result<(), SessionError> {
        if self.session_exists(request_id) {
            return Err(SessionError::AlreadyExists(request_id));
        }
        let callback = callback.ok_or(SessionError::NoCallback)?;

        let session = match origin {
            SessionOrigin::Client {
                os,
                app_id,
                operation,
            } => {
                let kind = self
                    .ctx
                    .channels
                    .resolve_channel_kind(Some(callback.as_ref()), params);
                let role = self.client_role(os, &app_id, operation, params, kind)?;
                Session::client(
                    request_id,
                    &app_id,
                    operation,
                    callback,
                    params.clone(),
                    kind,
                    role,
                )
            }
            SessionOrigin::Server { os, channel } => {
                let operation = message::operation(params)
                    .ok_or_else(|| SessionError::Malformed("missing operationCode".into()))?;
                let app_id = message::required_str(params, fields::APP_ID)?.to_string();
                let role = self.server_role(os, operation, params)?;
                if channel.kind == ChannelKind::ProximityNetwork {
                    self.ctx.channels.on_opened(request_id, channel.channel_id);
                }
                Session::server(
                    request_id,
                    &app_id,
                    operation,
                    callback,
                    params.clone(),
                    channel.kind,
                    channel.channel_id,
                    role,
                )
            }
        };

        tracing::info!(
            request_id,
            kind = session.kind().label(),
            op = session.operation().label(),
            channel = session.channel_kind().label(),
            "session created"
        );
        self.sessions.insert(request_id, session);
        Ok(())
    }

    /// Feeds `event` to the session and runs the effects it produces.
    ///
    /// Returns `NotFound` if no session exists. Session failures are handled
    /// here (caller and peer notified, session destroyed) and reported as
    /// [`SessionStatus::ErrorHandled`].
    pub fn process_session(
        &mut self,
        request_id: RequestId,
        event: SessionEvent,
    ) -> Result<SessionStatus, SessionError> {
        if !self.session_exists(request_id) {
            return Err(SessionError::NotFound(request_id));
        }

        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            let Some(session) = self.sessions.get_mut(&request_id) else {
                return Err(SessionError::NotFound(request_id));
            };
            let outcome = match session.handle(&self.ctx, event) {
                Ok(effects) => execute(&self.ctx, session, effects, &mut events),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(false) => {}
                Ok(true) => {
                    self.destroy_session(request_id);
                    return Ok(SessionStatus::Finish);
                }
                Err(err) => {
                    self.fail(request_id, err);
                    return Ok(SessionStatus::ErrorHandled);
                }
            }
        }
        Ok(SessionStatus::Continue)
    }

    /// Routes one decoded inbound message.
    ///
    /// Messages for a live session are fed to it. An opening message for an
    /// unknown request creates a server session, unless the owning module
    /// recognises it as a repeat. Returns `None` when the message was
    /// ignored.
    pub fn handle_inbound(
        &mut self,
        os: OsAccountId,
        msg: Value,
        channel: InboundChannel,
        callback: Option<Arc<dyn DeviceAuthCallback>>,
    ) -> Result<Option<SessionStatus>, SessionError> {
        let request_id = message::request_id(&msg)
            .ok_or_else(|| SessionError::Malformed("missing requestId".into()))?;
        let kind = message::kind(&msg);
        if self.session_exists(request_id) {
            if kind == Some(MessageKind::Opening) {
                tracing::info!(request_id, "ignoring opening message for a live session");
                self.drop_channel(request_id, channel);
                return Ok(None);
            }
            return self
                .process_session(request_id, SessionEvent::Message(msg))
                .map(Some);
        }

        match kind {
            Some(MessageKind::Opening) => {}
            Some(MessageKind::Error) => {
                tracing::debug!(request_id, "error notice for an unknown request");
                return Ok(None);
            }
            _ => {
                tracing::debug!(request_id, "stray message for an unknown request");
                return Ok(None);
            }
        }

        match self.ctx.modules.check_repeatable(&msg, opening_module(&msg)) {
            Ok(()) => {}
            Err(ModuleError::Duplicate) => {
                tracing::info!(request_id, "ignoring repeated opening message");
                self.drop_channel(request_id, channel);
                return Ok(None);
            }
            Err(e) => {
                self.reject_opening(request_id, &msg, channel, callback.as_deref(), &e.into());
                return Ok(Some(SessionStatus::ErrorHandled));
            }
        }

        let origin = SessionOrigin::Server { os, channel };
        if let Err(e) = self.create_session(request_id, origin, &msg, callback.clone()) {
            self.reject_opening(request_id, &msg, channel, callback.as_deref(), &e);
            return Ok(Some(SessionStatus::ErrorHandled));
        }
        self.process_session(request_id, SessionEvent::Start).map(Some)
    }

    /// Reports an opening message that could not start a session.
    fn reject_opening(
        &self,
        request_id: RequestId,
        msg: &Value,
        channel: InboundChannel,
        callback: Option<&dyn DeviceAuthCallback>,
        err: &SessionError,
    ) {
        let code = err.code();
        let app_id = message::str_field(msg, fields::APP_ID).unwrap_or_default();
        tracing::warn!(request_id, error = %err, "rejecting opening message");

        let notice = message::error_notice(request_id, app_id, code);
        if let Err(e) = self.ctx.channels.send(
            channel.kind,
            request_id,
            channel.channel_id,
            callback,
            &message::encode(&notice),
        ) {
            tracing::debug!(request_id, error = %e, "error notice not delivered");
        }
        if let Some(callback) = callback {
            let operation = message::operation(msg).unwrap_or(OperationCode::MemberJoin);
            callback.on_error(request_id, operation, code, None);
        }
        self.drop_channel(request_id, channel);
    }

    /// Closes a proximity channel an unused opening arrived on, unless it
    /// already carries the live session for `request_id`.
    fn drop_channel(&self, request_id: RequestId, channel: InboundChannel) {
        if channel.kind != ChannelKind::ProximityNetwork
            || self.ctx.channels.serves(request_id, channel.channel_id)
        {
            return;
        }
        tracing::debug!(request_id, channel_id = channel.channel_id, "closing unused channel");
        self.ctx.channels.close(channel.kind, channel.channel_id);
    }

    /// Fails the session served by a channel the transport closed.
    pub fn on_channel_closed(&mut self, channel_id: i64) {
        let Some(request_id) = self.ctx.channels.on_closed(channel_id) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(&request_id) else {
            return;
        };
        session.mark_channel_closed();
        self.fail(request_id, SessionError::ChannelClosed);
    }

    /// Destroys a session, releasing its task and channel. Idempotent.
    pub fn destroy_session(&mut self, request_id: RequestId) {
        if let Some(mut session) = self.sessions.remove(&request_id) {
            session.release(&self.ctx);
            tracing::debug!(request_id, "session destroyed");
        }
    }

    /// Destroys every live session. Used at shutdown.
    pub fn destroy_all(&mut self) {
        let ids: Vec<RequestId> = self.sessions.keys().copied().collect();
        for request_id in ids {
            self.destroy_session(request_id);
        }
    }

    fn fail(&mut self, request_id: RequestId, err: SessionError) {
        let Some(mut session) = self.sessions.remove(&request_id) else {
            return;
        };
        let code = err.code();
        tracing::warn!(
            request_id,
            kind = session.kind().label(),
            op = session.operation().label(),
            code = code.as_i32(),
            error = %err,
            "session failed"
        );

        if !err.suppresses_notice() && session.channel_ready() {
            let notice = message::error_notice(request_id, session.app_id(), code);
            let sent = self.ctx.channels.send(
                session.channel_kind(),
                request_id,
                session.channel_id().unwrap_or(DEFAULT_CHANNEL_ID),
                Some(session.callback().as_ref()),
                &message::encode(&notice),
            );
            if let Err(e) = sent {
                tracing::debug!(request_id, error = %e, "error notice not delivered");
            }
        }

        match session.recover(&self.ctx, &err) {
            Some(effects) => {
                let mut ignored = VecDeque::new();
                if let Err(e) = execute(&self.ctx, &mut session, effects, &mut ignored) {
                    tracing::error!(request_id, error = %e, "reporting recovered session failed");
                    session
                        .callback()
                        .on_error(request_id, session.operation(), e.code(), None);
                }
            }
            None => session
                .callback()
                .on_error(request_id, session.operation(), code, None),
        }
        session.release(&self.ctx);
    }
}

/// Carries out `effects` in order. Returns true once the session finished.
fn execute(
    ctx: &SessionContext,
    session: &mut Session,
    effects: Vec<Effect>,
    events: &mut VecDeque<SessionEvent>,
) -> Result<bool, SessionError> {
    let request_id = session.request_id();
    let mut work: VecDeque<Effect> = effects.into();

    while let Some(effect) = work.pop_front() {
        let channel_id = session.channel_id().unwrap_or(DEFAULT_CHANNEL_ID);
        match effect {
            Effect::OpenChannel => {
                let kind = session.channel_kind();
                let opened = ctx.channels.open(kind, session.params(), request_id)?;
                if kind.opens_immediately() {
                    events.push_back(SessionEvent::ChannelOpened { channel_id: opened });
                } else {
                    session.set_opening_channel(opened);
                }
            }
            Effect::Send(msg) => {
                if !session.channel_ready() {
                    return Err(ChannelError::NoChannel.into());
                }
                ctx.channels.send(
                    session.channel_kind(),
                    request_id,
                    channel_id,
                    Some(session.callback().as_ref()),
                    &message::encode(&msg),
                )?;
            }
            Effect::RequestConfirmation(request) => {
                let answer = session.callback().on_request(
                    request_id,
                    session.operation(),
                    &request.to_string(),
                );
                if let Some(answer) = answer {
                    let doc: Value = serde_json::from_str(&answer).map_err(|e| {
                        SessionError::InvalidParams(format!("confirmation is not JSON: {e}"))
                    })?;
                    events.push_back(SessionEvent::Confirmed(doc));
                } else {
                    tracing::debug!(request_id, "waiting for confirmation");
                }
            }
            Effect::Complete(own) => {
                let more = session.complete(ctx, &own)?;
                work.extend(more);
            }
            Effect::SessionKey(key) => session
                .callback()
                .on_session_key_returned(request_id, &key),
            Effect::Trust(event) => {
                tracing::debug!(request_id, event = event.name(), "trust change");
                event.deliver(ctx.listener.as_ref());
            }
            Effect::NotifyPeerResult => ctx
                .channels
                .notify_peer_result(session.channel_kind(), channel_id),
            Effect::Finish(data) => {
                tracing::info!(request_id, op = session.operation().label(), "session finished");
                session
                    .callback()
                    .on_finish(request_id, session.operation(), &data.to_string());
                return Ok(true);
            }
        }
    }
    Ok(false)
}
