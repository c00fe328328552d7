//! The handshake state machine shared by every session variant.
//!
//! ```text
//! Created -> AwaitingChannel -> Exchanging -> Finished        (client)
//! Created -> [AwaitingConfirmation] -> Exchanging -> Finished (server)
//! ```
//!
//! Any state can move to `Failed`. What differs between variants (task
//! parameters, extra message fields, the commit at the end) lives behind the
//! [`Role`] trait, one implementation per variant and side.

use std::sync::Arc;

use bindery_channels::ChannelKind;
use bindery_modules::{ModuleError, ModuleType, TaskId};
use bindery_types::{
    fields, ConfirmDecision, DeviceAuthCallback, DeviceType, LocalDevice, MessageKind,
    OperationCode, RequestId, TrustEvent,
};
use serde_json::{json, Map, Value};

use crate::envelope::Envelope;
use crate::message;
use crate::{Effect, SessionContext, SessionError, SessionEvent, SessionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    AwaitingChannel,
    AwaitingConfirmation,
    Exchanging,
    Finished,
    Failed,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::AwaitingChannel => "awaiting_channel",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Exchanging => "exchanging",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }
}

/// What a finished handshake changed and what to report.
pub(crate) struct Completion {
    pub events: Vec<TrustEvent>,
    pub data: Value,
}

/// Variant-specific behaviour of a session.
pub(crate) trait Role: Send {
    fn kind(&self) -> SessionKind;

    fn module_type(&self) -> ModuleType;

    fn envelope(&self) -> Envelope {
        Envelope::Full
    }

    fn task_params(&self, local: &LocalDevice) -> Result<Value, SessionError>;

    /// Fields added to the first message this side sends.
    fn first_message_fields(&self, _msg: &mut Map<String, Value>) {}

    /// Inspects each inbound message before its payload reaches the task.
    fn read_peer_message(&mut self, _msg: &Value) -> Result<(), SessionError> {
        Ok(())
    }

    /// Document for `on_request`, or `None` when no confirmation is needed.
    fn confirmation_request(&self) -> Option<Value> {
        None
    }

    fn accept_confirmation(&mut self, _doc: &Value) -> Result<(), SessionError> {
        Ok(())
    }

    /// Whether a client finishes locally without talking to the peer.
    fn commits_without_peer(&self) -> bool {
        false
    }

    /// Commits a finished handshake. `own` is the module's self-facing output.
    fn complete(&mut self, ctx: &SessionContext, own: &Value) -> Result<Completion, SessionError>;

    /// Turns a failure into a local success, if the variant allows it.
    fn recover(&mut self, _ctx: &SessionContext, _err: &SessionError) -> Option<Completion> {
        None
    }

    /// Undoes local preparation after an unfinished session.
    fn rollback(&mut self, _ctx: &SessionContext) {}
}

/// Parameters for a module task, filled in from the local device.
#[derive(Debug, Default)]
pub(crate) struct TaskParams<'a> {
    pub is_client: bool,
    pub service_type: Option<&'a str>,
    pub pin_code: Option<&'a str>,
    pub peer: Option<(&'a str, DeviceType)>,
    pub is_lite: bool,
}

impl TaskParams<'_> {
    pub fn to_value(&self, local: &LocalDevice) -> Value {
        let mut params = Map::new();
        params.insert(fields::IS_CLIENT.into(), json!(self.is_client));
        params.insert(fields::AUTH_ID.into(), json!(local.udid));
        params.insert(fields::USER_TYPE.into(), json!(local.user_type.as_i32()));
        params.insert(fields::IS_LITE.into(), json!(self.is_lite));
        if let Some(service_type) = self.service_type {
            params.insert(fields::SERVICE_TYPE.into(), json!(service_type));
        }
        if let Some(pin) = self.pin_code {
            params.insert(fields::PIN_CODE.into(), json!(pin));
        }
        if let Some((auth_id, user_type)) = self.peer {
            params.insert(fields::PEER_AUTH_ID.into(), json!(auth_id));
            params.insert(fields::PEER_USER_TYPE.into(), json!(user_type.as_i32()));
        }
        Value::Object(params)
    }
}

/// One live handshake.
pub struct Session {
    request_id: RequestId,
    app_id: String,
    operation: OperationCode,
    callback: Arc<dyn DeviceAuthCallback>,
    params: Value,
    channel_kind: ChannelKind,
    channel_id: Option<i64>,
    channel_open: bool,
    state: SessionState,
    /// One task per module used so far. Only lite sessions switch modules.
    tasks: Vec<(ModuleType, TaskId)>,
    /// Module the last message went to.
    active: Option<ModuleType>,
    /// Opening message buffered until the server can process it.
    pending: Option<Value>,
    role: Box<dyn Role>,
}

impl Session {
    pub(crate) fn client(
        request_id: RequestId,
        app_id: &str,
        operation: OperationCode,
        callback: Arc<dyn DeviceAuthCallback>,
        params: Value,
        channel_kind: ChannelKind,
        role: Box<dyn Role>,
    ) -> Self {
        Self {
            request_id,
            app_id: app_id.to_string(),
            operation,
            callback,
            params,
            channel_kind,
            channel_id: None,
            channel_open: false,
            state: SessionState::Created,
            tasks: Vec::new(),
            active: None,
            pending: None,
            role,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn server(
        request_id: RequestId,
        app_id: &str,
        operation: OperationCode,
        callback: Arc<dyn DeviceAuthCallback>,
        opening: Value,
        channel_kind: ChannelKind,
        channel_id: i64,
        role: Box<dyn Role>,
    ) -> Self {
        Self {
            request_id,
            app_id: app_id.to_string(),
            operation,
            callback,
            params: Value::Null,
            channel_kind,
            channel_id: Some(channel_id),
            channel_open: true,
            state: SessionState::Created,
            tasks: Vec::new(),
            active: None,
            pending: Some(opening),
            role,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn operation(&self) -> OperationCode {
        self.operation
    }

    pub fn kind(&self) -> SessionKind {
        self.role.kind()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the server is holding the opening message for a decision.
    pub fn is_waiting(&self) -> bool {
        self.state == SessionState::AwaitingConfirmation
    }

    pub fn callback(&self) -> &Arc<dyn DeviceAuthCallback> {
        &self.callback
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn channel_kind(&self) -> ChannelKind {
        self.channel_kind
    }

    pub fn channel_id(&self) -> Option<i64> {
        self.channel_id
    }

    /// Whether messages can be sent to the peer right now.
    pub fn channel_ready(&self) -> bool {
        self.channel_open && self.channel_kind != ChannelKind::None
    }

    /// Records the provisional id of a channel that is still opening.
    pub(crate) fn set_opening_channel(&mut self, channel_id: i64) {
        self.channel_id = Some(channel_id);
    }

    /// The transport closed the channel; nothing may be sent or closed.
    pub(crate) fn mark_channel_closed(&mut self) {
        self.channel_open = false;
        self.channel_id = None;
    }

    pub(crate) fn handle(
        &mut self,
        ctx: &SessionContext,
        event: SessionEvent,
    ) -> Result<Vec<Effect>, SessionError> {
        if let SessionEvent::Message(msg) = &event {
            if let Some(code) = message::peer_error(msg) {
                return Err(SessionError::PeerReported(code));
            }
        }

        match (self.state, event) {
            (SessionState::Created, SessionEvent::Start) => self.start(ctx),
            (SessionState::AwaitingChannel, SessionEvent::ChannelOpened { channel_id }) => {
                self.open_exchange(ctx, channel_id)
            }
            (SessionState::AwaitingConfirmation, SessionEvent::Confirmed(doc)) => {
                self.confirm(ctx, &doc)
            }
            (SessionState::Exchanging, SessionEvent::Message(msg)) => self.advance(ctx, &msg),
            (state, event @ (SessionEvent::ChannelOpened { .. } | SessionEvent::Confirmed(_))) => {
                tracing::warn!(
                    request_id = self.request_id,
                    state = state.label(),
                    event = event.name(),
                    "ignoring stray event"
                );
                Ok(Vec::new())
            }
            (state, event) => Err(SessionError::UnexpectedEvent {
                state: state.label(),
                event: event.name(),
            }),
        }
    }

    fn start(&mut self, ctx: &SessionContext) -> Result<Vec<Effect>, SessionError> {
        if self.kind().is_client() {
            if self.role.commits_without_peer() {
                tracing::info!(
                    request_id = self.request_id,
                    op = self.operation.label(),
                    "committing without a peer handshake"
                );
                self.state = SessionState::Exchanging;
                return Ok(vec![Effect::Complete(Value::Null)]);
            }
            self.state = SessionState::AwaitingChannel;
            return Ok(vec![Effect::OpenChannel]);
        }

        if let Some(request) = self.role.confirmation_request() {
            self.state = SessionState::AwaitingConfirmation;
            return Ok(vec![Effect::RequestConfirmation(request)]);
        }
        self.respond(ctx)
    }

    /// Sender identity fields every first message carries.
    fn identify(&self, local: &LocalDevice, msg: &mut Map<String, Value>) {
        msg.insert(fields::PEER_DEVICE_ID.into(), json!(local.udid));
        msg.insert(fields::USER_TYPE.into(), json!(local.user_type.as_i32()));
        if let Some(conn) = &local.conn_device_id {
            msg.insert(fields::CONN_DEVICE_ID.into(), json!(conn));
        }
    }

    fn stamp(msg: &mut Map<String, Value>, out: &Value) {
        if let Some(version) = out.get(fields::VERSION) {
            msg.insert(fields::VERSION.into(), version.clone());
        }
    }

    /// The task for `module`, created on first use.
    fn task_for(&mut self, ctx: &SessionContext, module: ModuleType) -> Result<TaskId, SessionError> {
        if let Some(&(_, task_id)) = self.tasks.iter().find(|(m, _)| *m == module) {
            self.active = Some(module);
            return Ok(task_id);
        }
        if let Some(previous) = self.active {
            tracing::debug!(
                request_id = self.request_id,
                from = previous.label(),
                to = module.label(),
                "message routed to another module"
            );
        }
        let params = self.role.task_params(ctx.local())?;
        let task_id = ctx.modules.create_task(&params, module)?;
        self.tasks.push((module, task_id));
        self.active = Some(module);
        Ok(task_id)
    }

    fn open_exchange(
        &mut self,
        ctx: &SessionContext,
        channel_id: i64,
    ) -> Result<Vec<Effect>, SessionError> {
        self.channel_id = Some(channel_id);
        self.channel_open = true;

        let module = self.role.module_type();
        let envelope = self.role.envelope();
        let task_id = self.task_for(ctx, module)?;
        let output = ctx.modules.process_task(task_id, &Value::Null, module)?;
        let payload = envelope.to_peer(&output.out).ok_or_else(|| {
            ModuleError::Failed("client task produced no opening payload".into())
        })?;

        let mut msg = message::base(MessageKind::Opening, self.request_id);
        msg.insert(fields::OPERATION_CODE.into(), json!(self.operation.as_i32()));
        msg.insert(fields::APP_ID.into(), json!(self.app_id));
        self.identify(ctx.local(), &mut msg);
        self.role.first_message_fields(&mut msg);
        Self::stamp(&mut msg, &output.out);
        envelope.wrap(&mut msg, payload, module);

        self.state = SessionState::Exchanging;
        tracing::debug!(request_id = self.request_id, channel_id, "opening message ready");
        Ok(vec![Effect::Send(Value::Object(msg))])
    }

    fn confirm(&mut self, ctx: &SessionContext, doc: &Value) -> Result<Vec<Effect>, SessionError> {
        let decision = doc
            .get(fields::CONFIRMATION)
            .and_then(Value::as_i64)
            .and_then(ConfirmDecision::from_i64)
            .ok_or_else(|| SessionError::InvalidParams("missing or unknown confirmation".into()))?;
        match decision {
            ConfirmDecision::Waiting => {
                tracing::debug!(request_id = self.request_id, "confirmation deferred");
                Ok(Vec::new())
            }
            ConfirmDecision::Rejected => Err(SessionError::Rejected),
            ConfirmDecision::Accepted => {
                self.role.accept_confirmation(doc)?;
                self.respond(ctx)
            }
        }
    }

    /// Processes the buffered opening message and answers it.
    fn respond(&mut self, ctx: &SessionContext) -> Result<Vec<Effect>, SessionError> {
        let opening = self.pending.take().ok_or(SessionError::UnexpectedEvent {
            state: self.state.label(),
            event: "respond",
        })?;
        ctx.modules.check_peer_version(&opening)?;

        let envelope = self.role.envelope();
        let module = envelope.module_for(&opening, self.role.module_type())?;
        let task_id = self.task_for(ctx, module)?;
        let input = opening.get(fields::PAYLOAD).cloned().unwrap_or(Value::Null);
        let output = ctx.modules.process_task(task_id, &input, module)?;

        let mut effects = Vec::new();
        if let Some(payload) = envelope.to_peer(&output.out) {
            let mut msg = message::base(MessageKind::Step, self.request_id);
            self.identify(ctx.local(), &mut msg);
            self.role.first_message_fields(&mut msg);
            Self::stamp(&mut msg, &output.out);
            envelope.wrap(&mut msg, payload, module);
            effects.push(Effect::Send(Value::Object(msg)));
        }
        self.state = SessionState::Exchanging;
        if output.is_finished() {
            effects.push(Effect::Complete(envelope.to_self(&output.out)));
        }
        Ok(effects)
    }

    fn advance(&mut self, ctx: &SessionContext, msg: &Value) -> Result<Vec<Effect>, SessionError> {
        ctx.modules.check_peer_version(msg)?;
        let current = self.active.ok_or(SessionError::UnexpectedEvent {
            state: self.state.label(),
            event: "message",
        })?;
        let envelope = self.role.envelope();
        let module = envelope.module_for(msg, current)?;
        self.role.read_peer_message(msg)?;
        let task_id = self.task_for(ctx, module)?;

        let input = msg.get(fields::PAYLOAD).cloned().unwrap_or(Value::Null);
        let output = ctx.modules.process_task(task_id, &input, module)?;
        tracing::debug!(
            request_id = self.request_id,
            finished = output.is_finished(),
            output = %message::redact(&envelope.to_self(&output.out)),
            "task advanced"
        );

        let mut effects = Vec::new();
        if let Some(payload) = envelope.to_peer(&output.out) {
            let mut reply = message::base(MessageKind::Step, self.request_id);
            Self::stamp(&mut reply, &output.out);
            envelope.wrap(&mut reply, payload, module);
            effects.push(Effect::Send(Value::Object(reply)));
        }
        if output.is_finished() {
            effects.push(Effect::Complete(envelope.to_self(&output.out)));
        }
        Ok(effects)
    }

    /// Commits the outcome and lists the effects that report it.
    pub(crate) fn complete(
        &mut self,
        ctx: &SessionContext,
        own: &Value,
    ) -> Result<Vec<Effect>, SessionError> {
        let completion = self.role.complete(ctx, own)?;
        self.state = SessionState::Finished;

        let mut effects: Vec<Effect> = completion.events.into_iter().map(Effect::Trust).collect();
        if let Some(key) = own.get(fields::SESSION_KEY).and_then(Value::as_str) {
            let key = hex::decode(key)
                .map_err(|e| SessionError::Malformed(format!("session key is not hex: {e}")))?;
            effects.push(Effect::SessionKey(key));
        }
        if self.channel_ready() {
            effects.push(Effect::NotifyPeerResult);
        }
        effects.push(Effect::Finish(message::redact(&completion.data)));
        Ok(effects)
    }

    /// Effects reporting a failure the role turned into success, if any.
    pub(crate) fn recover(&mut self, ctx: &SessionContext, err: &SessionError) -> Option<Vec<Effect>> {
        let completion = self.role.recover(ctx, err)?;
        self.state = SessionState::Finished;
        let mut effects: Vec<Effect> = completion.events.into_iter().map(Effect::Trust).collect();
        effects.push(Effect::Finish(message::redact(&completion.data)));
        Some(effects)
    }

    /// Releases every task and the channel, rolling back if unfinished.
    pub(crate) fn release(&mut self, ctx: &SessionContext) {
        for (module, task_id) in self.tasks.drain(..) {
            ctx.modules.destroy_task(task_id, module);
        }
        self.active = None;
        if let Some(channel_id) = self.channel_id.take() {
            ctx.channels.close(self.channel_kind, channel_id);
        }
        self.channel_open = false;
        if self.state != SessionState::Finished {
            self.role.rollback(ctx);
            self.state = SessionState::Failed;
        }
    }
}
