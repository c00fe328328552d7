//! Reference authenticator module.
//!
//! Runs a three-message exchange bound to a shared secret:
//!
//! 1. client -> server: client nonce, client identity
//! 2. server -> client: server nonce, server identity, server proof
//! 3. client -> server: client proof
//!
//! Proofs and the session key are SHA-256 digests over a label, the secret,
//! and both nonces. The secret is the pin code when the task carries one;
//! otherwise it is a digest of both parties' stored identity keys, which the
//! module records for each peer at the end of a pin-based exchange.
//!
//! Keys here are random bytes that double as their own "public" half. This
//! module demonstrates the task contract; it is not a cryptographic protocol.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use bindery_types::{fields, DeviceType};
use lru::LruCache;
use rand::RngCore;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::{
    AuthModule, IdentityParams, ModuleError, ModuleType, TaskId, TaskOutput, TaskStatus,
    GROUP_KEY_PACKAGE,
};

const STEP: &str = "step";
const NONCE: &str = "nonce";
const PROOF: &str = "proof";
const PUBLIC_KEY: &str = "publicKey";

const NONCE_LEN: usize = 16;
const KEY_LEN: usize = 32;
const DEFAULT_NONCE_CACHE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    ClientStart,
    ClientSentOpening,
    ServerAwaitOpening,
    ServerSentResponse,
    Done,
}

#[derive(Debug)]
struct Task {
    stage: Stage,
    is_lite: bool,
    pin: Option<String>,
    pkg_name: String,
    service_type: Option<String>,
    self_auth_id: String,
    self_user_type: i32,
    peer_auth_id: Option<String>,
    peer_user_type: Option<i32>,
    secret: Option<Vec<u8>>,
    own_nonce: String,
    peer_nonce: String,
}

#[derive(Default)]
struct KeyStore {
    local: HashMap<String, Vec<u8>>,
    peers: HashMap<String, Vec<u8>>,
}

/// Reference implementation of [`AuthModule`].
pub struct ReferenceModule {
    module_type: ModuleType,
    next_task: AtomicI32,
    tasks: Mutex<HashMap<TaskId, Task>>,
    keys: Mutex<KeyStore>,
    consumed_nonces: Mutex<LruCache<String, ()>>,
}

impl ReferenceModule {
    pub fn new(module_type: ModuleType) -> Self {
        Self::with_nonce_cache(module_type, DEFAULT_NONCE_CACHE)
    }

    /// Creates a module remembering at most `capacity` consumed openings.
    pub fn with_nonce_cache(module_type: ModuleType, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            module_type,
            next_task: AtomicI32::new(1),
            tasks: Mutex::new(HashMap::new()),
            keys: Mutex::new(KeyStore::default()),
            consumed_nonces: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of live tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether a peer key is stored under `alias`.
    pub fn has_peer_key(&self, alias: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .contains_key(alias)
    }

    /// Whether a local key is stored under `alias`.
    pub fn has_local_key(&self, alias: &str) -> bool {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .local
            .contains_key(alias)
    }

    fn alias(
        pkg_name: &str,
        service_type: &str,
        auth_id: &str,
        user_type: i32,
    ) -> Result<String, ModuleError> {
        IdentityParams {
            pkg_name: pkg_name.to_string(),
            service_type: service_type.to_string(),
            auth_id: auth_id.as_bytes().to_vec(),
            user_type,
        }
        .validate()
    }

    /// Secret derived from both identity keys, ordered so both sides agree.
    fn key_secret(&self, task: &Task) -> Result<Vec<u8>, ModuleError> {
        let service_type = task
            .service_type
            .as_deref()
            .ok_or_else(|| ModuleError::InvalidParams("key exchange needs a service type".into()))?;
        let peer_auth_id = task
            .peer_auth_id
            .as_deref()
            .ok_or_else(|| ModuleError::InvalidParams("peer auth id unknown".into()))?;
        let peer_user_type = task
            .peer_user_type
            .ok_or_else(|| ModuleError::InvalidParams("peer user type unknown".into()))?;

        let own_alias = Self::alias(
            &task.pkg_name,
            service_type,
            &task.self_auth_id,
            task.self_user_type,
        )?;
        let peer_alias = Self::alias(&task.pkg_name, service_type, peer_auth_id, peer_user_type)?;

        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let own = keys
            .local
            .get(&own_alias)
            .ok_or_else(|| ModuleError::Failed("local identity key missing".into()))?;
        let peer = keys
            .peers
            .get(&peer_alias)
            .ok_or_else(|| ModuleError::Failed("peer identity key missing".into()))?;

        let (first, second) = if own <= peer { (own, peer) } else { (peer, own) };
        Ok(digest(&[b"identity-secret".as_slice(), first.as_slice(), second.as_slice()]).to_vec())
    }

    fn secret(&self, task: &Task) -> Result<Vec<u8>, ModuleError> {
        match &task.pin {
            Some(pin) => Ok(pin.as_bytes().to_vec()),
            None => self.key_secret(task),
        }
    }

    fn own_public_key(&self, task: &Task) -> Option<String> {
        let service_type = task.service_type.as_deref()?;
        let alias = Self::alias(
            &task.pkg_name,
            service_type,
            &task.self_auth_id,
            task.self_user_type,
        )
        .ok()?;
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.local.get(&alias).map(hex::encode)
    }

    /// Stores the key a peer sent during a pin-based exchange.
    fn import_peer_key(&self, task: &Task, message: &Value) -> Result<(), ModuleError> {
        let (Some(service_type), Some(peer_auth_id), Some(peer_user_type)) = (
            task.service_type.as_deref(),
            task.peer_auth_id.as_deref(),
            task.peer_user_type,
        ) else {
            return Ok(());
        };
        let Some(encoded) = message.get(PUBLIC_KEY).and_then(Value::as_str) else {
            return Ok(());
        };
        let key = hex::decode(encoded)
            .map_err(|e| ModuleError::Failed(format!("malformed peer key: {e}")))?;
        let alias = Self::alias(&task.pkg_name, service_type, peer_auth_id, peer_user_type)?;
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .insert(alias, key);
        Ok(())
    }

    fn identity_message(&self, task: &Task, step: i64) -> Map<String, Value> {
        let mut msg = Map::new();
        msg.insert(STEP.into(), json!(step));
        msg.insert(fields::AUTH_ID.into(), json!(task.self_auth_id));
        msg.insert(fields::USER_TYPE.into(), json!(task.self_user_type));
        if task.pin.is_some() {
            if let Some(key) = self.own_public_key(task) {
                msg.insert(PUBLIC_KEY.into(), json!(key));
            }
        }
        msg
    }

    fn shape(task: &Task, to_peer: Option<Value>, session_key: Option<&[u8]>) -> Value {
        let mut own = Map::new();
        if let Some(key) = session_key {
            own.insert(fields::SESSION_KEY.into(), json!(hex::encode(key)));
            if let Some(peer) = &task.peer_auth_id {
                own.insert(fields::PEER_AUTH_ID.into(), json!(peer));
            }
            if let Some(peer_type) = task.peer_user_type {
                own.insert(fields::PEER_USER_TYPE.into(), json!(peer_type));
            }
        }

        if task.is_lite {
            json!({
                fields::SEND_TO_PEER: to_peer.unwrap_or(Value::Null),
                fields::SEND_TO_SELF: Value::Object(own),
            })
        } else {
            if let Some(payload) = to_peer {
                own.insert(fields::PAYLOAD.into(), payload);
            }
            Value::Object(own)
        }
    }
}

fn digest(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn transcript(label: &str, secret: &[u8], client_nonce: &str, server_nonce: &str) -> [u8; 32] {
    digest(&[
        label.as_bytes(),
        secret,
        client_nonce.as_bytes(),
        server_nonce.as_bytes(),
    ])
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn expect_step(input: &Value, step: i64) -> Result<(), ModuleError> {
    match input.get(STEP).and_then(Value::as_i64) {
        Some(s) if s == step => Ok(()),
        other => Err(ModuleError::Failed(format!(
            "expected step {step}, got {other:?}"
        ))),
    }
}

fn read_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ModuleError> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ModuleError::Failed(format!("message lacks {field}")))
}

fn read_peer(task: &mut Task, input: &Value) -> Result<(), ModuleError> {
    task.peer_auth_id = Some(read_str(input, fields::AUTH_ID)?.to_string());
    let peer_type = input
        .get(fields::USER_TYPE)
        .and_then(Value::as_i64)
        .and_then(|t| i32::try_from(t).ok())
        .filter(|t| DeviceType::from_i32(*t).is_some())
        .ok_or_else(|| ModuleError::Failed("message lacks a valid userType".into()))?;
    task.peer_user_type = Some(peer_type);
    Ok(())
}

impl AuthModule for ReferenceModule {
    fn module_type(&self) -> ModuleType {
        self.module_type
    }

    fn check_repeatable(&self, message: &Value) -> Result<(), ModuleError> {
        let nonce = message
            .get(fields::PAYLOAD)
            .and_then(|p| p.get(NONCE))
            .and_then(Value::as_str);
        let Some(nonce) = nonce else {
            return Ok(());
        };
        let cache = self.consumed_nonces.lock().unwrap_or_else(|e| e.into_inner());
        if cache.contains(&nonce.to_string()) {
            return Err(ModuleError::Duplicate);
        }
        Ok(())
    }

    fn create_task(&self, params: &Value) -> Result<TaskId, ModuleError> {
        let is_client = params
            .get(fields::IS_CLIENT)
            .and_then(Value::as_bool)
            .ok_or_else(|| ModuleError::InvalidParams("isClient is required".into()))?;
        let self_auth_id = params
            .get(fields::AUTH_ID)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ModuleError::InvalidParams("authId is required".into()))?
            .to_string();
        let self_user_type = params
            .get(fields::USER_TYPE)
            .and_then(Value::as_i64)
            .and_then(|t| i32::try_from(t).ok())
            .filter(|t| DeviceType::from_i32(*t).is_some())
            .ok_or_else(|| ModuleError::InvalidParams("valid userType is required".into()))?;
        let pin = params
            .get(fields::PIN_CODE)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let text = |field: &str| {
            params
                .get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let mut task = Task {
            stage: if is_client {
                Stage::ClientStart
            } else {
                Stage::ServerAwaitOpening
            },
            is_lite: params
                .get(fields::IS_LITE)
                .and_then(Value::as_bool)
                .unwrap_or(false),
            pin,
            pkg_name: text(fields::PKG_NAME).unwrap_or_else(|| GROUP_KEY_PACKAGE.to_string()),
            service_type: text(fields::SERVICE_TYPE),
            self_auth_id,
            self_user_type,
            peer_auth_id: text(fields::PEER_AUTH_ID),
            peer_user_type: params
                .get(fields::PEER_USER_TYPE)
                .and_then(Value::as_i64)
                .and_then(|t| i32::try_from(t).ok()),
            secret: None,
            own_nonce: String::new(),
            peer_nonce: String::new(),
        };

        // A client without a pin must already know the peer it trusts.
        if is_client && task.pin.is_none() {
            task.secret = Some(self.key_secret(&task)?);
        }

        let task_id = self.next_task.fetch_add(1, Ordering::Relaxed);
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id, task);
        Ok(task_id)
    }

    fn process_task(&self, task_id: TaskId, input: &Value) -> Result<TaskOutput, ModuleError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tasks
            .get_mut(&task_id)
            .ok_or(ModuleError::TaskNotFound(task_id))?;

        match task.stage {
            Stage::ClientStart => {
                task.own_nonce = random_hex(NONCE_LEN);
                let mut msg = self.identity_message(task, 1);
                msg.insert(NONCE.into(), json!(task.own_nonce));
                task.stage = Stage::ClientSentOpening;
                Ok(TaskOutput {
                    status: TaskStatus::Continue,
                    out: Self::shape(task, Some(Value::Object(msg)), None),
                })
            }
            Stage::ServerAwaitOpening => {
                expect_step(input, 1)?;
                task.peer_nonce = read_str(input, NONCE)?.to_string();
                read_peer(task, input)?;
                self.consumed_nonces
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .put(task.peer_nonce.clone(), ());

                let secret = self.secret(task)?;
                task.own_nonce = random_hex(NONCE_LEN);
                let proof = transcript("server", &secret, &task.peer_nonce, &task.own_nonce);
                task.secret = Some(secret);

                let mut msg = self.identity_message(task, 2);
                msg.insert(NONCE.into(), json!(task.own_nonce));
                msg.insert(PROOF.into(), json!(hex::encode(proof)));
                // Remember the client's key for later, now that we know who it is.
                if task.pin.is_some() {
                    self.import_peer_key(task, input)?;
                }
                task.stage = Stage::ServerSentResponse;
                Ok(TaskOutput {
                    status: TaskStatus::Continue,
                    out: Self::shape(task, Some(Value::Object(msg)), None),
                })
            }
            Stage::ClientSentOpening => {
                expect_step(input, 2)?;
                task.peer_nonce = read_str(input, NONCE)?.to_string();
                let claimed_peer = read_str(input, fields::AUTH_ID)?.to_string();
                if let Some(expected) = &task.peer_auth_id {
                    if task.pin.is_none() && *expected != claimed_peer {
                        return Err(ModuleError::Failed("unexpected peer identity".into()));
                    }
                }
                read_peer(task, input)?;

                let secret = match task.secret.clone() {
                    Some(secret) => secret,
                    None => self.secret(task)?,
                };
                let expected = transcript("server", &secret, &task.own_nonce, &task.peer_nonce);
                if read_str(input, PROOF)? != hex::encode(expected) {
                    return Err(ModuleError::Failed("server proof mismatch".into()));
                }
                if task.pin.is_some() {
                    self.import_peer_key(task, input)?;
                }

                let proof = transcript("client", &secret, &task.own_nonce, &task.peer_nonce);
                let session_key =
                    transcript("session", &secret, &task.own_nonce, &task.peer_nonce);
                let mut msg = Map::new();
                msg.insert(STEP.into(), json!(3));
                msg.insert(PROOF.into(), json!(hex::encode(proof)));
                task.stage = Stage::Done;
                Ok(TaskOutput {
                    status: TaskStatus::Finish,
                    out: Self::shape(task, Some(Value::Object(msg)), Some(&session_key)),
                })
            }
            Stage::ServerSentResponse => {
                expect_step(input, 3)?;
                let secret = task
                    .secret
                    .clone()
                    .ok_or_else(|| ModuleError::Failed("secret not established".into()))?;
                let expected = transcript("client", &secret, &task.peer_nonce, &task.own_nonce);
                if read_str(input, PROOF)? != hex::encode(expected) {
                    return Err(ModuleError::Failed("client proof mismatch".into()));
                }
                let session_key =
                    transcript("session", &secret, &task.peer_nonce, &task.own_nonce);
                task.stage = Stage::Done;
                Ok(TaskOutput {
                    status: TaskStatus::Finish,
                    out: Self::shape(task, None, Some(&session_key)),
                })
            }
            Stage::Done => Err(ModuleError::Failed("task already finished".into())),
        }
    }

    fn destroy_task(&self, task_id: TaskId) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
    }

    fn register_local_identity(&self, alias: &str) -> Result<(), ModuleError> {
        let mut key = vec![0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        // Re-registering keeps the existing key so bound peers stay valid.
        keys.local.entry(alias.to_string()).or_insert(key);
        Ok(())
    }

    fn unregister_local_identity(&self, alias: &str) -> Result<(), ModuleError> {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .local
            .remove(alias);
        Ok(())
    }

    fn delete_peer_identity(&self, alias: &str) -> Result<(), ModuleError> {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .remove(alias);
        Ok(())
    }

    fn export_public_key(&self, alias: &str) -> Result<Vec<u8>, ModuleError> {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .local
            .get(alias)
            .cloned()
            .ok_or_else(|| ModuleError::Failed(format!("no local key for alias {alias}")))
    }
}
