use std::sync::Arc;

use bindery_types::{DeviceType, ErrorCode};
use serde_json::{json, Value};

use crate::reference::ReferenceModule;
use crate::*;

fn dispatcher() -> (ModuleDispatcher, Arc<ReferenceModule>) {
    let module = Arc::new(ReferenceModule::new(ModuleType::Identity));
    let dispatcher = ModuleDispatcher::new();
    dispatcher
        .register(module.clone())
        .expect("first registration succeeds");
    (dispatcher, module)
}

fn task_params(is_client: bool, auth_id: &str, pin: Option<&str>) -> Value {
    let mut params = json!({
        "isClient": is_client,
        "authId": auth_id,
        "userType": DeviceType::Accessory.as_i32(),
        "serviceType": "GROUP",
    });
    if let Some(pin) = pin {
        params["pinCode"] = json!(pin);
    }
    params
}

/// Drives a full exchange and returns both final outputs.
fn run_exchange(
    dispatcher: &ModuleDispatcher,
    client: TaskId,
    server: TaskId,
) -> Result<(TaskOutput, TaskOutput), ModuleError> {
    let t = ModuleType::Identity;
    let opening = dispatcher.process_task(client, &Value::Null, t)?;
    let response = dispatcher.process_task(server, &opening.out["payload"], t)?;
    let client_done = dispatcher.process_task(client, &response.out["payload"], t)?;
    let server_done = dispatcher.process_task(server, &client_done.out["payload"], t)?;
    Ok((client_done, server_done))
}

#[test]
fn module_type_codes() {
    assert_eq!(ModuleType::from_i32(0x0001), Some(ModuleType::Identity));
    assert_eq!(ModuleType::from_i32(0x0010), Some(ModuleType::Credential));
    assert_eq!(ModuleType::from_i32(0x0100), None);
}

#[test]
fn duplicate_registration_is_rejected() {
    let (dispatcher, _) = dispatcher();
    let err = dispatcher
        .register(Arc::new(ReferenceModule::new(ModuleType::Identity)))
        .expect_err("second registration fails");
    assert!(matches!(err, ModuleError::AlreadyRegistered(ModuleType::Identity)));
}

#[test]
fn missing_module_is_not_found() {
    let (dispatcher, _) = dispatcher();
    let err = dispatcher
        .create_task(&task_params(true, "A", Some("1234")), ModuleType::Credential)
        .expect_err("credential module absent");
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[test]
fn identity_params_are_validated() {
    let (dispatcher, _) = dispatcher();
    let cases = [
        IdentityParams::new("", "svc", b"id".to_vec(), DeviceType::Accessory),
        IdentityParams::new("pkg", "", b"id".to_vec(), DeviceType::Accessory),
        IdentityParams::new("pkg", "svc", Vec::new(), DeviceType::Accessory),
        IdentityParams {
            pkg_name: "pkg".into(),
            service_type: "svc".into(),
            auth_id: b"id".to_vec(),
            user_type: 7,
        },
    ];
    for params in cases {
        let err = dispatcher
            .register_local_identity(&params, ModuleType::Identity)
            .expect_err("invalid params rejected");
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }
}

#[test]
fn pin_exchange_agrees_on_session_key_and_stamps_version() {
    let (dispatcher, module) = dispatcher();
    let t = ModuleType::Identity;
    let client = dispatcher
        .create_task(&task_params(true, "CLIENT", Some("123456")), t)
        .expect("client task");
    let server = dispatcher
        .create_task(&task_params(false, "SERVER", Some("123456")), t)
        .expect("server task");

    let (client_done, server_done) = run_exchange(&dispatcher, client, server).expect("exchange");

    assert!(client_done.is_finished());
    assert!(server_done.is_finished());
    assert_eq!(client_done.out["sessionKey"], server_done.out["sessionKey"]);
    assert_eq!(client_done.out["peerAuthId"], "SERVER");
    assert_eq!(server_done.out["peerAuthId"], "CLIENT");
    assert!(server_done.out.get("payload").is_none());
    assert_eq!(client_done.out["version"]["currentVersion"], "2.1.0");

    dispatcher.destroy_task(client, t);
    dispatcher.destroy_task(server, t);
    assert_eq!(module.task_count(), 0);
}

#[test]
fn wrong_pin_fails_on_client() {
    let (dispatcher, _) = dispatcher();
    let t = ModuleType::Identity;
    let client = dispatcher
        .create_task(&task_params(true, "CLIENT", Some("111111")), t)
        .expect("client task");
    let server = dispatcher
        .create_task(&task_params(false, "SERVER", Some("222222")), t)
        .expect("server task");

    let err = run_exchange(&dispatcher, client, server).expect_err("pins differ");
    assert_eq!(err.code(), ErrorCode::ProtocolError);
}

#[test]
fn consumed_opening_is_reported_repeated() {
    let (dispatcher, _) = dispatcher();
    let t = ModuleType::Identity;
    let client = dispatcher
        .create_task(&task_params(true, "CLIENT", Some("1")), t)
        .expect("client task");
    let opening = dispatcher
        .process_task(client, &Value::Null, t)
        .expect("opening");
    let wire = json!({ "message": 1, "payload": opening.out["payload"] });

    dispatcher
        .check_repeatable(&wire, t)
        .expect("fresh opening is not repeated");
    let server = dispatcher
        .create_task(&task_params(false, "SERVER", Some("1")), t)
        .expect("server task");
    dispatcher
        .process_task(server, &wire["payload"], t)
        .expect("server consumes opening");

    let err = dispatcher
        .check_repeatable(&wire, t)
        .expect_err("second copy is repeated");
    assert!(matches!(err, ModuleError::Duplicate));
}

#[test]
fn key_exchange_after_pin_bind() {
    let (dispatcher, module) = dispatcher();
    let t = ModuleType::Identity;
    let client_id = IdentityParams::for_group("GROUP", "CLIENT", DeviceType::Accessory);
    let server_id = IdentityParams::for_group("GROUP", "SERVER", DeviceType::Accessory);
    dispatcher
        .register_local_identity(&client_id, t)
        .expect("client key");
    dispatcher
        .register_local_identity(&server_id, t)
        .expect("server key");

    // Pin-based bind swaps identity keys.
    let client = dispatcher
        .create_task(&task_params(true, "CLIENT", Some("9999")), t)
        .expect("client task");
    let server = dispatcher
        .create_task(&task_params(false, "SERVER", Some("9999")), t)
        .expect("server task");
    run_exchange(&dispatcher, client, server).expect("bind exchange");
    assert!(module.has_peer_key(&server_id.validate().expect("alias")));
    assert!(module.has_peer_key(&client_id.validate().expect("alias")));

    // Later authentication needs no pin.
    let mut client_params = task_params(true, "CLIENT", None);
    client_params["peerAuthId"] = json!("SERVER");
    client_params["peerUserType"] = json!(DeviceType::Accessory.as_i32());
    let client = dispatcher
        .create_task(&client_params, t)
        .expect("auth client task");
    let server = dispatcher
        .create_task(&task_params(false, "SERVER", None), t)
        .expect("auth server task");
    let (client_done, server_done) =
        run_exchange(&dispatcher, client, server).expect("auth exchange");
    assert_eq!(client_done.out["sessionKey"], server_done.out["sessionKey"]);
}

#[test]
fn key_exchange_without_trusted_peer_fails_at_creation() {
    let (dispatcher, _) = dispatcher();
    let mut params = task_params(true, "CLIENT", None);
    params["peerAuthId"] = json!("STRANGER");
    params["peerUserType"] = json!(0);
    let err = dispatcher
        .create_task(&params, ModuleType::Identity)
        .expect_err("no keys to derive from");
    assert_eq!(err.code(), ErrorCode::ProtocolError);
}

#[test]
fn lite_tasks_split_peer_and_self_output() {
    let (dispatcher, _) = dispatcher();
    let t = ModuleType::Identity;
    let mut client_params = task_params(true, "CLIENT", Some("42"));
    client_params["isLite"] = json!(true);
    let mut server_params = task_params(false, "SERVER", Some("42"));
    server_params["isLite"] = json!(true);
    let client = dispatcher.create_task(&client_params, t).expect("client");
    let server = dispatcher.create_task(&server_params, t).expect("server");

    let opening = dispatcher.process_task(client, &Value::Null, t).expect("opening");
    assert!(opening.out["sendToPeer"].is_object());
    let response = dispatcher
        .process_task(server, &opening.out["sendToPeer"], t)
        .expect("response");
    let client_done = dispatcher
        .process_task(client, &response.out["sendToPeer"], t)
        .expect("client finish");
    let server_done = dispatcher
        .process_task(server, &client_done.out["sendToPeer"], t)
        .expect("server finish");

    assert!(server_done.out["sendToPeer"].is_null());
    assert_eq!(
        client_done.out["sendToSelf"]["sessionKey"],
        server_done.out["sendToSelf"]["sessionKey"]
    );
}

#[test]
fn export_requires_registered_key() {
    let (dispatcher, _) = dispatcher();
    let params = IdentityParams::for_group("GROUP", "DEV", DeviceType::Controller);
    assert!(dispatcher
        .export_public_key(&params, ModuleType::Identity)
        .is_err());
    dispatcher
        .register_local_identity(&params, ModuleType::Identity)
        .expect("register");
    let key = dispatcher
        .export_public_key(&params, ModuleType::Identity)
        .expect("export");
    assert_eq!(key.len(), 32);
    dispatcher
        .unregister_local_identity(&params, ModuleType::Identity)
        .expect("unregister");
    assert!(dispatcher
        .export_public_key(&params, ModuleType::Identity)
        .is_err());
}

/// Runs tasks but keeps no identity keys.
struct PinOnly;

impl AuthModule for PinOnly {
    fn module_type(&self) -> ModuleType {
        ModuleType::Credential
    }

    fn check_repeatable(&self, _message: &Value) -> Result<(), ModuleError> {
        Ok(())
    }

    fn create_task(&self, _params: &Value) -> Result<TaskId, ModuleError> {
        Ok(1)
    }

    fn process_task(&self, _task_id: TaskId, _input: &Value) -> Result<TaskOutput, ModuleError> {
        Ok(TaskOutput {
            status: TaskStatus::Finish,
            out: json!({}),
        })
    }

    fn destroy_task(&self, _task_id: TaskId) {}
}

#[test]
fn identity_calls_on_a_keyless_module_are_unsupported() {
    let dispatcher = ModuleDispatcher::new();
    dispatcher.register(Arc::new(PinOnly)).expect("register");
    let params = IdentityParams::for_group("GROUP", "DEV", DeviceType::Controller);

    let err = dispatcher
        .export_public_key(&params, ModuleType::Credential)
        .unwrap_err();
    assert!(matches!(
        err,
        ModuleError::Unsupported {
            module: ModuleType::Credential,
            operation: "export_public_key",
        }
    ));
    assert_eq!(err.code(), ErrorCode::NotSupported);
    assert!(matches!(
        dispatcher.register_local_identity(&params, ModuleType::Credential),
        Err(ModuleError::Unsupported { .. })
    ));
    // Missing modules stay a distinct error.
    assert!(matches!(
        dispatcher.export_public_key(&params, ModuleType::Identity),
        Err(ModuleError::NotFound(ModuleType::Identity))
    ));
}
