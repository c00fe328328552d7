//! Two registries talking to each other through transmit callbacks.

use std::sync::{Arc, Mutex};

use bindery_channels::ChannelManager;
use bindery_db::{MemoryTrustStore, TrustStore};
use bindery_groups::GroupManager;
use bindery_modules::reference::ReferenceModule;
use bindery_modules::{ModuleDispatcher, ModuleType};
use bindery_session::{message, InboundChannel, SessionContext, SessionOrigin, SessionRegistry};
use bindery_session::{SessionEvent, SessionStatus};
use bindery_types::{
    ConfirmDecision, DataChangeListener, DeviceAuthCallback, DeviceType, ErrorCode, GroupType,
    GroupVisibility, Limits, LocalDevice, OperationCode, OsAccountId, RequestId,
};
use serde_json::{json, Value};

const OS: OsAccountId = 100;
const APP: &str = "com.example.pairing";
const PIN: &str = "246810";

#[derive(Default)]
struct App {
    transmit: bool,
    /// Answer given to every confirmation request.
    answer: Option<Value>,
    outbox: Mutex<Vec<Vec<u8>>>,
    finished: Mutex<Vec<(RequestId, Value)>>,
    errors: Mutex<Vec<(RequestId, ErrorCode)>>,
    keys: Mutex<Vec<Vec<u8>>>,
    requests: Mutex<Vec<Value>>,
}

impl App {
    fn new(pin: &str) -> Arc<Self> {
        Arc::new(Self {
            transmit: true,
            answer: Some(json!({
                "confirmation": ConfirmDecision::Accepted.as_i64(),
                "pinCode": pin,
            })),
            ..Self::default()
        })
    }

    fn offline() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn drain(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }

    fn error_codes(&self) -> Vec<ErrorCode> {
        self.errors.lock().unwrap().iter().map(|(_, c)| *c).collect()
    }
}

impl DeviceAuthCallback for App {
    fn can_transmit(&self) -> bool {
        self.transmit
    }

    fn on_transmit(&self, _request_id: RequestId, data: &[u8]) -> bool {
        self.outbox.lock().unwrap().push(data.to_vec());
        true
    }

    fn on_session_key_returned(&self, _request_id: RequestId, session_key: &[u8]) {
        self.keys.lock().unwrap().push(session_key.to_vec());
    }

    fn on_finish(&self, request_id: RequestId, _op: OperationCode, return_data: &str) {
        let data = serde_json::from_str(return_data).unwrap();
        self.finished.lock().unwrap().push((request_id, data));
    }

    fn on_error(&self, request_id: RequestId, _op: OperationCode, code: ErrorCode, _: Option<&str>) {
        self.errors.lock().unwrap().push((request_id, code));
    }

    fn on_request(&self, _request_id: RequestId, _op: OperationCode, req: &str) -> Option<String> {
        self.requests
            .lock()
            .unwrap()
            .push(serde_json::from_str(req).unwrap());
        self.answer.as_ref().map(Value::to_string)
    }
}

#[derive(Default)]
struct Events(Mutex<Vec<String>>);

impl DataChangeListener for Events {
    fn on_device_bound(&self, peer_udid: &str, _group_info: &str) {
        self.0.lock().unwrap().push(format!("bound:{peer_udid}"));
    }

    fn on_device_unbound(&self, peer_udid: &str, _group_info: &str) {
        self.0.lock().unwrap().push(format!("unbound:{peer_udid}"));
    }
}

struct Device {
    udid: &'static str,
    registry: SessionRegistry,
    store: Arc<MemoryTrustStore>,
    groups: Arc<GroupManager>,
    events: Arc<Events>,
}

impl Device {
    fn new(udid: &'static str, user_type: DeviceType) -> Self {
        let modules = Arc::new(ModuleDispatcher::new());
        for module in [ModuleType::Identity, ModuleType::Credential] {
            modules
                .register(Arc::new(ReferenceModule::new(module)))
                .expect("register module");
        }
        let store = Arc::new(MemoryTrustStore::new());
        let groups = Arc::new(GroupManager::new(
            Arc::clone(&store) as Arc<dyn TrustStore>,
            Arc::clone(&modules),
            LocalDevice::new(udid, user_type),
            Limits::default(),
        ));
        let events = Arc::new(Events::default());
        let registry = SessionRegistry::new(SessionContext {
            modules,
            channels: Arc::new(ChannelManager::direct_only()),
            groups: Arc::clone(&groups),
            listener: Arc::clone(&events) as Arc<dyn DataChangeListener>,
        });
        Self {
            udid,
            registry,
            store,
            groups,
            events,
        }
    }

    fn create_group(&self, name: &str) -> String {
        let (group_id, _) = self
            .groups
            .create_group(
                OS,
                APP,
                &json!({ "groupName": name, "groupType": GroupType::PeerToPeer.as_i32() }),
            )
            .expect("create group");
        group_id
    }

    fn start(&mut self, request_id: RequestId, op: OperationCode, params: Value, app: &Arc<App>) {
        self.start_as(APP, request_id, op, params, app);
    }

    fn start_as(
        &mut self,
        app_id: &str,
        request_id: RequestId,
        op: OperationCode,
        params: Value,
        app: &Arc<App>,
    ) {
        let origin = SessionOrigin::Client {
            os: OS,
            app_id: app_id.to_string(),
            operation: op,
        };
        self.registry
            .create_session(request_id, origin, &params, Some(app_callback(app)))
            .expect("create session");
        self.registry
            .process_session(request_id, SessionEvent::Start)
            .expect("start session");
    }

    fn receive(&mut self, data: &[u8], app: &Arc<App>) -> Option<SessionStatus> {
        let msg = message::decode(data).expect("decode");
        self.registry
            .handle_inbound(OS, msg, InboundChannel::direct(), Some(app_callback(app)))
            .expect("inbound")
    }

    fn trusts(&self, group_id: &str, udid: &str) -> bool {
        self.store
            .get_device(OS, group_id, udid)
            .expect("query")
            .is_some()
    }
}

fn app_callback(app: &Arc<App>) -> Arc<dyn DeviceAuthCallback> {
    Arc::clone(app) as Arc<dyn DeviceAuthCallback>
}

/// Shuttles transmitted bytes between the two devices until both go quiet.
fn pump(a: &mut Device, a_app: &Arc<App>, b: &mut Device, b_app: &Arc<App>) {
    loop {
        let from_a = a_app.drain();
        let from_b = b_app.drain();
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        for data in from_a {
            b.receive(&data, b_app);
        }
        for data in from_b {
            a.receive(&data, a_app);
        }
    }
}

fn join_params(group_id: &str) -> Value {
    json!({
        "groupId": group_id,
        "groupType": GroupType::PeerToPeer.as_i32(),
        "pinCode": PIN,
    })
}

/// Owner `a` creates a group and `b` joins it with the right pin.
fn paired() -> (Device, Arc<App>, Device, Arc<App>, String) {
    let mut owner = Device::new("UDID-OWNER", DeviceType::Accessory);
    let mut joiner = Device::new("UDID-JOINER", DeviceType::Controller);
    let owner_app = App::new(PIN);
    let joiner_app = App::new(PIN);
    let group_id = owner.create_group("living room");

    joiner.start(1, OperationCode::MemberJoin, join_params(&group_id), &joiner_app);
    pump(&mut joiner, &joiner_app, &mut owner, &owner_app);
    (owner, owner_app, joiner, joiner_app, group_id)
}

#[test]
fn join_binds_both_devices() {
    let (owner, owner_app, joiner, joiner_app, group_id) = paired();

    assert!(owner.trusts(&group_id, joiner.udid));
    assert!(joiner.trusts(&group_id, owner.udid));
    assert_eq!(owner_app.finished.lock().unwrap().len(), 1);
    assert_eq!(joiner_app.finished.lock().unwrap().len(), 1);
    assert!(owner_app.errors.lock().unwrap().is_empty());
    assert!(joiner_app.errors.lock().unwrap().is_empty());
    assert!(owner.registry.is_empty());
    assert!(joiner.registry.is_empty());

    let owner_keys = owner_app.keys.lock().unwrap();
    let joiner_keys = joiner_app.keys.lock().unwrap();
    assert_eq!(owner_keys.len(), 1);
    assert_eq!(*owner_keys, *joiner_keys);

    let (_, data) = &joiner_app.finished.lock().unwrap()[0];
    assert_eq!(data["groupId"], group_id.as_str());
    assert!(data.get("sessionKey").is_none());

    let group = joiner
        .store
        .get_group(OS, &group_id)
        .expect("query")
        .expect("joiner learned the group");
    assert_eq!(group.group_name, "living room");
    assert_eq!(
        *owner.events.0.lock().unwrap(),
        vec![format!("bound:{}", joiner.udid)]
    );
}

#[test]
fn joining_app_owns_its_copy_of_a_private_group() {
    const JOINER_APP: &str = "com.example.joiner";
    let mut owner = Device::new("UDID-OWNER", DeviceType::Accessory);
    let mut joiner = Device::new("UDID-JOINER", DeviceType::Controller);
    let owner_app = App::new(PIN);
    let joiner_app = App::new(PIN);
    let (group_id, _) = owner
        .groups
        .create_group(
            OS,
            APP,
            &json!({
                "groupName": "study",
                "groupType": GroupType::PeerToPeer.as_i32(),
                "groupVisibility": GroupVisibility::Private.as_i32(),
            }),
        )
        .expect("create private group");

    joiner.start_as(JOINER_APP, 80, OperationCode::MemberJoin, join_params(&group_id), &joiner_app);
    pump(&mut joiner, &joiner_app, &mut owner, &owner_app);
    assert!(joiner.trusts(&group_id, owner.udid));

    let group = joiner
        .store
        .get_group(OS, &group_id)
        .expect("query")
        .expect("joiner learned the group");
    assert_eq!(group.owner, JOINER_APP);
    assert_eq!(group.visibility, GroupVisibility::Private);
    assert!(joiner
        .groups
        .check_access_to_group(OS, JOINER_APP, &group_id)
        .expect("access check"));
    assert!(!joiner
        .groups
        .check_access_to_group(OS, APP, &group_id)
        .expect("access check"));

    joiner.start_as(
        JOINER_APP,
        81,
        OperationCode::MemberDelete,
        json!({ "groupId": group_id, "deleteId": owner.udid }),
        &joiner_app,
    );
    pump(&mut joiner, &joiner_app, &mut owner, &owner_app);
    assert!(!joiner.trusts(&group_id, owner.udid));
    assert!(joiner_app.errors.lock().unwrap().is_empty());
}

#[test]
fn owner_sees_confirmation_request_without_pin() {
    let (_, owner_app, joiner, _, group_id) = paired();
    let requests = owner_app.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["groupId"], group_id.as_str());
    assert_eq!(requests[0]["peerDeviceId"], joiner.udid);
    assert!(requests[0].get("pinCode").is_none());
}

#[test]
fn wrong_pin_fails_once_on_each_side() {
    let mut owner = Device::new("UDID-OWNER", DeviceType::Accessory);
    let mut joiner = Device::new("UDID-JOINER", DeviceType::Controller);
    let owner_app = App::new("000000");
    let joiner_app = App::new(PIN);
    let group_id = owner.create_group("kitchen");

    joiner.start(2, OperationCode::MemberJoin, join_params(&group_id), &joiner_app);
    pump(&mut joiner, &joiner_app, &mut owner, &owner_app);

    assert_eq!(joiner_app.error_codes().len(), 1);
    assert_eq!(owner_app.error_codes().len(), 1);
    assert_eq!(owner_app.error_codes()[0], joiner_app.error_codes()[0]);
    assert!(owner_app.finished.lock().unwrap().is_empty());
    assert!(!owner.trusts(&group_id, joiner.udid));
    assert!(joiner.store.get_group(OS, &group_id).expect("query").is_none());
    assert!(owner.registry.is_empty());
    assert!(joiner.registry.is_empty());
}

#[test]
fn rejected_join_reports_rejection_to_both() {
    let mut owner = Device::new("UDID-OWNER", DeviceType::Accessory);
    let mut joiner = Device::new("UDID-JOINER", DeviceType::Controller);
    let owner_app = Arc::new(App {
        transmit: true,
        answer: Some(json!({ "confirmation": ConfirmDecision::Rejected.as_i64() })),
        ..App::default()
    });
    let joiner_app = App::new(PIN);
    let group_id = owner.create_group("hall");

    joiner.start(3, OperationCode::MemberJoin, join_params(&group_id), &joiner_app);
    pump(&mut joiner, &joiner_app, &mut owner, &owner_app);

    assert_eq!(owner_app.error_codes(), vec![ErrorCode::RequestRejected]);
    assert_eq!(joiner_app.error_codes(), vec![ErrorCode::RequestRejected]);
}

#[test]
fn replayed_opening_is_ignored() {
    let mut owner = Device::new("UDID-OWNER", DeviceType::Accessory);
    let mut joiner = Device::new("UDID-JOINER", DeviceType::Controller);
    let owner_app = App::new(PIN);
    let joiner_app = App::new(PIN);
    let group_id = owner.create_group("garage");

    joiner.start(4, OperationCode::MemberJoin, join_params(&group_id), &joiner_app);
    let opening = joiner_app.drain();
    assert_eq!(opening.len(), 1);

    assert_eq!(
        owner.receive(&opening[0], &owner_app),
        Some(SessionStatus::Continue)
    );
    // Same request still live on the owner.
    assert_eq!(owner.receive(&opening[0], &owner_app), None);

    for data in owner_app.drain() {
        joiner.receive(&data, &joiner_app);
    }
    pump(&mut joiner, &joiner_app, &mut owner, &owner_app);
    assert_eq!(owner_app.finished.lock().unwrap().len(), 1);

    // The request is gone, but the module remembers the opening.
    assert_eq!(owner.receive(&opening[0], &owner_app), None);
    assert!(owner.registry.is_empty());
    assert!(owner_app.errors.lock().unwrap().is_empty());
}

#[test]
fn authenticate_after_join_agrees_on_a_key() {
    let (mut owner, owner_app, mut joiner, joiner_app, group_id) = paired();
    owner_app.keys.lock().unwrap().clear();
    joiner_app.keys.lock().unwrap().clear();

    joiner.start(
        10,
        OperationCode::Authenticate,
        json!({ "peerUdid": owner.udid, "groupId": group_id }),
        &joiner_app,
    );
    pump(&mut joiner, &joiner_app, &mut owner, &owner_app);

    assert!(joiner_app.errors.lock().unwrap().is_empty());
    let owner_keys = owner_app.keys.lock().unwrap();
    assert_eq!(owner_keys.len(), 1);
    assert_eq!(*owner_keys, *joiner_app.keys.lock().unwrap());
}

#[test]
fn authenticate_unknown_peer_is_not_found() {
    let mut device = Device::new("UDID-A", DeviceType::Controller);
    let app = App::new(PIN);
    let origin = SessionOrigin::Client {
        os: OS,
        app_id: APP.to_string(),
        operation: OperationCode::Authenticate,
    };
    let err = device
        .registry
        .create_session(11, origin, &json!({ "peerUdid": "UDID-NOBODY" }), Some(app_callback(&app)))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert!(!device.registry.session_exists(11));
}

#[test]
fn unbind_over_channel_removes_both_records() {
    let (mut owner, owner_app, mut joiner, joiner_app, group_id) = paired();

    joiner.start(
        20,
        OperationCode::MemberDelete,
        json!({ "groupId": group_id, "deleteId": owner.udid }),
        &joiner_app,
    );
    pump(&mut joiner, &joiner_app, &mut owner, &owner_app);

    assert!(!joiner.trusts(&group_id, owner.udid));
    assert!(!owner.trusts(&group_id, joiner.udid));
    assert_eq!(joiner_app.finished.lock().unwrap().len(), 2);
    assert!(owner
        .events
        .0
        .lock()
        .unwrap()
        .contains(&format!("unbound:{}", joiner.udid)));
}

#[test]
fn forced_unbind_without_transport_commits_locally() {
    let (_, _, mut joiner, _, group_id) = paired();
    let offline = App::offline();

    let origin = SessionOrigin::Client {
        os: OS,
        app_id: APP.to_string(),
        operation: OperationCode::MemberDelete,
    };
    let params = json!({ "groupId": group_id, "deleteId": "UDID-OWNER", "isForceDelete": true });
    joiner
        .registry
        .create_session(30, origin, &params, Some(app_callback(&offline)))
        .expect("create");
    let status = joiner
        .registry
        .process_session(30, SessionEvent::Start)
        .expect("start");

    assert_eq!(status, SessionStatus::Finish);
    assert!(!joiner.trusts(&group_id, "UDID-OWNER"));
    assert_eq!(offline.finished.lock().unwrap().len(), 1);
    assert!(offline.errors.lock().unwrap().is_empty());
    assert!(offline.outbox.lock().unwrap().is_empty());
}

#[test]
fn unforced_unbind_without_transport_is_refused() {
    let (_, _, mut joiner, _, group_id) = paired();
    let offline = App::offline();
    let origin = SessionOrigin::Client {
        os: OS,
        app_id: APP.to_string(),
        operation: OperationCode::MemberDelete,
    };
    let params = json!({ "groupId": group_id, "deleteId": "UDID-OWNER" });
    let err = joiner
        .registry
        .create_session(31, origin, &params, Some(app_callback(&offline)))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TransportFailure);
    assert!(joiner.trusts(&group_id, "UDID-OWNER"));
}

#[test]
fn unbind_of_unknown_member_is_not_found() {
    let mut owner = Device::new("UDID-OWNER", DeviceType::Accessory);
    let app = App::new(PIN);
    let group_id = owner.create_group("attic");
    let origin = SessionOrigin::Client {
        os: OS,
        app_id: APP.to_string(),
        operation: OperationCode::MemberDelete,
    };
    let params = json!({ "groupId": group_id, "deleteId": "UDID-STRANGER" });
    let err = owner
        .registry
        .create_session(32, origin, &params, Some(app_callback(&app)))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert!(owner.registry.is_empty());
}

#[test]
fn lite_join_binds_both_devices() {
    let mut owner = Device::new("UDID-OWNER", DeviceType::Accessory);
    let mut joiner = Device::new("UDID-JOINER", DeviceType::Controller);
    let owner_app = App::new(PIN);
    let joiner_app = App::new(PIN);
    let group_id = owner.create_group("porch");

    let mut params = join_params(&group_id);
    params["isLite"] = json!(true);
    joiner.start(40, OperationCode::MemberJoin, params, &joiner_app);

    let opening = message::decode(&joiner_app.outbox.lock().unwrap()[0]).expect("decode");
    assert_eq!(opening["isLite"], true);
    assert_eq!(opening["liteOp"], "identityBind");
    assert_eq!(opening["moduleType"], ModuleType::Identity.as_i32());

    pump(&mut joiner, &joiner_app, &mut owner, &owner_app);
    assert!(owner.trusts(&group_id, joiner.udid));
    assert!(joiner.trusts(&group_id, owner.udid));
    assert_eq!(joiner_app.keys.lock().unwrap().len(), 1);
}

#[test]
fn lite_messages_pick_their_module() {
    let mut owner = Device::new("UDID-OWNER", DeviceType::Accessory);
    let mut joiner = Device::new("UDID-JOINER", DeviceType::Controller);
    let owner_app = App::new(PIN);
    let joiner_app = App::new(PIN);
    let group_id = owner.create_group("cellar");

    let mut params = join_params(&group_id);
    params["isLite"] = json!(true);
    params["moduleType"] = json!(ModuleType::Credential.as_i32());
    joiner.start(42, OperationCode::MemberJoin, params, &joiner_app);

    let opening = joiner_app.drain();
    let decoded = message::decode(&opening[0]).expect("decode");
    assert_eq!(decoded["liteOp"], "credentialBind");
    assert_eq!(decoded["moduleType"], ModuleType::Credential.as_i32());

    // The owner's group is peer-to-peer, yet its answer comes from the
    // credential module the opening named.
    assert_eq!(
        owner.receive(&opening[0], &owner_app),
        Some(SessionStatus::Continue)
    );
    let response = message::decode(&owner_app.outbox.lock().unwrap()[0]).expect("decode");
    assert_eq!(response["liteOp"], "credentialBind");
    assert_eq!(response["moduleType"], ModuleType::Credential.as_i32());

    pump(&mut joiner, &joiner_app, &mut owner, &owner_app);
    assert!(owner_app.errors.lock().unwrap().is_empty());
    assert!(joiner_app.errors.lock().unwrap().is_empty());
    assert!(owner.trusts(&group_id, joiner.udid));
    assert!(joiner.trusts(&group_id, owner.udid));
    let joiner_keys = joiner_app.keys.lock().unwrap();
    assert_eq!(joiner_keys.len(), 1);
    assert_eq!(*joiner_keys, *owner_app.keys.lock().unwrap());
}

#[test]
fn key_agreement_needs_no_group() {
    let mut a = Device::new("UDID-A", DeviceType::Controller);
    let mut b = Device::new("UDID-B", DeviceType::Controller);
    let a_app = App::new(PIN);
    let b_app = App::new(PIN);

    a.start(50, OperationCode::KeyAgreement, json!({ "pinCode": PIN }), &a_app);
    pump(&mut a, &a_app, &mut b, &b_app);

    let a_keys = a_app.keys.lock().unwrap();
    assert_eq!(a_keys.len(), 1);
    assert_eq!(*a_keys, *b_app.keys.lock().unwrap());
    let (_, data) = &a_app.finished.lock().unwrap()[0];
    assert_eq!(data["peerDeviceId"], "UDID-B");
}

#[test]
fn deferred_confirmation_waits_for_an_answer() {
    let mut a = Device::new("UDID-A", DeviceType::Controller);
    let mut b = Device::new("UDID-B", DeviceType::Controller);
    let a_app = App::new(PIN);
    let b_app = Arc::new(App {
        transmit: true,
        ..App::default()
    });

    a.start(60, OperationCode::KeyAgreement, json!({ "pinCode": PIN }), &a_app);
    pump(&mut a, &a_app, &mut b, &b_app);

    let waiting = b.registry.get(60).expect("server session");
    assert!(waiting.is_waiting());

    let answer = json!({ "confirmation": ConfirmDecision::Accepted.as_i64(), "pinCode": PIN });
    let status = b
        .registry
        .process_session(60, SessionEvent::Confirmed(answer))
        .expect("confirm");
    assert_eq!(status, SessionStatus::Continue);
    pump(&mut a, &a_app, &mut b, &b_app);

    assert_eq!(a_app.finished.lock().unwrap().len(), 1);
    assert_eq!(b_app.finished.lock().unwrap().len(), 1);
}

#[test]
fn destroyed_session_sends_nothing() {
    let mut a = Device::new("UDID-A", DeviceType::Controller);
    let a_app = App::new(PIN);
    a.start(70, OperationCode::KeyAgreement, json!({ "pinCode": PIN }), &a_app);
    a_app.drain();

    a.registry.destroy_session(70);
    a.registry.destroy_session(70);
    assert!(a_app.drain().is_empty());
    assert!(a_app.errors.lock().unwrap().is_empty());
}
