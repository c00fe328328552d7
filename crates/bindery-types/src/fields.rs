//! JSON field names used in request parameters and wire messages.

pub const MESSAGE: &str = "message";
pub const REQUEST_ID: &str = "requestId";
pub const OPERATION_CODE: &str = "operationCode";
pub const APP_ID: &str = "appId";
pub const GROUP_ID: &str = "groupId";
pub const GROUP_NAME: &str = "groupName";
pub const GROUP_TYPE: &str = "groupType";
pub const GROUP_VISIBILITY: &str = "groupVisibility";
pub const GROUP_OWNER: &str = "groupOwner";
pub const EXPIRE_TIME: &str = "expireTime";
pub const USER_ID: &str = "userId";
pub const SHARED_USER_ID: &str = "sharedUserId";
pub const PEER_DEVICE_ID: &str = "peerDeviceId";
pub const PEER_UDID: &str = "peerUdid";
pub const CONN_DEVICE_ID: &str = "connDeviceId";
pub const CONNECT_PARAMS: &str = "connectParams";
pub const CHANNEL_ID: &str = "channelId";
pub const USER_TYPE: &str = "userType";
pub const AUTH_ID: &str = "authId";
pub const PIN_CODE: &str = "pinCode";
pub const DELETE_ID: &str = "deleteId";
pub const ADD_ID: &str = "addId";
pub const IS_FORCE_DELETE: &str = "isForceDelete";
pub const IS_IGNORE_CHANNEL: &str = "isIgnoreChannel";
pub const PAYLOAD: &str = "payload";
pub const GROUP_ERROR_MSG: &str = "groupErrorMsg";
pub const CONFIRMATION: &str = "confirmation";
pub const VERSION: &str = "version";
pub const CURRENT_VERSION: &str = "currentVersion";
pub const MIN_VERSION: &str = "minVersion";
pub const IS_LITE: &str = "isLite";
pub const LITE_OP: &str = "liteOp";
pub const MODULE_TYPE: &str = "moduleType";
pub const SESSION_KEY: &str = "sessionKey";
pub const PEER_AUTH_ID: &str = "peerAuthId";
pub const PEER_USER_TYPE: &str = "peerUserType";
pub const SEND_TO_PEER: &str = "sendToPeer";
pub const SEND_TO_SELF: &str = "sendToSelf";
pub const IS_CLIENT: &str = "isClient";
pub const PKG_NAME: &str = "pkgName";
pub const SERVICE_TYPE: &str = "serviceType";
pub const GROUP_MANAGERS: &str = "groupManagers";
pub const GROUP_FRIENDS: &str = "groupFriends";
pub const TRUSTED_DEVICE_NUM: &str = "trustedDeviceNum";
