//! Trust store change events.

use crate::DataChangeListener;
use serde::{Deserialize, Serialize};

/// A change to the trust store, produced by a successful commit and fanned
/// out to every registered [`DataChangeListener`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrustEvent {
    GroupCreated {
        group_info: String,
    },
    GroupDeleted {
        group_info: String,
    },
    DeviceBound {
        peer_udid: String,
        group_info: String,
    },
    DeviceUnbound {
        peer_udid: String,
        group_info: String,
    },
    /// The device is no longer a member of any group.
    DeviceNotTrusted {
        peer_udid: String,
    },
    /// The device's last group of the given type was removed.
    LastGroupDeleted {
        peer_udid: String,
        group_type: i32,
    },
    TrustedDeviceNumChanged {
        cur_num: usize,
    },
}

impl TrustEvent {
    /// Returns a stable name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GroupCreated { .. } => "group_created",
            Self::GroupDeleted { .. } => "group_deleted",
            Self::DeviceBound { .. } => "device_bound",
            Self::DeviceUnbound { .. } => "device_unbound",
            Self::DeviceNotTrusted { .. } => "device_not_trusted",
            Self::LastGroupDeleted { .. } => "last_group_deleted",
            Self::TrustedDeviceNumChanged { .. } => "trusted_device_num_changed",
        }
    }

    /// Invokes the matching listener method.
    pub fn deliver(&self, listener: &dyn DataChangeListener) {
        match self {
            Self::GroupCreated { group_info } => listener.on_group_created(group_info),
            Self::GroupDeleted { group_info } => listener.on_group_deleted(group_info),
            Self::DeviceBound {
                peer_udid,
                group_info,
            } => listener.on_device_bound(peer_udid, group_info),
            Self::DeviceUnbound {
                peer_udid,
                group_info,
            } => listener.on_device_unbound(peer_udid, group_info),
            Self::DeviceNotTrusted { peer_udid } => listener.on_device_not_trusted(peer_udid),
            Self::LastGroupDeleted {
                peer_udid,
                group_type,
            } => listener.on_last_group_deleted(peer_udid, *group_type),
            Self::TrustedDeviceNumChanged { cur_num } => {
                listener.on_trusted_device_num_changed(*cur_num)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl DataChangeListener for Recorder {
        fn on_device_bound(&self, peer_udid: &str, _group_info: &str) {
            self.seen.lock().unwrap().push(format!("bound:{peer_udid}"));
        }
        fn on_trusted_device_num_changed(&self, cur: usize) {
            self.seen.lock().unwrap().push(format!("num:{cur}"));
        }
    }

    #[test]
    fn deliver_routes_to_matching_method() {
        let recorder = Recorder::default();
        TrustEvent::DeviceBound {
            peer_udid: "PEER".into(),
            group_info: "{}".into(),
        }
        .deliver(&recorder);
        TrustEvent::TrustedDeviceNumChanged { cur_num: 3 }.deliver(&recorder);
        // Methods left at their default do nothing.
        TrustEvent::DeviceNotTrusted {
            peer_udid: "PEER".into(),
        }
        .deliver(&recorder);

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["bound:PEER".to_string(), "num:3".to_string()]
        );
    }
}
