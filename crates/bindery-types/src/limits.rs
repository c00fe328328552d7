//! Ceilings enforced by the group operation layer.

use serde::{Deserialize, Serialize};

/// Resource ceilings checked before any trust store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum number of groups per OS account.
    pub max_groups_per_account: usize,
    /// Maximum number of devices (local device included) per group.
    pub max_devices_per_group: usize,
    /// Maximum number of manager or friend entries per group.
    pub max_role_entries: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_groups_per_account: 100,
            max_devices_per_group: 101,
            max_role_entries: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits() {
        let limits = Limits::default();
        assert_eq!(limits.max_groups_per_account, 100);
        assert_eq!(limits.max_devices_per_group, 101);
        assert_eq!(limits.max_role_entries, 64);
    }
}
