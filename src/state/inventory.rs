//! Device inventory: one list per (scope, role)

use std::collections::{BTreeMap, HashSet};

use crate::protocol::{Device, DeviceRole, DeviceScope, WireDevice};

#[derive(Debug, Default)]
pub struct DeviceInventory {
    lists: BTreeMap<(DeviceScope, DeviceRole), Vec<Device>>,
}

impl DeviceInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list for `(scope, role)` wholesale.
    ///
    /// Duplicate names keep their first occurrence. Returns whether the
    /// visible list changed.
    pub fn replace(&mut self, scope: DeviceScope, role: DeviceRole, devices: Vec<WireDevice>) -> bool {
        let mut seen = HashSet::new();
        let list: Vec<Device> = devices
            .into_iter()
            .filter(|d| seen.insert(d.name.clone()))
            .map(|d| Device {
                name: d.name,
                role,
                scope,
                is_default: d.is_default,
            })
            .collect();

        let previous = self.lists.insert((scope, role), list);
        previous.as_ref() != self.lists.get(&(scope, role))
    }

    pub fn list(&self, scope: DeviceScope, role: DeviceRole) -> &[Device] {
        self.lists.get(&(scope, role)).map_or(&[], Vec::as_slice)
    }

    pub fn contains(&self, scope: DeviceScope, role: DeviceRole, name: &str) -> bool {
        self.list(scope, role).iter().any(|d| d.name == name)
    }

    /// Default device, falling back to the first one listed
    pub fn preferred(&self, scope: DeviceScope, role: DeviceRole) -> Option<&Device> {
        let list = self.list(scope, role);
        list.iter().find(|d| d.is_default).or_else(|| list.first())
    }

    /// Forget everything known about a scope
    pub fn drop_scope(&mut self, scope: DeviceScope) -> bool {
        let before = self.lists.len();
        self.lists.retain(|(s, _), _| *s != scope);
        before != self.lists.len()
    }

    pub fn to_wire(&self, scope: DeviceScope, role: DeviceRole) -> Vec<WireDevice> {
        self.list(scope, role)
            .iter()
            .map(|d| WireDevice::new(d.name.clone(), d.is_default))
            .collect()
    }

    /// Every known device, local first, then by connection id
    pub fn all(&self) -> Vec<Device> {
        self.lists.values().flatten().cloned().collect()
    }
}
