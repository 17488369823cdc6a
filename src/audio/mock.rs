//! Mock device enumerator for testing without hardware.

use parking_lot::Mutex;

use crate::audio::device::DeviceEnumerator;
use crate::error::DeviceError;
use crate::protocol::{DeviceRole, WireDevice};

/// Enumerator whose device lists and failures are set by the test.
pub struct MockEnumerator {
    inputs: Mutex<Vec<WireDevice>>,
    outputs: Mutex<Vec<WireDevice>>,
    failure: Mutex<Option<String>>,
}

impl MockEnumerator {
    /// Creates a mock reporting the given names; the first of each list is the default.
    pub fn new(inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            inputs: Mutex::new(to_wire(inputs)),
            outputs: Mutex::new(to_wire(outputs)),
            failure: Mutex::new(None),
        }
    }

    pub fn set_inputs(&self, names: &[&str]) {
        *self.inputs.lock() = to_wire(names);
    }

    pub fn set_outputs(&self, names: &[&str]) {
        *self.outputs.lock() = to_wire(names);
    }

    /// Makes every enumeration fail with `reason` until cleared with `None`.
    pub fn fail_with(&self, reason: Option<&str>) {
        *self.failure.lock() = reason.map(str::to_string);
    }
}

impl DeviceEnumerator for MockEnumerator {
    fn enumerate(&self, role: DeviceRole) -> Result<Vec<WireDevice>, DeviceError> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(DeviceError::Enumeration(reason));
        }
        Ok(match role {
            DeviceRole::Input => self.inputs.lock().clone(),
            DeviceRole::Output => self.outputs.lock().clone(),
        })
    }
}

fn to_wire(names: &[&str]) -> Vec<WireDevice> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| WireDevice::new(*name, i == 0))
        .collect()
}
