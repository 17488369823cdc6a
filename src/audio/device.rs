//! Audio device enumeration

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::DeviceError;
use crate::protocol::{DeviceRole, WireDevice};

/// Lists the local devices of one role.
///
/// Called on a blocking thread; implementations may take their time.
pub trait DeviceEnumerator: Send + Sync + 'static {
    fn enumerate(&self, role: DeviceRole) -> Result<Vec<WireDevice>, DeviceError>;
}

/// Enumerates devices of the default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalEnumerator;

impl CpalEnumerator {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceEnumerator for CpalEnumerator {
    fn enumerate(&self, role: DeviceRole) -> Result<Vec<WireDevice>, DeviceError> {
        let host = cpal::default_host();

        let (default_name, devices) = match role {
            DeviceRole::Input => (
                host.default_input_device().and_then(|d| d.name().ok()),
                host.input_devices(),
            ),
            DeviceRole::Output => (
                host.default_output_device().and_then(|d| d.name().ok()),
                host.output_devices(),
            ),
        };
        let devices = devices.map_err(|e| DeviceError::Enumeration(e.to_string()))?;

        let mut listed = Vec::new();
        for device in devices {
            // devices that cannot report a name cannot be addressed either
            match device.name() {
                Ok(name) => {
                    let is_default = default_name.as_ref() == Some(&name);
                    listed.push(WireDevice { name, is_default });
                }
                Err(e) => tracing::debug!("Skipping unnamed {:?} device: {}", role, e),
            }
        }

        tracing::debug!("Enumerated {} {:?} devices on {:?}", listed.len(), role, host.id());
        Ok(listed)
    }
}

/// Fixed device lists, for headless hosts
#[derive(Debug, Default, Clone)]
pub struct StaticEnumerator {
    pub inputs: Vec<WireDevice>,
    pub outputs: Vec<WireDevice>,
}

impl StaticEnumerator {
    pub fn new(inputs: Vec<WireDevice>, outputs: Vec<WireDevice>) -> Self {
        Self { inputs, outputs }
    }

    /// Build from plain names; the first of each list is the default
    pub fn from_names(inputs: &[&str], outputs: &[&str]) -> Self {
        let wire = |names: &[&str]| {
            names
                .iter()
                .enumerate()
                .map(|(i, name)| WireDevice::new(*name, i == 0))
                .collect()
        };
        Self::new(wire(inputs), wire(outputs))
    }
}

impl DeviceEnumerator for StaticEnumerator {
    fn enumerate(&self, role: DeviceRole) -> Result<Vec<WireDevice>, DeviceError> {
        Ok(match role {
            DeviceRole::Input => self.inputs.clone(),
            DeviceRole::Output => self.outputs.clone(),
        })
    }
}
