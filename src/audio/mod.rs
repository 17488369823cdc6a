//! Audio device subsystem

pub mod device;
pub mod mock;

pub use device::{CpalEnumerator, DeviceEnumerator, StaticEnumerator};
pub use mock::MockEnumerator;
