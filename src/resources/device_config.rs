//! Device configuration after selector resolution

use crate::machine::Device;
use serde::{Deserialize, Serialize};

/// Per-interface slice of machine configuration
/// (id = `{interface}/{device-index:03d}[/{match-index:03d}]`)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfigSpec {
    pub device: Device,
}

/// Device config id
pub fn device_config_id(interface: &str, device_index: usize, match_index: Option<usize>) -> String {
    match match_index {
        Some(m) => format!("{}/{:03}/{:03}", interface, device_index, m),
        None => format!("{}/{:03}", interface, device_index),
    }
}
