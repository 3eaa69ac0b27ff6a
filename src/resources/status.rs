//! Aggregate network status

use serde::{Deserialize, Serialize};

/// Well-known id of the aggregate status
pub const NETWORK_STATUS_ID: &str = "status";

/// Readiness bits consumed by external gates
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkStatus {
    pub address_ready: bool,
    pub connectivity_ready: bool,
    pub hostname_ready: bool,
    pub etc_files_ready: bool,
}

impl NetworkStatus {
    pub fn ready(&self) -> bool {
        self.address_ready && self.connectivity_ready && self.hostname_ready && self.etc_files_ready
    }
}
