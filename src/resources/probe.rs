//! Probe resources

use super::nethelpers::ConfigLayer;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// TCP dial parameters
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpProbeSpec {
    pub endpoint: String,
    pub timeout: Duration,
}

/// Periodic connectivity probe
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeSpec {
    pub interval: Duration,
    pub failure_threshold: u32,
    pub tcp: TcpProbeSpec,
    pub config_layer: ConfigLayer,
}

impl ProbeSpec {
    /// Probe ids are derived from content: `tcp:{endpoint}`
    pub fn id(&self) -> String {
        format!("tcp:{}", self.tcp.endpoint)
    }
}

/// Latest probe outcome
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeStatus {
    pub success: bool,
    pub last_error: String,
}
