//! Time server resources

use super::nethelpers::ConfigLayer;
use serde::{Deserialize, Serialize};

/// Well-known id of the final time server spec and status
pub const TIME_SERVER_ID: &str = "timeservers";

/// Desired NTP servers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeServerSpec {
    pub ntp_servers: Vec<String>,
    pub config_layer: ConfigLayer,
}

/// Applied NTP servers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeServerStatus {
    pub ntp_servers: Vec<String>,
}
