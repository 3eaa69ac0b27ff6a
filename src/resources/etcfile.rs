//! Rendered /etc files

use serde::{Deserialize, Serialize};

pub const ETC_HOSTS: &str = "hosts";
pub const ETC_RESOLV_CONF: &str = "resolv.conf";
pub const ETC_POD_RESOLV_CONF: &str = "pod-resolv.conf";

/// File contents to write (id = file name)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EtcFileSpec {
    pub contents: Vec<u8>,
    pub mode: u32,
}

/// Written file (id = file name)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EtcFileStatus {
    /// Version of the spec last written
    pub spec_version: u64,
}
