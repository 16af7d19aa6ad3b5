//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use serde::Deserialize;

// Daemon configuration file contents.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub name: String,
    // "ipv4" runs IGMP, "ipv6" runs MLD.
    pub family: Family,
    pub enabled: bool,
    pub fea_target: String,
    pub mfea_target: String,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Ipv4,
    Ipv6,
}

#[derive(Debug, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub version: Option<u8>,
    #[serde(default)]
    pub router_alert_check: bool,
    // Timing parameters, in seconds.
    pub query_interval: Option<u64>,
    pub query_last_member_interval: Option<u64>,
    pub query_response_interval: Option<u64>,
    pub robustness_variable: Option<u8>,
}

// ===== impl Config =====

impl Config {
    pub fn load(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&data)?;
        Ok(config)
    }
}

// ===== impl InstanceConfig =====

impl Default for InstanceConfig {
    fn default() -> InstanceConfig {
        InstanceConfig {
            name: "main".to_owned(),
            family: Family::Ipv4,
            enabled: true,
            fea_target: "fea".to_owned(),
            mfea_target: "mfea".to_owned(),
        }
    }
}

// ===== helper functions =====

fn default_socket_path() -> String {
    "/var/run/mgmd.sock".to_owned()
}

fn default_true() -> bool {
    true
}
