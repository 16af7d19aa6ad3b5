//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consts;
use crate::debug::InterfaceInactiveReason;
use crate::error::Error;
use crate::instance::Instance;
use crate::version::Version;

// ===== configuration structs =====

#[derive(Debug)]
pub struct InstanceCfg {
    pub enabled: bool,
    // Service class names resolved through the finder.
    pub fea_target: String,
    pub mfea_target: String,
    pub trace_opts: TraceOptions,
}

// Interface configuration. All changes take effect immediately;
// derived intervals are recomputed on the fly.
#[derive(Debug)]
pub struct InterfaceCfg {
    pub enabled: bool,
    pub version: u8,
    pub ip_router_alert_option_check: bool,
    pub query_interval: Duration,
    pub query_last_member_interval: Duration,
    pub query_response_interval: Duration,
    pub robustness_variable: u8,
}

#[derive(Clone, Copy, Debug, Default)]
#[derive(Deserialize, Serialize)]
pub struct TraceOptions {
    pub packets_rx: bool,
    pub packets_tx: bool,
    pub ibus: bool,
}

// Configuration requests received from the management plane.
#[derive(Debug)]
pub enum ConfigRequest {
    InstanceEnable {
        enabled: bool,
    },
    InterfaceCreate {
        ifname: String,
    },
    InterfaceDelete {
        ifname: String,
    },
    InterfaceEnable {
        ifname: String,
        enabled: bool,
    },
    InterfaceVersion {
        ifname: String,
        version: u8,
    },
    InterfaceRouterAlertCheck {
        ifname: String,
        enabled: bool,
    },
    InterfaceQueryInterval {
        ifname: String,
        interval: Duration,
    },
    InterfaceQueryLastMemberInterval {
        ifname: String,
        interval: Duration,
    },
    InterfaceQueryResponseInterval {
        ifname: String,
        interval: Duration,
    },
    InterfaceRobustnessVariable {
        ifname: String,
        robustness: u8,
    },
    TraceOptions {
        options: TraceOptions,
    },
}

// ===== impl InstanceCfg =====

impl Default for InstanceCfg {
    fn default() -> InstanceCfg {
        InstanceCfg {
            enabled: false,
            fea_target: "fea".to_owned(),
            mfea_target: "mfea".to_owned(),
            trace_opts: Default::default(),
        }
    }
}

// ===== impl InterfaceCfg =====

impl InterfaceCfg {
    pub(crate) fn new(version: u8) -> InterfaceCfg {
        InterfaceCfg {
            enabled: true,
            version,
            ip_router_alert_option_check: false,
            query_interval: consts::QUERY_INTERVAL,
            query_last_member_interval: consts::QUERY_LAST_MEMBER_INTERVAL,
            query_response_interval: consts::QUERY_RESPONSE_INTERVAL,
            robustness_variable: consts::ROBUSTNESS_VARIABLE,
        }
    }

    // Derived timing parameters (RFC 3376 Section 8,
    // RFC 3810 Section 9).

    pub fn group_membership_interval(&self) -> Duration {
        self.query_interval * self.robustness_variable as u32
            + self.query_response_interval
    }

    pub fn other_querier_present_interval(&self) -> Duration {
        self.query_interval * self.robustness_variable as u32
            + self.query_response_interval / 2
    }

    pub fn startup_query_interval(&self) -> Duration {
        self.query_interval / 4
    }

    pub fn startup_query_count(&self) -> u8 {
        self.robustness_variable
    }

    pub fn last_member_query_count(&self) -> u8 {
        self.robustness_variable
    }

    pub fn last_member_query_time(&self) -> Duration {
        self.query_last_member_interval
            * self.last_member_query_count() as u32
    }

    pub fn older_version_host_present_interval(&self) -> Duration {
        self.group_membership_interval()
    }
}

// ===== global functions =====

pub(crate) fn process<V>(
    instance: &mut Instance<V>,
    request: ConfigRequest,
) -> Result<(), Error>
where
    V: Version,
{
    match request {
        ConfigRequest::InstanceEnable { enabled } => {
            instance.config.enabled = enabled;
            instance.update();
        }
        ConfigRequest::InterfaceCreate { ifname } => {
            instance.interfaces.add(&ifname);
            if let Some((mut up, interfaces)) = instance.as_up() {
                let (_, iface) =
                    interfaces.get_mut_by_name(&ifname).unwrap();
                iface.update(&mut up);
            }
        }
        ConfigRequest::InterfaceDelete { ifname } => {
            let Some((iface_idx, _)) = instance.interfaces.get_by_name(&ifname)
            else {
                return Err(Error::InterfaceUnknown(ifname));
            };
            if let Some((mut up, interfaces)) = instance.as_up() {
                interfaces[iface_idx]
                    .stop(&mut up, InterfaceInactiveReason::AdminDown);
            }
            instance.interfaces.delete(iface_idx);
        }
        ConfigRequest::InterfaceEnable { ifname, enabled } => {
            {
                let Some((_, iface)) =
                    instance.interfaces.get_mut_by_name(&ifname)
                else {
                    return Err(Error::InterfaceUnknown(ifname));
                };
                iface.config.enabled = enabled;
            }
            if let Some((mut up, interfaces)) = instance.as_up() {
                let (_, iface) =
                    interfaces.get_mut_by_name(&ifname).unwrap();
                iface.update(&mut up);
            }
        }
        ConfigRequest::InterfaceVersion { ifname, version } => {
            if version < V::VERSION_MIN || version > V::VERSION_MAX {
                return Err(Error::VersionOutOfRange(version));
            }
            let Some((_, iface)) = instance.interfaces.get_mut_by_name(&ifname)
            else {
                return Err(Error::InterfaceUnknown(ifname));
            };
            iface.config.version = version;
        }
        ConfigRequest::InterfaceRouterAlertCheck { ifname, enabled } => {
            let Some((_, iface)) = instance.interfaces.get_mut_by_name(&ifname)
            else {
                return Err(Error::InterfaceUnknown(ifname));
            };
            iface.config.ip_router_alert_option_check = enabled;
        }
        ConfigRequest::InterfaceQueryInterval { ifname, interval } => {
            let Some((_, iface)) = instance.interfaces.get_mut_by_name(&ifname)
            else {
                return Err(Error::InterfaceUnknown(ifname));
            };
            iface.config.query_interval = interval;

            // Re-arm the General Query timer unless the startup burst
            // is still in progress.
            if iface.state.active && iface.state.startup_query_count == 0 {
                if let Some(timer) = iface.state.general_query_timer.as_mut()
                {
                    timer.reset(Some(interval));
                }
            }
        }
        ConfigRequest::InterfaceQueryLastMemberInterval { ifname, interval } => {
            let Some((_, iface)) = instance.interfaces.get_mut_by_name(&ifname)
            else {
                return Err(Error::InterfaceUnknown(ifname));
            };
            iface.config.query_last_member_interval = interval;
        }
        ConfigRequest::InterfaceQueryResponseInterval { ifname, interval } => {
            let Some((_, iface)) = instance.interfaces.get_mut_by_name(&ifname)
            else {
                return Err(Error::InterfaceUnknown(ifname));
            };
            iface.config.query_response_interval = interval;
        }
        ConfigRequest::InterfaceRobustnessVariable { ifname, robustness } => {
            let Some((_, iface)) = instance.interfaces.get_mut_by_name(&ifname)
            else {
                return Err(Error::InterfaceUnknown(ifname));
            };
            iface.config.robustness_variable = robustness;
        }
        ConfigRequest::TraceOptions { options } => {
            instance.config.trace_opts = options;
        }
    }

    Ok(())
}
