//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use mgmd_utils::bus::{BusMsg, MembershipAction, ProtocolPacket};
use tracing::{debug, debug_span};

use crate::group::FilterMode;
use crate::version::Version;

// mgmd debug messages.
#[derive(Debug)]
pub enum Debug<'a, V: Version> {
    InstanceCreate,
    InstanceDelete,
    InstanceStart,
    InstanceStop(InstanceInactiveReason),
    InstanceStatusChange(&'a str),
    InterfaceCreate(&'a str),
    InterfaceDelete(&'a str),
    InterfaceStart(&'a str),
    InterfaceStop(&'a str, InterfaceInactiveReason),
    QuerierElect(&'a str, &'a V::IpAddr),
    QuerierResign(&'a str, &'a V::IpAddr),
    PacketRx(&'a str, &'a V::IpAddr, &'a ProtocolPacket),
    PacketTx(&'a str, &'a ProtocolPacket),
    GroupCreate(&'a V::IpAddr),
    GroupDelete(&'a V::IpAddr),
    GroupFilterModeChange(&'a V::IpAddr, FilterMode, FilterMode),
    GroupTimerExpiry(&'a V::IpAddr),
    SourceTimerExpiry(&'a V::IpAddr, &'a V::IpAddr),
    MembershipNotify(&'a str, &'a V::IpAddr, &'a V::IpAddr, MembershipAction),
    ServiceRequestTx(&'a str),
    ServiceRetry(&'a str),
    BusRx(&'a BusMsg),
}

// Reason why an instance is inactive.
#[derive(Clone, Copy, Debug)]
pub enum InstanceInactiveReason {
    AdminDown,
    ServiceDown,
}

// Reason why the membership protocol is inactive on an interface.
#[derive(Clone, Copy, Debug)]
pub enum InterfaceInactiveReason {
    InstanceDown,
    AdminDown,
    OperationalDown,
    MulticastNotSupported,
    MissingIfindex,
    MissingIpAddress,
}

// ===== impl Debug =====

impl<'a, V> Debug<'a, V>
where
    V: Version,
{
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::InstanceCreate
            | Debug::InstanceDelete
            | Debug::InstanceStart => {
                // Parent span(s): mgmd-instance
                debug!("{}", self);
            }
            Debug::InstanceStop(reason) => {
                // Parent span(s): mgmd-instance
                debug!(%reason, "{}", self);
            }
            Debug::InstanceStatusChange(status) => {
                // Parent span(s): mgmd-instance
                debug!(%status, "{}", self);
            }
            Debug::InterfaceCreate(name)
            | Debug::InterfaceDelete(name)
            | Debug::InterfaceStart(name) => {
                // Parent span(s): mgmd-instance
                debug_span!("interface", %name).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::InterfaceStop(name, reason) => {
                // Parent span(s): mgmd-instance
                debug_span!("interface", %name).in_scope(|| {
                    debug!(%reason, "{}", self);
                });
            }
            Debug::QuerierElect(name, addr)
            | Debug::QuerierResign(name, addr) => {
                // Parent span(s): mgmd-instance
                debug_span!("interface", %name).in_scope(|| {
                    debug!(address = %addr, "{}", self);
                });
            }
            Debug::PacketRx(ifname, source, packet) => {
                // Parent span(s): mgmd-instance
                debug_span!("network").in_scope(|| {
                    debug_span!("input", interface = %ifname, %source)
                        .in_scope(|| {
                            let data =
                                serde_json::to_string(&packet).unwrap();
                            debug!(%data, "{}", self);
                        });
                });
            }
            Debug::PacketTx(ifname, packet) => {
                // Parent span(s): mgmd-instance
                debug_span!("network").in_scope(|| {
                    debug_span!("output", interface = %ifname).in_scope(
                        || {
                            let data =
                                serde_json::to_string(&packet).unwrap();
                            debug!(%data, "{}", self);
                        },
                    );
                });
            }
            Debug::GroupCreate(group)
            | Debug::GroupDelete(group)
            | Debug::GroupTimerExpiry(group) => {
                // Parent span(s): mgmd-instance
                debug!(%group, "{}", self);
            }
            Debug::GroupFilterModeChange(group, old_mode, new_mode) => {
                // Parent span(s): mgmd-instance
                debug!(%group, %old_mode, %new_mode, "{}", self);
            }
            Debug::SourceTimerExpiry(group, source) => {
                // Parent span(s): mgmd-instance
                debug!(%group, %source, "{}", self);
            }
            Debug::MembershipNotify(ifname, source, group, action) => {
                // Parent span(s): mgmd-instance
                debug!(interface = %ifname, %source, %group, %action, "{}", self);
            }
            Debug::ServiceRequestTx(operation)
            | Debug::ServiceRetry(operation) => {
                // Parent span(s): mgmd-instance
                debug!(%operation, "{}", self);
            }
            Debug::BusRx(msg) => {
                // Parent span(s): mgmd-instance
                debug!(?msg, "{}", self);
            }
        }
    }
}

impl<'a, V> std::fmt::Display for Debug<'a, V>
where
    V: Version,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InstanceCreate => {
                write!(f, "instance created")
            }
            Debug::InstanceDelete => {
                write!(f, "instance deleted")
            }
            Debug::InstanceStart => {
                write!(f, "starting instance")
            }
            Debug::InstanceStop(..) => {
                write!(f, "stopping instance")
            }
            Debug::InstanceStatusChange(..) => {
                write!(f, "instance status change")
            }
            Debug::InterfaceCreate(..) => {
                write!(f, "interface created")
            }
            Debug::InterfaceDelete(..) => {
                write!(f, "interface deleted")
            }
            Debug::InterfaceStart(..) => {
                write!(f, "starting interface")
            }
            Debug::InterfaceStop(..) => {
                write!(f, "stopping interface")
            }
            Debug::QuerierElect(..) => {
                write!(f, "acting as querier")
            }
            Debug::QuerierResign(..) => {
                write!(f, "other querier elected")
            }
            Debug::PacketRx(..) | Debug::PacketTx(..) => {
                write!(f, "packet")
            }
            Debug::GroupCreate(..) => {
                write!(f, "group created")
            }
            Debug::GroupDelete(..) => {
                write!(f, "group deleted")
            }
            Debug::GroupFilterModeChange(..) => {
                write!(f, "group filter mode change")
            }
            Debug::GroupTimerExpiry(..) => {
                write!(f, "group timer expired")
            }
            Debug::SourceTimerExpiry(..) => {
                write!(f, "source timer expired")
            }
            Debug::MembershipNotify(..) => {
                write!(f, "notifying downstream protocols")
            }
            Debug::ServiceRequestTx(..) => {
                write!(f, "service request")
            }
            Debug::ServiceRetry(..) => {
                write!(f, "service request retry scheduled")
            }
            Debug::BusRx(..) => {
                write!(f, "bus message")
            }
        }
    }
}

// ===== impl InstanceInactiveReason =====

impl std::fmt::Display for InstanceInactiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceInactiveReason::AdminDown => {
                write!(f, "administrative status down")
            }
            InstanceInactiveReason::ServiceDown => {
                write!(f, "essential service died")
            }
        }
    }
}

// ===== impl InterfaceInactiveReason =====

impl std::fmt::Display for InterfaceInactiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterfaceInactiveReason::InstanceDown => {
                write!(f, "instance down")
            }
            InterfaceInactiveReason::AdminDown => {
                write!(f, "administrative status down")
            }
            InterfaceInactiveReason::OperationalDown => {
                write!(f, "operational status down")
            }
            InterfaceInactiveReason::MulticastNotSupported => {
                write!(f, "multicast not supported")
            }
            InterfaceInactiveReason::MissingIfindex => {
                write!(f, "missing ifindex")
            }
            InterfaceInactiveReason::MissingIpAddress => {
                write!(f, "missing IP address")
            }
        }
    }
}
