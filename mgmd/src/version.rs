//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{Ipv4Network, Ipv6Network};
use mgmd_utils::ip::{AddressFamily, IpAddrKind, IpNetworkKind};
use mgmd_utils::protocol::Protocol;

use crate::consts;

// Address-family specific code.
//
// IGMP (IPv4) and MLD (IPv6) share one state engine; everything that
// differs between the two families is funneled through this trait.
pub trait Version
where
    Self: 'static + Send + Sync + Default + std::fmt::Debug,
{
    const PROTOCOL: Protocol;
    const ADDRESS_FAMILY: AddressFamily;

    // IP protocol number of the membership protocol messages.
    const IP_PROTOCOL: u8;

    // Supported protocol version range (IGMPv1..v3, MLDv1..v2).
    const VERSION_MIN: u8;
    const VERSION_MAX: u8;

    type IpAddr: IpAddrKind;
    type IpNetwork: IpNetworkKind<Self::IpAddr>;

    // Destination of General Queries.
    fn all_systems() -> Self::IpAddr;

    // Group joined by every multicast router on the link.
    fn all_routers() -> Self::IpAddr;

    // Group carrying source-list capable reports
    // (all-IGMPv3-routers / all-MLDv2-routers).
    fn source_list_routers() -> Self::IpAddr;
}

#[derive(Debug, Default)]
pub struct Igmp();

#[derive(Debug, Default)]
pub struct Mld();

// ===== impl Igmp =====

impl Version for Igmp {
    const PROTOCOL: Protocol = Protocol::IGMP;
    const ADDRESS_FAMILY: AddressFamily = AddressFamily::Ipv4;
    const IP_PROTOCOL: u8 = consts::IGMP_IP_PROTOCOL;
    const VERSION_MIN: u8 = 1;
    const VERSION_MAX: u8 = 3;

    type IpAddr = Ipv4Addr;
    type IpNetwork = Ipv4Network;

    fn all_systems() -> Ipv4Addr {
        consts::ALL_SYSTEMS_V4
    }

    fn all_routers() -> Ipv4Addr {
        consts::ALL_ROUTERS_V4
    }

    fn source_list_routers() -> Ipv4Addr {
        consts::ALL_V3_ROUTERS_V4
    }
}

// ===== impl Mld =====

impl Version for Mld {
    const PROTOCOL: Protocol = Protocol::MLD;
    const ADDRESS_FAMILY: AddressFamily = AddressFamily::Ipv6;
    const IP_PROTOCOL: u8 = consts::MLD_IP_PROTOCOL;
    const VERSION_MIN: u8 = 1;
    const VERSION_MAX: u8 = 2;

    type IpAddr = Ipv6Addr;
    type IpNetwork = Ipv6Network;

    fn all_systems() -> Ipv6Addr {
        consts::ALL_NODES_V6
    }

    fn all_routers() -> Ipv6Addr {
        consts::ALL_ROUTERS_V6
    }

    fn source_list_routers() -> Ipv6Addr {
        consts::ALL_V2_ROUTERS_V6
    }
}
