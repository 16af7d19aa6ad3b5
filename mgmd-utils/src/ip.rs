//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use num_derive::{FromPrimitive, ToPrimitive};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// Address Family identifier.
//
// IANA registry:
// http://www.iana.org/assignments/address-family-numbers
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum AddressFamily {
    Ipv4 = 1,
    Ipv6 = 2,
}

// Extension methods for IP addresses of a concrete address family.
pub trait IpAddrKind:
    std::fmt::Debug
    + std::fmt::Display
    + Clone
    + Copy
    + Eq
    + std::hash::Hash
    + Ord
    + PartialEq
    + PartialOrd
    + Send
    + Sync
    + DeserializeOwned
    + Serialize
    + Into<IpAddr>
{
    fn address_family() -> AddressFamily;

    // Returns the address of the given address family, if it matches.
    fn get(addr: IpAddr) -> Option<Self>;

    // Returns the unspecified address of this address family.
    //
    // Membership notifications use it as the "group itself" (ASM)
    // sentinel in the source field.
    fn unspecified() -> Self;

    fn is_unspecified(&self) -> bool;

    fn is_multicast(&self) -> bool;

    // Returns true if the address belongs to the link-local multicast
    // range, which is never subject to membership tracking.
    fn is_multicast_link_local(&self) -> bool;

    // Returns true if the address is acceptable as the source address
    // of a received protocol message.
    fn is_valid_source(&self) -> bool;
}

// Extension methods for IP networks of a concrete address family.
pub trait IpNetworkKind<I: IpAddrKind>:
    std::fmt::Debug
    + std::fmt::Display
    + Clone
    + Copy
    + Eq
    + Ord
    + PartialEq
    + PartialOrd
    + Send
    + Sync
    + DeserializeOwned
    + Serialize
{
    // Returns the network of the given address family, if it matches.
    fn get(net: IpNetwork) -> Option<Self>;

    // Returns the interface address within the network.
    fn ip(&self) -> I;

    // Checks whether the given address is covered by the network.
    fn contains(&self, addr: I) -> bool;
}

// ===== impl Ipv4Addr =====

impl IpAddrKind for Ipv4Addr {
    fn address_family() -> AddressFamily {
        AddressFamily::Ipv4
    }

    fn get(addr: IpAddr) -> Option<Ipv4Addr> {
        match addr {
            IpAddr::V4(addr) => Some(addr),
            _ => None,
        }
    }

    fn unspecified() -> Ipv4Addr {
        Ipv4Addr::UNSPECIFIED
    }

    fn is_unspecified(&self) -> bool {
        Ipv4Addr::is_unspecified(self)
    }

    fn is_multicast(&self) -> bool {
        Ipv4Addr::is_multicast(self)
    }

    fn is_multicast_link_local(&self) -> bool {
        // 224.0.0.0/24 is reserved for local protocol traffic.
        let octets = self.octets();
        octets[0] == 224 && octets[1] == 0 && octets[2] == 0
    }

    fn is_valid_source(&self) -> bool {
        !self.is_unspecified()
            && !Ipv4Addr::is_multicast(self)
            && !self.is_broadcast()
    }
}

// ===== impl Ipv6Addr =====

impl IpAddrKind for Ipv6Addr {
    fn address_family() -> AddressFamily {
        AddressFamily::Ipv6
    }

    fn get(addr: IpAddr) -> Option<Ipv6Addr> {
        match addr {
            IpAddr::V6(addr) => Some(addr),
            _ => None,
        }
    }

    fn unspecified() -> Ipv6Addr {
        Ipv6Addr::UNSPECIFIED
    }

    fn is_unspecified(&self) -> bool {
        Ipv6Addr::is_unspecified(self)
    }

    fn is_multicast(&self) -> bool {
        Ipv6Addr::is_multicast(self)
    }

    fn is_multicast_link_local(&self) -> bool {
        // ff02::/16 is the link-local multicast scope.
        let segments = self.segments();
        segments[0] == 0xff02
    }

    fn is_valid_source(&self) -> bool {
        // MLD messages are always sent with a link-local source
        // address (RFC 2710 Section 3, RFC 3810 Section 5).
        self.segments()[0] & 0xffc0 == 0xfe80
    }
}

// ===== impl Ipv4Network =====

impl IpNetworkKind<Ipv4Addr> for Ipv4Network {
    fn get(net: IpNetwork) -> Option<Ipv4Network> {
        match net {
            IpNetwork::V4(net) => Some(net),
            _ => None,
        }
    }

    fn ip(&self) -> Ipv4Addr {
        (*self).ip()
    }

    fn contains(&self, addr: Ipv4Addr) -> bool {
        (*self).contains(addr)
    }
}

// ===== impl Ipv6Network =====

impl IpNetworkKind<Ipv6Addr> for Ipv6Network {
    fn get(net: IpNetwork) -> Option<Ipv6Network> {
        match net {
            IpNetwork::V6(net) => Some(net),
            _ => None,
        }
    }

    fn ip(&self) -> Ipv6Addr {
        (*self).ip()
    }

    fn contains(&self, addr: Ipv6Addr) -> bool {
        (*self).contains(addr)
    }
}

// ===== impl AddressFamily =====

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "ipv4"),
            AddressFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}
