//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

// IP protocol numbers carried in FEA receiver registrations.
pub const IGMP_IP_PROTOCOL: u8 = 2;
pub const MLD_IP_PROTOCOL: u8 = 58;

// Protocol messages are link-local and never forwarded.
pub const PROTOCOL_TTL: u8 = 1;

// IP precedence used for transmitted protocol messages
// (internetwork control).
pub const PROTOCOL_TOS: u8 = 0xc0;

// Timer defaults (RFC 3376 Section 8, RFC 3810 Section 9).
pub const ROBUSTNESS_VARIABLE: u8 = 2;
pub const QUERY_INTERVAL: Duration = Duration::from_secs(125);
pub const QUERY_RESPONSE_INTERVAL: Duration = Duration::from_secs(10);
pub const QUERY_LAST_MEMBER_INTERVAL: Duration = Duration::from_secs(1);

// Back-off before a failed service request is dispatched again.
pub const SERVICE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

// Well-known IPv4 multicast group addresses.
pub const ALL_SYSTEMS_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
pub const ALL_ROUTERS_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);
pub const ALL_V3_ROUTERS_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

// Well-known IPv6 multicast group addresses.
pub const ALL_NODES_V6: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x0001);
pub const ALL_ROUTERS_V6: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x0002);
pub const ALL_V2_ROUTERS_V6: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x0016);
