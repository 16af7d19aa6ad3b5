//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use mgmd_utils::bus::ServiceError;
use tracing::{debug, error, warn};

// mgmd errors.
#[derive(Debug)]
pub enum Error {
    InterfaceUnknown(String),
    VersionOutOfRange(u8),
    // Packet validation failures. These never mutate state and are
    // logged at debug level only.
    PacketBadIpProtocol(IpAddr, u8),
    PacketBadTtl(IpAddr, u8),
    PacketMissingRouterAlert(IpAddr),
    PacketBadSourceAddress(IpAddr),
    PacketBadGroupAddress(IpAddr),
    // Service failures.
    ServiceFatal(&'static str, ServiceError),
    ServiceDeath(String),
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::InterfaceUnknown(name) => {
                warn!(%name, "{}", self);
            }
            Error::VersionOutOfRange(version) => {
                warn!(%version, "{}", self);
            }
            Error::PacketBadIpProtocol(source, ip_protocol) => {
                debug!(%source, %ip_protocol, "{}", self);
            }
            Error::PacketBadTtl(source, ttl) => {
                debug!(%source, %ttl, "{}", self);
            }
            Error::PacketMissingRouterAlert(source)
            | Error::PacketBadSourceAddress(source) => {
                debug!(%source, "{}", self);
            }
            Error::PacketBadGroupAddress(group) => {
                debug!(%group, "{}", self);
            }
            Error::ServiceFatal(operation, error) => {
                error!(%operation, %error, "{}", self);
            }
            Error::ServiceDeath(class) => {
                error!(%class, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InterfaceUnknown(..) => {
                write!(f, "unknown interface")
            }
            Error::VersionOutOfRange(..) => {
                write!(f, "protocol version out of range")
            }
            Error::PacketBadIpProtocol(..) => {
                write!(f, "unexpected IP protocol")
            }
            Error::PacketBadTtl(..) => {
                write!(f, "invalid TTL")
            }
            Error::PacketMissingRouterAlert(..) => {
                write!(f, "missing router alert option")
            }
            Error::PacketBadSourceAddress(..) => {
                write!(f, "invalid source address")
            }
            Error::PacketBadGroupAddress(..) => {
                write!(f, "invalid group address")
            }
            Error::ServiceFatal(..) => {
                write!(f, "fatal service error")
            }
            Error::ServiceDeath(..) => {
                write!(f, "essential service died")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ServiceFatal(_, error) => Some(error),
            _ => None,
        }
    }
}
