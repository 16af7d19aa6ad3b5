//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
//
// Service bus shared by the membership daemon and its collaborators:
//
// - The forwarding engine abstraction (FEA), which owns the raw
//   sockets and the kernel multicast state, receives request messages
//   and answers each one with a reply message carrying the outcome.
// - The finder, which tracks the liveness of the other service
//   classes, receives interest (de)registrations and publishes
//   birth/death events.
// - Downstream multicast routing protocols subscribe to membership
//   notifications on a per-interface basis.
//
// All requests are correlated with their replies through an explicit
// request id. The daemon dispatches at most one request per stream at
// a time, so replies are observed in dispatch order.
//

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use derive_new::new;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::southbound::{AddressMsg, InterfaceUpdateMsg};

pub type BusSender = UnboundedSender<BusMsg>;
pub type BusReceiver = UnboundedReceiver<BusMsg>;

// Useful type definition(s).
pub type MembershipSender = UnboundedSender<MembershipMsg>;

// Outcome classes for service requests, patterned after the IPC error
// codes of the original routing toolkit.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ServiceError {
    // The peer received the request and rejected it.
    CommandFailed(String),
    // The naming service is unreachable.
    NoFinder,
    // The target could not be resolved.
    ResolveFailed,
    // The request could not be delivered.
    SendFailed,
    // The request arguments did not match the target method.
    BadArgs,
    // The target does not implement the requested method.
    NoSuchMethod,
    // The peer failed internally.
    InternalError,
    // The request was delivered but no reply arrived in time.
    ReplyTimedOut,
    // The request could not be delivered, but retrying may succeed.
    SendFailedTransient,
}

// ===== FEA messages =====

// Requests toward the forwarding engine abstraction.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum FeaRequest {
    RegisterReceiver {
        ifname: String,
        ifindex: u32,
        ip_protocol: u8,
        enable_multicast_loopback: bool,
    },
    UnregisterReceiver {
        ifname: String,
        ifindex: u32,
        ip_protocol: u8,
    },
    JoinMulticastGroup {
        ifname: String,
        ifindex: u32,
        ip_protocol: u8,
        group: IpAddr,
    },
    LeaveMulticastGroup {
        ifname: String,
        ifindex: u32,
        ip_protocol: u8,
        group: IpAddr,
    },
    SendPacket {
        ifname: String,
        ifindex: u32,
        src: IpAddr,
        dst: IpAddr,
        ip_protocol: u8,
        ttl: u8,
        tos: u8,
        router_alert: bool,
        internet_control: bool,
        packet: ProtocolPacket,
    },
}

#[derive(Clone, Debug, new)]
#[derive(Deserialize, Serialize)]
pub struct FeaRequestMsg {
    pub request_id: u64,
    pub request: FeaRequest,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct FeaReplyMsg {
    pub request_id: u64,
    pub result: Result<(), ServiceError>,
}

// Protocol packet received by the FEA on a registered interface,
// already decoded into a message descriptor.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct FeaRxPacketMsg {
    pub ifname: String,
    pub ifindex: u32,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub ip_protocol: u8,
    pub ttl: u8,
    pub tos: u8,
    pub router_alert: bool,
    pub internet_control: bool,
    pub packet: ProtocolPacket,
}

// ===== Protocol message descriptors =====
//
// The on-wire encoding is the FEA's business; the daemon consumes and
// produces parsed message descriptors.

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ProtocolPacket {
    Query(QueryPacket),
    Report(ReportPacket),
    ReportOlder(ReportOlderPacket),
    Leave(LeavePacket),
}

// Membership query (any version). A query with an unspecified group
// address is a General Query.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct QueryPacket {
    pub version: u8,
    pub group: IpAddr,
    pub sources: BTreeSet<IpAddr>,
    pub max_resp_time: Duration,
    pub suppress_router_processing: bool,
}

// IGMPv3/MLDv2 membership report.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ReportPacket {
    pub version: u8,
    pub records: Vec<ReportRecord>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ReportRecord {
    pub record_type: ReportRecordType,
    pub group: IpAddr,
    pub sources: BTreeSet<IpAddr>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ReportRecordType {
    ModeIsInclude,
    ModeIsExclude,
    ChangeToInclude,
    ChangeToExclude,
    AllowNewSources,
    BlockOldSources,
}

// IGMPv1/IGMPv2/MLDv1 membership report.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ReportOlderPacket {
    pub version: u8,
    pub group: IpAddr,
}

// IGMPv2 Leave Group / MLDv1 Done.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct LeavePacket {
    pub group: IpAddr,
}

// ===== Finder messages =====

#[derive(Clone, Debug, new)]
#[derive(Deserialize, Serialize)]
pub struct FinderRequestMsg {
    pub request_id: u64,
    pub target: String,
    pub is_register: bool,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct FinderReplyMsg {
    pub request_id: u64,
    pub result: Result<(), ServiceError>,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum FinderEventMsg {
    // Connection to the finder (re)established.
    Connected,
    // Connection to the finder lost.
    Disconnected,
    // A target class the daemon registered interest in was born.
    TargetBirth { class: String, instance: String },
    // A target class the daemon registered interest in died.
    TargetDeath { class: String, instance: String },
}

// ===== Membership notification messages =====

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum MembershipAction {
    Join,
    Prune,
}

// Notification toward one downstream multicast routing protocol. An
// unspecified source address denotes the group itself (ASM).
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct MembershipMsg {
    pub request_id: u64,
    pub ifname: String,
    pub ifindex: u32,
    pub source: IpAddr,
    pub group: IpAddr,
    pub action: MembershipAction,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct MembershipReplyMsg {
    pub request_id: u64,
    pub result: Result<(), ServiceError>,
}

// Downstream protocol (un)subscription to membership notifications on
// one interface.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct ProtocolSubscribeMsg {
    pub module_name: String,
    pub ifindex: u32,
    #[serde(skip)]
    pub tx: Option<MembershipSender>,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct ProtocolUnsubscribeMsg {
    pub module_name: String,
    pub ifindex: u32,
}

// ===== Bus messages =====

// Messages received by the daemon instance from its collaborators.
#[derive(Debug)]
#[derive(Deserialize, Serialize)]
pub enum BusMsg {
    // FEA request completion.
    FeaReply(FeaReplyMsg),
    // Protocol packet received by the FEA.
    FeaRxPacket(FeaRxPacketMsg),
    // Finder request completion.
    FinderReply(FinderReplyMsg),
    // Finder connectivity or target liveness event.
    FinderEvent(FinderEventMsg),
    // Membership notification completion.
    MembershipReply(MembershipReplyMsg),
    // Downstream protocol subscription.
    ProtocolSubscribe(ProtocolSubscribeMsg),
    // Downstream protocol unsubscription.
    ProtocolUnsubscribe(ProtocolUnsubscribeMsg),
    // Interface mirror update.
    InterfaceUpd(InterfaceUpdateMsg),
    // Interface mirror address addition.
    InterfaceAddressAdd(AddressMsg),
    // Interface mirror address deletion.
    InterfaceAddressDel(AddressMsg),
    // Interface mirror initial snapshot delivered.
    InterfaceTreeComplete,
}

// Transmit handles toward the external services.
#[derive(Clone, Debug, new)]
pub struct BusChannelsTx {
    pub fea: UnboundedSender<FeaRequestMsg>,
    pub finder: UnboundedSender<FinderRequestMsg>,
}

// ===== impl MembershipAction =====

impl std::fmt::Display for MembershipAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipAction::Join => write!(f, "join"),
            MembershipAction::Prune => write!(f, "prune"),
        }
    }
}

// ===== impl ServiceError =====

impl ServiceError {
    // A communication error meaning the peer is not reachable at the
    // moment. For teardown requests the work is considered done.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ServiceError::NoFinder
                | ServiceError::ResolveFailed
                | ServiceError::SendFailed
        )
    }

    // A transient delivery failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceError::ReplyTimedOut | ServiceError::SendFailedTransient
        )
    }

    // An error that indicates a programming or deployment mistake.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServiceError::BadArgs
                | ServiceError::NoSuchMethod
                | ServiceError::InternalError
        )
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::CommandFailed(reason) => {
                write!(f, "command failed: {}", reason)
            }
            ServiceError::NoFinder => write!(f, "no finder"),
            ServiceError::ResolveFailed => write!(f, "resolve failed"),
            ServiceError::SendFailed => write!(f, "send failed"),
            ServiceError::BadArgs => write!(f, "bad arguments"),
            ServiceError::NoSuchMethod => write!(f, "no such method"),
            ServiceError::InternalError => write!(f, "internal error"),
            ServiceError::ReplyTimedOut => write!(f, "reply timed out"),
            ServiceError::SendFailedTransient => {
                write!(f, "transient send failure")
            }
        }
    }
}

impl std::error::Error for ServiceError {}
