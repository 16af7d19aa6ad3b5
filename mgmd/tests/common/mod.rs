//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(dead_code)]

use std::net::IpAddr;

use mgmd::instance::{
    self, Instance, InstanceChannelsTx, ProtocolInputChannelsRx,
};
use mgmd::northbound::configuration::ConfigRequest;
use mgmd::northbound::{self, Request};
use mgmd::version::Version;
use mgmd_utils::bus::{
    BusChannelsTx, BusMsg, FeaReplyMsg, FeaRequest, FeaRequestMsg,
    FeaRxPacketMsg, FinderReplyMsg, FinderRequestMsg, MembershipAction,
    MembershipMsg, MembershipReplyMsg, ProtocolPacket, ProtocolSubscribeMsg,
    QueryPacket, ReportOlderPacket, ReportPacket, ReportRecord,
    ReportRecordType, ServiceError,
};
use mgmd_utils::southbound::{
    AddressFlags, AddressMsg, InterfaceFlags, InterfaceUpdateMsg,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;

pub struct TestNode<V: Version> {
    pub instance: Instance<V>,
    pub fea_rx: UnboundedReceiver<FeaRequestMsg>,
    pub finder_rx: UnboundedReceiver<FinderRequestMsg>,
    _protocol_input_rx: ProtocolInputChannelsRx<V>,
}

// Creates an enabled instance wired to test channels.
pub fn setup<V>() -> TestNode<V>
where
    V: Version,
{
    let (fea_tx, fea_rx) = mpsc::unbounded_channel();
    let (finder_tx, finder_rx) = mpsc::unbounded_channel();
    let (protocol_input_tx, protocol_input_rx) =
        instance::protocol_input_channels::<V>();

    let channels_tx = InstanceChannelsTx::new(
        BusChannelsTx::new(fea_tx, finder_tx),
        protocol_input_tx,
    );
    let mut instance = Instance::<V>::new("test".to_owned(), channels_tx);
    instance.config.enabled = true;
    instance.init();

    TestNode {
        instance,
        fea_rx,
        finder_rx,
        _protocol_input_rx: protocol_input_rx,
    }
}

// Acknowledges every pending service request with a success reply and
// returns the requests seen on the FEA channel.
pub fn ack_service_requests<V>(node: &mut TestNode<V>) -> Vec<FeaRequest>
where
    V: Version,
{
    let mut requests = Vec::new();

    loop {
        let mut progress = false;
        while let Ok(msg) = node.finder_rx.try_recv() {
            node.instance.process_bus_msg(BusMsg::FinderReply(
                FinderReplyMsg {
                    request_id: msg.request_id,
                    result: Ok(()),
                },
            ));
            progress = true;
        }
        while let Ok(msg) = node.fea_rx.try_recv() {
            requests.push(msg.request.clone());
            node.instance.process_bus_msg(BusMsg::FeaReply(FeaReplyMsg {
                request_id: msg.request_id,
                result: Ok(()),
            }));
            progress = true;
        }
        if !progress {
            break;
        }
    }

    requests
}

// Acknowledges every pending service request with the given error.
pub fn nack_service_requests<V>(node: &mut TestNode<V>, error: ServiceError)
where
    V: Version,
{
    while let Ok(msg) = node.fea_rx.try_recv() {
        node.instance.process_bus_msg(BusMsg::FeaReply(FeaReplyMsg {
            request_id: msg.request_id,
            result: Err(error.clone()),
        }));
    }
}

pub fn config<V>(node: &mut TestNode<V>, request: ConfigRequest)
where
    V: Version,
{
    northbound::process_request(&mut node.instance, Request::Config(request));
}

// Configures an interface and feeds the matching mirror updates so it
// comes up.
pub fn bring_up_interface<V>(
    node: &mut TestNode<V>,
    ifname: &str,
    ifindex: u32,
    addr: &str,
) where
    V: Version,
{
    config(
        node,
        ConfigRequest::InterfaceCreate {
            ifname: ifname.to_owned(),
        },
    );
    node.instance
        .process_bus_msg(BusMsg::InterfaceUpd(InterfaceUpdateMsg {
            ifname: ifname.to_owned(),
            ifindex,
            mtu: 1500,
            flags: InterfaceFlags::OPERATIVE
                | InterfaceFlags::MULTICAST
                | InterfaceFlags::BROADCAST,
        }));
    node.instance
        .process_bus_msg(BusMsg::InterfaceAddressAdd(AddressMsg {
            ifname: ifname.to_owned(),
            addr: addr.parse().unwrap(),
            flags: AddressFlags::empty(),
            peer: None,
        }));
    node.instance.process_bus_msg(BusMsg::InterfaceTreeComplete);
    ack_service_requests(node);
}

// Registers a downstream protocol subscriber and returns its
// notification channel.
pub fn subscribe<V>(
    node: &mut TestNode<V>,
    module_name: &str,
    ifindex: u32,
) -> UnboundedReceiver<MembershipMsg>
where
    V: Version,
{
    let (tx, rx) = mpsc::unbounded_channel();
    node.instance.process_bus_msg(BusMsg::ProtocolSubscribe(
        ProtocolSubscribeMsg {
            module_name: module_name.to_owned(),
            ifindex,
            tx: Some(tx),
        },
    ));
    rx
}

// Collects the pending membership notifications, acknowledging each
// one so the queue keeps draining.
pub fn drain_notifications<V>(
    node: &mut TestNode<V>,
    rx: &mut UnboundedReceiver<MembershipMsg>,
) -> Vec<(IpAddr, IpAddr, MembershipAction)>
where
    V: Version,
{
    let mut notifications = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        notifications.push((msg.source, msg.group, msg.action));
        node.instance.process_bus_msg(BusMsg::MembershipReply(
            MembershipReplyMsg {
                request_id: msg.request_id,
                result: Ok(()),
            },
        ));
    }
    notifications
}

// Collects the pending FEA requests without replying to them.
pub fn pending_fea_requests<V>(node: &mut TestNode<V>) -> Vec<FeaRequest>
where
    V: Version,
{
    let mut requests = Vec::new();
    while let Ok(msg) = node.fea_rx.try_recv() {
        requests.push(msg.request);
    }
    requests
}

// ===== packet injection =====

pub fn recv_packet<V>(
    node: &mut TestNode<V>,
    ifname: &str,
    ifindex: u32,
    src: IpAddr,
    packet: ProtocolPacket,
) where
    V: Version,
{
    recv_packet_raw(node, ifname, ifindex, src, 1, true, packet);
}

pub fn recv_packet_raw<V>(
    node: &mut TestNode<V>,
    ifname: &str,
    ifindex: u32,
    src: IpAddr,
    ttl: u8,
    router_alert: bool,
    packet: ProtocolPacket,
) where
    V: Version,
{
    node.instance
        .process_bus_msg(BusMsg::FeaRxPacket(FeaRxPacketMsg {
            ifname: ifname.to_owned(),
            ifindex,
            src,
            dst: src,
            ip_protocol: V::IP_PROTOCOL,
            ttl,
            tos: 0xc0,
            router_alert,
            internet_control: true,
            packet,
        }));
}

pub fn report_record(
    record_type: ReportRecordType,
    group: IpAddr,
    sources: &[IpAddr],
) -> ReportRecord {
    ReportRecord {
        record_type,
        group,
        sources: sources.iter().copied().collect(),
    }
}

pub fn v3_report(records: Vec<ReportRecord>) -> ProtocolPacket {
    ProtocolPacket::Report(ReportPacket {
        version: 3,
        records,
    })
}

pub fn older_report(version: u8, group: IpAddr) -> ProtocolPacket {
    ProtocolPacket::ReportOlder(ReportOlderPacket { version, group })
}

pub fn general_query(version: u8, group: IpAddr) -> ProtocolPacket {
    ProtocolPacket::Query(QueryPacket {
        version,
        group,
        sources: Default::default(),
        max_resp_time: std::time::Duration::from_secs(10),
        suppress_router_processing: false,
    })
}
