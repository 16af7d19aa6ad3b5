//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
//
// Service request orchestration tests: queue discipline, retry
// behavior and outcome classification.
//

mod common;

use std::net::IpAddr;

use const_addrs::ip4;
use mgmd::northbound::configuration::ConfigRequest;
use mgmd::tasks::messages::input::FeaRetryTimeoutMsg;
use mgmd::tasks::messages::ProtocolInputMsg;
use mgmd::version::Igmp;
use mgmd_utils::bus::{
    BusMsg, FeaReplyMsg, FeaRequest, FinderReplyMsg, MembershipAction,
    ProtocolPacket, ReportRecordType, ServiceError,
};

use crate::common::*;

const IFNAME: &str = "eth0";
const IFINDEX: u32 = 1;

// At most one request is outstanding at any time; the next one is
// dispatched only once the head is acknowledged.
#[test]
fn sequential_dispatch() {
    let mut node = setup::<Igmp>();

    // Instance startup registers interest in the FEA first...
    let first = node.finder_rx.try_recv().unwrap();
    assert!(first.is_register);
    assert!(node.finder_rx.try_recv().is_err());

    // ...and in the MFEA right after the first request completes.
    node.instance
        .process_bus_msg(BusMsg::FinderReply(FinderReplyMsg {
            request_id: first.request_id,
            result: Ok(()),
        }));
    let second = node.finder_rx.try_recv().unwrap();
    assert!(second.is_register);
    assert_ne!(first.request_id, second.request_id);
    assert!(node.finder_rx.try_recv().is_err());
}

// A transient failure re-arms the retry timer and dispatches the same
// request again when it fires.
#[test]
fn transient_failure_retry() {
    let mut node = setup::<Igmp>();

    let first = node.finder_rx.try_recv().unwrap();
    node.instance
        .process_bus_msg(BusMsg::FinderReply(FinderReplyMsg {
            request_id: first.request_id,
            result: Err(ServiceError::ReplyTimedOut),
        }));

    // Nothing is dispatched until the retry timer fires.
    assert!(node.finder_rx.try_recv().is_err());
    {
        let state = node.instance.state.as_ref().unwrap();
        assert!(state.fea.retry_timer.is_some());
        assert!(state.fea.in_flight.is_none());
    }

    node.instance.process_protocol_msg(
        ProtocolInputMsg::FeaRetryTimeout(FeaRetryTimeoutMsg {}),
    );
    let retried = node.finder_rx.try_recv().unwrap();
    assert_eq!(retried.target, first.target);
    assert_ne!(retried.request_id, first.request_id);
}

// Receiver, join and send requests are held back until interest in
// the FEA has been registered.
#[test]
fn fea_registration_prerequisite() {
    let mut node = setup::<Igmp>();

    // Bring the interface up without acknowledging anything: the
    // receiver registration cannot be dispatched yet.
    config(
        &mut node,
        ConfigRequest::InterfaceCreate {
            ifname: IFNAME.to_owned(),
        },
    );
    node.instance.process_bus_msg(BusMsg::InterfaceUpd(
        mgmd_utils::southbound::InterfaceUpdateMsg {
            ifname: IFNAME.to_owned(),
            ifindex: IFINDEX,
            mtu: 1500,
            flags: mgmd_utils::southbound::InterfaceFlags::OPERATIVE
                | mgmd_utils::southbound::InterfaceFlags::MULTICAST,
        },
    ));
    node.instance.process_bus_msg(BusMsg::InterfaceAddressAdd(
        mgmd_utils::southbound::AddressMsg {
            ifname: IFNAME.to_owned(),
            addr: "192.0.2.10/24".parse().unwrap(),
            flags: mgmd_utils::southbound::AddressFlags::empty(),
            peer: None,
        },
    ));
    assert!(node.fea_rx.try_recv().is_err());

    // Acknowledge the interest registrations; the queued FEA requests
    // follow.
    let requests = ack_service_requests(&mut node);
    assert!(requests.iter().any(|request| matches!(
        request,
        FeaRequest::RegisterReceiver { ifname, .. } if ifname == IFNAME
    )));
    assert!(requests.iter().any(|request| matches!(
        request,
        FeaRequest::JoinMulticastGroup { group, .. }
            if *group == IpAddr::from(ip4!("224.0.0.2"))
    )));
    assert!(requests.iter().any(|request| matches!(
        request,
        FeaRequest::JoinMulticastGroup { group, .. }
            if *group == IpAddr::from(ip4!("224.0.0.22"))
    )));
}

// Teardown requests whose peer is unreachable are treated as
// completed.
#[test]
fn teardown_unreachable_is_success() {
    let mut node = setup::<Igmp>();
    bring_up_interface(&mut node, IFNAME, IFINDEX, "192.0.2.10/24");

    // Shut the interface down; the leave/unregister requests flow.
    config(
        &mut node,
        ConfigRequest::InterfaceEnable {
            ifname: IFNAME.to_owned(),
            enabled: false,
        },
    );

    // Answer every teardown request with a communication error; the
    // queue must still drain completely.
    let mut teardown_count = 0;
    while let Ok(msg) = node.fea_rx.try_recv() {
        teardown_count += 1;
        node.instance.process_bus_msg(BusMsg::FeaReply(FeaReplyMsg {
            request_id: msg.request_id,
            result: Err(ServiceError::NoFinder),
        }));
    }
    // Leave of the two router groups plus the receiver unregistration.
    assert_eq!(teardown_count, 3);

    let state = node.instance.state.as_ref().unwrap();
    assert!(state.fea.queue.is_empty());
    assert!(state.fea.in_flight.is_none());
}

// Protocol messages are not retried on transient failure.
#[test]
fn send_packet_not_retried() {
    let mut node = setup::<Igmp>();
    bring_up_interface(&mut node, IFNAME, IFINDEX, "192.0.2.10/24");
    let group = ip4!("232.5.5.5");
    let source = ip4!("10.1.1.1");

    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("10.0.0.6").into(),
        v3_report(vec![report_record(
            ReportRecordType::AllowNewSources,
            group.into(),
            &[source.into()],
        )]),
    );
    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("10.0.0.6").into(),
        v3_report(vec![report_record(
            ReportRecordType::BlockOldSources,
            group.into(),
            &[source.into()],
        )]),
    );

    // The outgoing query fails with a transient error: it is dropped,
    // not retried.
    let msg = node.fea_rx.try_recv().unwrap();
    assert!(matches!(
        msg.request,
        FeaRequest::SendPacket {
            packet: ProtocolPacket::Query(_),
            ..
        }
    ));
    node.instance.process_bus_msg(BusMsg::FeaReply(FeaReplyMsg {
        request_id: msg.request_id,
        result: Err(ServiceError::SendFailedTransient),
    }));

    let state = node.instance.state.as_ref().unwrap();
    assert!(state.fea.queue.is_empty());
    assert!(state.fea.retry_timer.is_none());
}

// A rejected join triggers a compensating leave.
#[test]
fn rejected_join_compensated() {
    let mut node = setup::<Igmp>();

    config(
        &mut node,
        ConfigRequest::InterfaceCreate {
            ifname: IFNAME.to_owned(),
        },
    );
    node.instance.process_bus_msg(BusMsg::InterfaceUpd(
        mgmd_utils::southbound::InterfaceUpdateMsg {
            ifname: IFNAME.to_owned(),
            ifindex: IFINDEX,
            mtu: 1500,
            flags: mgmd_utils::southbound::InterfaceFlags::OPERATIVE
                | mgmd_utils::southbound::InterfaceFlags::MULTICAST,
        },
    ));
    node.instance.process_bus_msg(BusMsg::InterfaceAddressAdd(
        mgmd_utils::southbound::AddressMsg {
            ifname: IFNAME.to_owned(),
            addr: "192.0.2.10/24".parse().unwrap(),
            flags: mgmd_utils::southbound::AddressFlags::empty(),
            peer: None,
        },
    ));

    // Acknowledge everything, but reject the join of the all-routers
    // group.
    let mut leave_seen = false;
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
            let result = match &msg.request {
                FeaRequest::JoinMulticastGroup { group, .. }
                    if *group == IpAddr::from(ip4!("224.0.0.2")) =>
                {
                    Err(ServiceError::CommandFailed("no such vif".to_owned()))
                }
                FeaRequest::LeaveMulticastGroup { group, .. }
                    if *group == IpAddr::from(ip4!("224.0.0.2")) =>
                {
                    leave_seen = true;
                    Ok(())
                }
                _ => Ok(()),
            };
            node.instance.process_bus_msg(BusMsg::FeaReply(FeaReplyMsg {
                request_id: msg.request_id,
                result,
            }));
            progress = true;
        }
        if !progress {
            break;
        }
    }

    assert!(leave_seen);
}

// The membership notification queue runs independently of the FEA
// queue.
#[test]
fn membership_queue_independence() {
    let mut node = setup::<Igmp>();
    bring_up_interface(&mut node, IFNAME, IFINDEX, "192.0.2.10/24");
    let mut notifications_rx = subscribe(&mut node, "pim", IFINDEX);
    let group = ip4!("239.1.2.3");

    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("10.0.0.5").into(),
        v3_report(vec![report_record(
            ReportRecordType::ModeIsExclude,
            group.into(),
            &[],
        )]),
    );

    // The notification arrives even though no pending FEA request has
    // been acknowledged.
    let notifications = drain_notifications(&mut node, &mut notifications_rx);
    assert_eq!(
        notifications,
        vec![(
            IpAddr::from(ip4!("0.0.0.0")),
            IpAddr::from(group),
            MembershipAction::Join
        )]
    );
}

// Interest registration completion drives the node toward readiness.
#[test]
fn startup_readiness() {
    let mut node = setup::<Igmp>();

    {
        let state = node.instance.state.as_ref().unwrap();
        assert_eq!(
            state.status,
            mgmd::instance::InstanceStatus::Startup
        );
    }

    ack_service_requests(&mut node);
    node.instance.process_bus_msg(BusMsg::InterfaceTreeComplete);

    let state = node.instance.state.as_ref().unwrap();
    assert_eq!(state.status, mgmd::instance::InstanceStatus::Running);
}
