//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
//
// Report state machine tests, driven through the instance event
// handlers with inert timers (the "testing" feature).
//

mod common;

use std::net::IpAddr;

use const_addrs::{ip4, ip6};
use maplit::btreeset;
use mgmd::group::FilterMode;
use mgmd::interface::Interface;
use mgmd::northbound::configuration::ConfigRequest;
use mgmd::version::{Igmp, Mld, Version};
use mgmd_utils::bus::{
    FeaRequest, LeavePacket, MembershipAction, ProtocolPacket,
    ReportRecordType,
};

use crate::common::*;

const IFNAME: &str = "eth0";
const IFINDEX: u32 = 1;

fn setup_igmp() -> TestNode<Igmp> {
    let mut node = setup::<Igmp>();
    bring_up_interface(&mut node, IFNAME, IFINDEX, "192.0.2.10/24");
    node
}

fn with_iface<V, F>(node: &mut TestNode<V>, f: F)
where
    V: Version,
    F: FnOnce(&Interface<V>),
{
    let (_, iface) =
        node.instance.interfaces.get_by_ifindex(IFINDEX).unwrap();
    f(iface);
}

// Checks the structural invariants of every group record.
fn assert_invariants<V>(node: &mut TestNode<V>)
where
    V: Version,
{
    with_iface(node, |iface| {
        for (_, record) in iface.state.groups.iter() {
            assert!(!record.is_unused());
            match record.filter_mode {
                FilterMode::Include => {
                    assert!(record.dont_forward_sources.is_empty());
                    assert!(record.group_timer.is_none());
                    assert!(!record.forward_sources.is_empty());
                }
                FilterMode::Exclude => {
                    assert!(record.group_timer.is_some());
                }
            }
            for (_, source) in record.forward_sources.iter() {
                assert!(source.source_timer.is_some());
            }
            for (_, source) in record.dont_forward_sources.iter() {
                assert!(source.source_timer.is_none());
            }
        }
    });
}

// A v2-style join creates an EXCLUDE-mode record for the whole group
// and notifies the downstream protocols once.
#[test]
fn asm_join() {
    let mut node = setup_igmp();
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

    with_iface(&mut node, |iface| {
        let record = iface.state.groups.get(&group).unwrap();
        assert_eq!(record.filter_mode, FilterMode::Exclude);
        assert!(record.group_timer.is_some());
        assert!(record.forward_sources.is_empty());
        assert!(record.dont_forward_sources.is_empty());
        assert_eq!(record.last_reported_host, Some(ip4!("10.0.0.5")));
    });
    assert_invariants(&mut node);

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

// A source-specific join creates an INCLUDE-mode record with one
// running source timer.
#[test]
fn ssm_join() {
    let mut node = setup_igmp();
    let mut notifications_rx = subscribe(&mut node, "pim", IFINDEX);
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

    with_iface(&mut node, |iface| {
        let record = iface.state.groups.get(&group).unwrap();
        assert_eq!(record.filter_mode, FilterMode::Include);
        assert!(record.group_timer.is_none());
        assert_eq!(record.forward_sources.addresses(), btreeset! { source });
        let source_record = record.forward_sources.get(&source).unwrap();
        assert!(source_record.source_timer.is_some());
    });
    assert_invariants(&mut node);

    let notifications = drain_notifications(&mut node, &mut notifications_rx);
    assert_eq!(
        notifications,
        vec![(
            IpAddr::from(source),
            IpAddr::from(group),
            MembershipAction::Join
        )]
    );
}

// A BLOCK for the only source of an INCLUDE-mode record schedules
// query retransmissions; the source (and group) go away once the
// source timer expires.
#[test]
fn ssm_leave() {
    let mut node = setup_igmp();
    let mut notifications_rx = subscribe(&mut node, "pim", IFINDEX);
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
    drain_notifications(&mut node, &mut notifications_rx);
    ack_service_requests(&mut node);

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

    // A Group-and-Source-Specific Query goes out right away; one
    // retransmission remains outstanding.
    let requests = ack_service_requests(&mut node);
    assert!(requests.iter().any(|request| matches!(
        request,
        FeaRequest::SendPacket {
            dst,
            packet: ProtocolPacket::Query(query),
            ..
        } if *dst == IpAddr::from(group)
            && query.sources == btreeset! { IpAddr::from(source) }
    )));
    with_iface(&mut node, |iface| {
        let record = iface.state.groups.get(&group).unwrap();
        assert_eq!(record.filter_mode, FilterMode::Include);
        assert!(record.group_query_timer.is_some());
        let source_record = record.forward_sources.get(&source).unwrap();
        assert_eq!(source_record.query_retransmission_count, 1);
    });
    assert!(drain_notifications(&mut node, &mut notifications_rx).is_empty());

    // Source timer expiry removes the source record and the now-empty
    // group record.
    let (mut instance, interfaces) = node.instance.as_up().unwrap();
    mgmd::events::process_source_timeout(
        &mut instance,
        interfaces,
        IFINDEX,
        group,
        source,
    );
    with_iface(&mut node, |iface| {
        assert!(iface.state.groups.get(&group).is_none());
    });

    let notifications = drain_notifications(&mut node, &mut notifications_rx);
    assert_eq!(
        notifications,
        vec![(
            IpAddr::from(source),
            IpAddr::from(group),
            MembershipAction::Prune
        )]
    );
}

// Filter mode change INCLUDE -> EXCLUDE.
#[test]
fn filter_mode_change() {
    let mut node = setup_igmp();
    let mut notifications_rx = subscribe(&mut node, "pim", IFINDEX);
    let group = ip4!("239.7.7.7");
    let (source_a, source_b, source_c) =
        (ip4!("10.1.1.1"), ip4!("10.1.1.2"), ip4!("10.1.1.3"));

    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("10.0.0.6").into(),
        v3_report(vec![report_record(
            ReportRecordType::ModeIsInclude,
            group.into(),
            &[source_a.into(), source_b.into()],
        )]),
    );
    drain_notifications(&mut node, &mut notifications_rx);
    ack_service_requests(&mut node);

    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("10.0.0.6").into(),
        v3_report(vec![report_record(
            ReportRecordType::ChangeToExclude,
            group.into(),
            &[source_b.into(), source_c.into()],
        )]),
    );

    with_iface(&mut node, |iface| {
        let record = iface.state.groups.get(&group).unwrap();
        assert_eq!(record.filter_mode, FilterMode::Exclude);
        assert!(record.group_timer.is_some());
        assert_eq!(
            record.forward_sources.addresses(),
            btreeset! { source_b }
        );
        assert_eq!(
            record.dont_forward_sources.addresses(),
            btreeset! { source_c }
        );
    });
    assert_invariants(&mut node);

    // A Group-and-Source-Specific Query is scheduled for the
    // still-forwarded sources.
    let requests = ack_service_requests(&mut node);
    assert!(requests.iter().any(|request| matches!(
        request,
        FeaRequest::SendPacket {
            packet: ProtocolPacket::Query(query),
            ..
        } if query.sources == btreeset! { IpAddr::from(source_b) }
    )));

    let notifications = drain_notifications(&mut node, &mut notifications_rx);
    assert_eq!(
        notifications,
        vec![
            (
                IpAddr::from(source_a),
                IpAddr::from(group),
                MembershipAction::Prune
            ),
            (
                IpAddr::from(ip4!("0.0.0.0")),
                IpAddr::from(group),
                MembershipAction::Join
            ),
            (
                IpAddr::from(source_c),
                IpAddr::from(group),
                MembershipAction::Prune
            ),
        ]
    );
}

// Querier election: a General Query from a lower address wins; once
// the Other Querier Present timer expires we resume querier duties.
#[test]
fn querier_election() {
    let mut node = setup_igmp();

    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("192.0.2.5").into(),
        general_query(3, ip4!("0.0.0.0").into()),
    );

    with_iface(&mut node, |iface| {
        assert!(!iface.is_querier());
        assert!(iface.state.general_query_timer.is_none());
        assert!(iface.state.other_querier_present_timer.is_some());
        assert_eq!(iface.state.querier_addr, Some(ip4!("192.0.2.5")));
    });

    // A General Query from a higher address does not preempt the
    // current querier.
    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("192.0.2.99").into(),
        general_query(3, ip4!("0.0.0.0").into()),
    );
    with_iface(&mut node, |iface| {
        assert_eq!(iface.state.querier_addr, Some(ip4!("192.0.2.5")));
    });

    // Other Querier Present timeout: resume querier duties and send a
    // General Query immediately.
    let (mut instance, interfaces) = node.instance.as_up().unwrap();
    mgmd::events::process_other_querier_timeout(
        &mut instance,
        interfaces,
        IFINDEX,
    );
    with_iface(&mut node, |iface| {
        assert!(iface.is_querier());
        assert!(iface.state.other_querier_present_timer.is_none());
        assert_eq!(iface.state.querier_addr, Some(ip4!("192.0.2.10")));
    });
    let requests = ack_service_requests(&mut node);
    assert!(requests.iter().any(|request| matches!(
        request,
        FeaRequest::SendPacket {
            dst,
            packet: ProtocolPacket::Query(query),
            ..
        } if *dst == IpAddr::from(ip4!("224.0.0.1"))
            && query.group == IpAddr::from(ip4!("0.0.0.0"))
    )));
}

// Older-version host compatibility: a v2 report arms the host-present
// timer, and source lists are ignored while it runs.
#[test]
fn older_host_compatibility() {
    let mut node = setup_igmp();
    let group = ip4!("239.9.9.9");

    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("10.0.0.5").into(),
        older_report(2, group.into()),
    );

    with_iface(&mut node, |iface| {
        let record = iface.state.groups.get(&group).unwrap();
        assert_eq!(record.filter_mode, FilterMode::Exclude);
        assert!(record.v2_or_mldv1_host_present_timer.is_some());
        assert!(record.v1_host_present_timer.is_none());
    });

    // The source list of an IS_EX is dropped while the group runs in
    // v2 compatibility mode.
    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("10.0.0.6").into(),
        v3_report(vec![report_record(
            ReportRecordType::ModeIsExclude,
            group.into(),
            &[ip4!("10.1.1.1").into()],
        )]),
    );
    with_iface(&mut node, |iface| {
        let record = iface.state.groups.get(&group).unwrap();
        assert_eq!(record.filter_mode, FilterMode::Exclude);
        assert!(record.forward_sources.is_empty());
        assert!(record.dont_forward_sources.is_empty());
    });
    assert_invariants(&mut node);
}

// Receiving the same IS_IN twice in a row leaves the state unchanged.
#[test]
fn is_in_idempotence() {
    let mut node = setup_igmp();
    let group = ip4!("232.1.1.1");
    let source = ip4!("10.1.1.1");

    for _ in 0..2 {
        recv_packet(
            &mut node,
            IFNAME,
            IFINDEX,
            ip4!("10.0.0.6").into(),
            v3_report(vec![report_record(
                ReportRecordType::ModeIsInclude,
                group.into(),
                &[source.into()],
            )]),
        );
        with_iface(&mut node, |iface| {
            assert_eq!(iface.state.groups.len(), 1);
            let record = iface.state.groups.get(&group).unwrap();
            assert_eq!(record.filter_mode, FilterMode::Include);
            assert_eq!(
                record.forward_sources.addresses(),
                btreeset! { source }
            );
        });
        assert_invariants(&mut node);
    }
}

// TO_EX({}) followed by group timer expiry returns the group to the
// unused state.
#[test]
fn group_timer_expiry_round_trip() {
    let mut node = setup_igmp();
    let mut notifications_rx = subscribe(&mut node, "pim", IFINDEX);
    let group = ip4!("239.4.4.4");

    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("10.0.0.5").into(),
        v3_report(vec![report_record(
            ReportRecordType::ChangeToExclude,
            group.into(),
            &[],
        )]),
    );
    with_iface(&mut node, |iface| {
        assert!(iface.state.groups.get(&group).is_some());
    });
    drain_notifications(&mut node, &mut notifications_rx);

    let (mut instance, interfaces) = node.instance.as_up().unwrap();
    mgmd::events::process_group_timeout(
        &mut instance,
        interfaces,
        IFINDEX,
        group,
    );
    with_iface(&mut node, |iface| {
        assert!(iface.state.groups.get(&group).is_none());
    });

    let notifications = drain_notifications(&mut node, &mut notifications_rx);
    assert_eq!(
        notifications,
        vec![(
            IpAddr::from(ip4!("0.0.0.0")),
            IpAddr::from(group),
            MembershipAction::Prune
        )]
    );
}

// In EXCLUDE mode an expired source migrates to the "don't forward"
// set and the downstream protocols see two PRUNEs.
#[test]
fn exclude_source_expiry() {
    let mut node = setup_igmp();
    let mut notifications_rx = subscribe(&mut node, "pim", IFINDEX);
    let group = ip4!("239.6.6.6");
    let source = ip4!("10.1.1.1");

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
    drain_notifications(&mut node, &mut notifications_rx);

    let (mut instance, interfaces) = node.instance.as_up().unwrap();
    mgmd::events::process_source_timeout(
        &mut instance,
        interfaces,
        IFINDEX,
        group,
        source,
    );

    with_iface(&mut node, |iface| {
        let record = iface.state.groups.get(&group).unwrap();
        assert_eq!(record.filter_mode, FilterMode::Exclude);
        assert!(record.forward_sources.is_empty());
        assert_eq!(
            record.dont_forward_sources.addresses(),
            btreeset! { source }
        );
    });
    assert_invariants(&mut node);

    let notifications = drain_notifications(&mut node, &mut notifications_rx);
    assert_eq!(
        notifications,
        vec![
            (
                IpAddr::from(source),
                IpAddr::from(group),
                MembershipAction::Prune
            ),
            (
                IpAddr::from(source),
                IpAddr::from(group),
                MembershipAction::Prune
            ),
        ]
    );
}

// Group timer expiry with running source timers transitions the
// record back to INCLUDE mode.
#[test]
fn group_timer_expiry_to_include() {
    let mut node = setup_igmp();
    let mut notifications_rx = subscribe(&mut node, "pim", IFINDEX);
    let group = ip4!("239.6.6.6");
    let source = ip4!("10.1.1.1");

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
    drain_notifications(&mut node, &mut notifications_rx);

    let (mut instance, interfaces) = node.instance.as_up().unwrap();
    mgmd::events::process_group_timeout(
        &mut instance,
        interfaces,
        IFINDEX,
        group,
    );

    with_iface(&mut node, |iface| {
        let record = iface.state.groups.get(&group).unwrap();
        assert_eq!(record.filter_mode, FilterMode::Include);
        assert!(record.group_timer.is_none());
        assert_eq!(record.forward_sources.addresses(), btreeset! { source });
    });
    assert_invariants(&mut node);

    let notifications = drain_notifications(&mut node, &mut notifications_rx);
    assert_eq!(
        notifications,
        vec![(
            IpAddr::from(ip4!("0.0.0.0")),
            IpAddr::from(group),
            MembershipAction::Prune
        )]
    );
}

// Leave messages are ignored while the interface is statically
// configured for IGMPv1.
#[test]
fn v1_mode_ignores_leave() {
    let mut node = setup_igmp();
    let group = ip4!("239.3.3.3");

    config(
        &mut node,
        ConfigRequest::InterfaceVersion {
            ifname: IFNAME.to_owned(),
            version: 1,
        },
    );

    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("10.0.0.5").into(),
        older_report(1, group.into()),
    );
    with_iface(&mut node, |iface| {
        let record = iface.state.groups.get(&group).unwrap();
        assert_eq!(record.filter_mode, FilterMode::Exclude);
        assert!(record.v1_host_present_timer.is_some());
    });

    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("10.0.0.5").into(),
        ProtocolPacket::Leave(LeavePacket {
            group: group.into(),
        }),
    );
    with_iface(&mut node, |iface| {
        let record = iface.state.groups.get(&group).unwrap();
        assert_eq!(record.filter_mode, FilterMode::Exclude);
        assert!(record.group_timer.is_some());
    });
}

// Reports without the Router Alert option are dropped when the check
// is enabled.
#[test]
fn router_alert_check() {
    let mut node = setup_igmp();
    let group = ip4!("239.1.2.3");

    config(
        &mut node,
        ConfigRequest::InterfaceRouterAlertCheck {
            ifname: IFNAME.to_owned(),
            enabled: true,
        },
    );

    recv_packet_raw(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("10.0.0.5").into(),
        1,
        false,
        older_report(2, group.into()),
    );

    with_iface(&mut node, |iface| {
        assert!(iface.state.groups.get(&group).is_none());
        assert_eq!(iface.state.statistics.bad_packets_rcvd, 1);
    });
}

// A downstream protocol subscribing mid-flight receives a JOIN replay
// for every ASM group currently in EXCLUDE mode.
#[test]
fn subscriber_resync() {
    let mut node = setup_igmp();
    let group = ip4!("239.1.2.3");
    let ssm_group = ip4!("232.5.5.5");

    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip4!("10.0.0.5").into(),
        v3_report(vec![
            report_record(ReportRecordType::ModeIsExclude, group.into(), &[]),
            report_record(
                ReportRecordType::AllowNewSources,
                ssm_group.into(),
                &[ip4!("10.1.1.1").into()],
            ),
        ]),
    );

    let mut notifications_rx = subscribe(&mut node, "pim", IFINDEX);
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

// MLD runs the same engine: an MLDv1 report arms the compatibility
// timer and an MLDv2 IS_EX has its source list dropped.
#[test]
fn mld_older_host_compatibility() {
    let mut node = setup::<Mld>();
    bring_up_interface(&mut node, IFNAME, IFINDEX, "fe80::10/64");
    let group = ip6!("ff05::123");

    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip6!("fe80::5").into(),
        older_report(1, group.into()),
    );
    recv_packet(
        &mut node,
        IFNAME,
        IFINDEX,
        ip6!("fe80::6").into(),
        v3_report(vec![report_record(
            ReportRecordType::ModeIsExclude,
            group.into(),
            &[ip6!("2001:db8::1").into()],
        )]),
    );

    let (_, iface) = node.instance.interfaces.get_by_ifindex(IFINDEX).unwrap();
    let record = iface.state.groups.get(&group).unwrap();
    assert_eq!(record.filter_mode, FilterMode::Exclude);
    assert!(record.v2_or_mldv1_host_present_timer.is_some());
    assert!(record.forward_sources.is_empty());
    assert!(record.dont_forward_sources.is_empty());
}

// Operational state reports the learned group entries.
#[test]
fn operational_state() {
    let mut node = setup_igmp();
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

    let (reply_tx, mut reply_rx) = tokio::sync::oneshot::channel();
    mgmd::northbound::process_request(
        &mut node.instance,
        mgmd::northbound::Request::GetGroups { reply: reply_tx },
    );
    let entries = reply_rx.try_recv().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].ifname, IFNAME);
    assert_eq!(entries[0].group, IpAddr::from(group));
    assert_eq!(entries[0].filter_mode, FilterMode::Exclude);
    assert_eq!(
        entries[0].last_reported_host,
        Some(IpAddr::from(ip4!("10.0.0.5")))
    );

    let (reply_tx, mut reply_rx) = tokio::sync::oneshot::channel();
    mgmd::northbound::process_request(
        &mut node.instance,
        mgmd::northbound::Request::GetInterfaces { reply: reply_tx },
    );
    let entries = reply_rx.try_recv().unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].active);
    assert!(entries[0].is_querier);
    assert_eq!(entries[0].group_count, 1);
}

// Directly-connected address checks honor the configured subnets.
#[test]
fn directly_connected() {
    let mut node = setup_igmp();

    with_iface(&mut node, |iface| {
        assert!(iface.is_directly_connected(ip4!("192.0.2.77")));
        assert!(!iface.is_directly_connected(ip4!("198.51.100.1")));
    });
}
