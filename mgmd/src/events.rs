//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;

use mgmd_utils::bus::{
    FeaRxPacketMsg, FinderEventMsg, LeavePacket, MembershipAction,
    ProtocolPacket, ProtocolSubscribeMsg, ProtocolUnsubscribeMsg, QueryPacket,
    ReportOlderPacket, ReportPacket, ReportRecordType,
};
use mgmd_utils::ip::IpAddrKind;
use mgmd_utils::protocol::Protocol;

use crate::consts;
use crate::debug::{Debug, InstanceInactiveReason};
use crate::error::Error;
use crate::group::OlderHostTimer;
use crate::instance::InstanceUpView;
use crate::interface::{Interface, InterfaceView, Interfaces};
use crate::rpc::{self, FeaTask};
use crate::version::Version;
use crate::{output, tasks};

// ===== Protocol packet receipt =====

pub fn process_packet<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    msg: FeaRxPacketMsg,
) -> Result<(), Error>
where
    V: Version,
{
    // Lookup interface.
    let Some((_, iface)) = interfaces.get_mut_by_ifindex(msg.ifindex) else {
        return Err(Error::InterfaceUnknown(msg.ifname));
    };

    // Ignore packets received on inactive interfaces.
    if !iface.state.active {
        return Ok(());
    }

    // Only packets of the instance's own protocol are expected.
    if msg.ip_protocol != V::IP_PROTOCOL {
        bad_packet(iface);
        return Err(Error::PacketBadIpProtocol(msg.src, msg.ip_protocol));
    }

    let Some(src) = V::IpAddr::get(msg.src) else {
        bad_packet(iface);
        return Err(Error::PacketBadSourceAddress(msg.src));
    };

    // Log received packet.
    if instance.config.trace_opts.packets_rx {
        Debug::<V>::PacketRx(&iface.name, &src, &msg.packet).log();
    }

    // Protocol messages are link-local; their TTL (hop limit) must be
    // one.
    if msg.ttl != consts::PROTOCOL_TTL {
        bad_packet(iface);
        return Err(Error::PacketBadTtl(msg.src, msg.ttl));
    }

    // Enforce the Router Alert option when configured to do so.
    if iface.config.ip_router_alert_option_check && !msg.router_alert {
        bad_packet(iface);
        return Err(Error::PacketMissingRouterAlert(msg.src));
    }

    // MLD messages must carry a link-local source address; IGMP
    // reports may come from a not-yet-configured host.
    let src_ok = match V::PROTOCOL {
        Protocol::IGMP => !src.is_multicast(),
        Protocol::MLD => src.is_valid_source(),
    };
    if !src_ok {
        bad_packet(iface);
        return Err(Error::PacketBadSourceAddress(msg.src));
    }

    match msg.packet {
        ProtocolPacket::Query(query) => {
            process_query(instance, iface, src, query)
        }
        ProtocolPacket::Report(report) => {
            process_report(instance, iface, src, report)
        }
        ProtocolPacket::ReportOlder(report) => {
            process_report_older(instance, iface, src, report)
        }
        ProtocolPacket::Leave(leave) => {
            process_leave(instance, iface, src, leave)
        }
    }
}

fn bad_packet<V>(iface: &mut Interface<V>)
where
    V: Version,
{
    iface.state.statistics.bad_packets_rcvd += 1;
    iface.state.statistics.update_discontinuity_time();
}

// Membership query receipt: querier election (RFC 2236 Section 7,
// RFC 3376 Section 6.6.2) and router-side timer lowering.
fn process_query<V>(
    instance: &mut InstanceUpView<'_, V>,
    iface: &mut Interface<V>,
    src: V::IpAddr,
    query: QueryPacket,
) -> Result<(), Error>
where
    V: Version,
{
    iface.state.statistics.queries_rcvd += 1;
    instance.state.statistics.msgs_rcvd.total += 1;
    instance.state.statistics.msgs_rcvd.query += 1;

    // Queries from an unspecified source cannot take part in the
    // querier election.
    if src.is_unspecified() {
        bad_packet(iface);
        return Err(Error::PacketBadSourceAddress(src.into()));
    }

    let Some(group) = V::IpAddr::get(query.group) else {
        bad_packet(iface);
        return Err(Error::PacketBadGroupAddress(query.group));
    };
    let is_general = group.is_unspecified();

    let ifindex = iface.system.ifindex.unwrap();
    let primary_addr = iface.state.primary_addr.unwrap();

    // Querier election: a General Query from a lower address wins.
    if is_general && src < primary_addr {
        if iface.is_querier() {
            Debug::<V>::QuerierResign(&iface.name, &src).log();
        }
        iface.state.querier_addr = Some(src);
        iface.state.general_query_timer = None;
        iface.state.startup_query_count = 0;
        let timer = tasks::other_querier_present_timer(
            ifindex,
            iface.config.other_querier_present_interval(),
            &instance.tx.protocol_input.other_querier_timeout,
        );
        iface.state.other_querier_present_timer = Some(timer);
    }

    // A Group-Specific or Group-and-Source-Specific Query heard from
    // another querier lowers the matching timers, unless router-side
    // processing is suppressed.
    if !is_general && src != primary_addr && !query.suppress_router_processing
    {
        let timeout = iface.config.last_member_query_time();
        let sources: BTreeSet<V::IpAddr> = query
            .sources
            .iter()
            .copied()
            .filter_map(V::IpAddr::get)
            .collect();
        if sources.is_empty() {
            iface.state.groups.lower_group_timer(group, timeout);
        } else {
            let view = InterfaceView {
                ifindex,
                ifname: &iface.name,
                primary_addr,
                config: &iface.config,
            };
            iface.state.groups.lower_source_timer(
                instance, &view, group, &sources, timeout,
            );
        }
    }

    Ok(())
}

// IGMPv3/MLDv2 membership report receipt.
fn process_report<V>(
    instance: &mut InstanceUpView<'_, V>,
    iface: &mut Interface<V>,
    src: V::IpAddr,
    report: ReportPacket,
) -> Result<(), Error>
where
    V: Version,
{
    iface.state.statistics.reports_rcvd += 1;
    instance.state.statistics.msgs_rcvd.total += 1;
    instance.state.statistics.msgs_rcvd.report += 1;

    let ifindex = iface.system.ifindex.unwrap();
    let primary_addr = iface.state.primary_addr.unwrap();
    let view = InterfaceView {
        ifindex,
        ifname: &iface.name,
        primary_addr,
        config: &iface.config,
    };

    for record in report.records {
        let Some(group) = V::IpAddr::get(record.group) else {
            Error::PacketBadGroupAddress(record.group).log();
            continue;
        };
        if !group.is_multicast() || group.is_multicast_link_local() {
            Error::PacketBadGroupAddress(record.group).log();
            continue;
        }
        let sources: BTreeSet<V::IpAddr> = record
            .sources
            .iter()
            .copied()
            .filter_map(V::IpAddr::get)
            .collect();

        match record.record_type {
            ReportRecordType::ModeIsInclude => {
                iface.state.groups.process_mode_is_include(
                    instance, &view, group, &sources, src,
                );
            }
            ReportRecordType::ModeIsExclude => {
                iface.state.groups.process_mode_is_exclude(
                    instance, &view, group, &sources, src,
                );
            }
            ReportRecordType::ChangeToInclude => {
                iface.state.groups.process_change_to_include_mode(
                    instance, &view, group, &sources, src,
                );
            }
            ReportRecordType::ChangeToExclude => {
                iface.state.groups.process_change_to_exclude_mode(
                    instance, &view, group, &sources, src,
                );
            }
            ReportRecordType::AllowNewSources => {
                iface.state.groups.process_allow_new_sources(
                    instance, &view, group, &sources, src,
                );
            }
            ReportRecordType::BlockOldSources => {
                iface.state.groups.process_block_old_sources(
                    instance, &view, group, &sources, src,
                );
            }
        }
    }

    Ok(())
}

// IGMPv1/IGMPv2/MLDv1 membership report receipt. Processed as
// MODE_IS_EXCLUDE with an empty source list (RFC 3376 Section 7.3.2),
// after arming the matching older-version-host-present timer.
fn process_report_older<V>(
    instance: &mut InstanceUpView<'_, V>,
    iface: &mut Interface<V>,
    src: V::IpAddr,
    report: ReportOlderPacket,
) -> Result<(), Error>
where
    V: Version,
{
    iface.state.statistics.reports_rcvd += 1;
    instance.state.statistics.msgs_rcvd.total += 1;
    instance.state.statistics.msgs_rcvd.report += 1;

    let Some(group) = V::IpAddr::get(report.group) else {
        bad_packet(iface);
        return Err(Error::PacketBadGroupAddress(report.group));
    };
    if !group.is_multicast() || group.is_multicast_link_local() {
        bad_packet(iface);
        return Err(Error::PacketBadGroupAddress(report.group));
    }

    let ifindex = iface.system.ifindex.unwrap();
    let primary_addr = iface.state.primary_addr.unwrap();
    let view = InterfaceView {
        ifindex,
        ifname: &iface.name,
        primary_addr,
        config: &iface.config,
    };

    iface
        .state
        .groups
        .record_older_report(instance, &view, group, report.version);
    iface.state.groups.process_mode_is_exclude(
        instance,
        &view,
        group,
        &BTreeSet::new(),
        src,
    );

    Ok(())
}

// IGMPv2 Leave Group / MLDv1 Done receipt. Processed as
// CHANGE_TO_INCLUDE_MODE with an empty source list.
fn process_leave<V>(
    instance: &mut InstanceUpView<'_, V>,
    iface: &mut Interface<V>,
    src: V::IpAddr,
    leave: LeavePacket,
) -> Result<(), Error>
where
    V: Version,
{
    iface.state.statistics.leaves_rcvd += 1;
    instance.state.statistics.msgs_rcvd.total += 1;
    instance.state.statistics.msgs_rcvd.leave += 1;

    let Some(group) = V::IpAddr::get(leave.group) else {
        bad_packet(iface);
        return Err(Error::PacketBadGroupAddress(leave.group));
    };
    if !group.is_multicast() || group.is_multicast_link_local() {
        bad_packet(iface);
        return Err(Error::PacketBadGroupAddress(leave.group));
    }

    let ifindex = iface.system.ifindex.unwrap();
    let primary_addr = iface.state.primary_addr.unwrap();
    let view = InterfaceView {
        ifindex,
        ifname: &iface.name,
        primary_addr,
        config: &iface.config,
    };

    iface.state.groups.process_change_to_include_mode(
        instance,
        &view,
        group,
        &BTreeSet::new(),
        src,
    );

    Ok(())
}

// ===== Timer events =====

pub fn process_general_query_interval<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    ifindex: u32,
) where
    V: Version,
{
    let Some((_, iface)) = interfaces.get_mut_by_ifindex(ifindex) else {
        return;
    };
    if !iface.state.active || !iface.is_querier() {
        return;
    }

    {
        let view = InterfaceView {
            ifindex,
            ifname: &iface.name,
            primary_addr: iface.state.primary_addr.unwrap(),
            config: &iface.config,
        };
        output::general_query(instance, &view);
    }

    // Fall back to the steady query cadence once the startup burst is
    // over.
    if iface.state.startup_query_count > 0 {
        iface.state.startup_query_count -= 1;
        if iface.state.startup_query_count == 0 {
            let interval = iface.config.query_interval;
            if let Some(timer) = iface.state.general_query_timer.as_mut() {
                timer.reset(Some(interval));
            }
        }
    }
}

pub fn process_other_querier_timeout<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    ifindex: u32,
) where
    V: Version,
{
    let Some((_, iface)) = interfaces.get_mut_by_ifindex(ifindex) else {
        return;
    };
    if !iface.state.active {
        return;
    }

    let primary_addr = iface.state.primary_addr.unwrap();

    // Resume querier duties.
    Debug::<V>::QuerierElect(&iface.name, &primary_addr).log();
    iface.state.other_querier_present_timer = None;
    iface.state.querier_addr = Some(primary_addr);
    {
        let view = InterfaceView {
            ifindex,
            ifname: &iface.name,
            primary_addr,
            config: &iface.config,
        };
        output::general_query(instance, &view);
    }
    let timer = tasks::general_query_interval(
        ifindex,
        iface.config.query_interval,
        &instance.tx.protocol_input.general_query_interval,
    );
    iface.state.general_query_timer = Some(timer);
}

pub fn process_group_timeout<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    ifindex: u32,
    group: V::IpAddr,
) where
    V: Version,
{
    let Some((_, iface)) = interfaces.get_mut_by_ifindex(ifindex) else {
        return;
    };
    if !iface.state.active {
        return;
    }

    let view = InterfaceView {
        ifindex,
        ifname: &iface.name,
        primary_addr: iface.state.primary_addr.unwrap(),
        config: &iface.config,
    };
    iface
        .state
        .groups
        .process_group_timer_expiry(instance, &view, group);
}

pub fn process_source_timeout<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    ifindex: u32,
    group: V::IpAddr,
    source: V::IpAddr,
) where
    V: Version,
{
    let Some((_, iface)) = interfaces.get_mut_by_ifindex(ifindex) else {
        return;
    };
    if !iface.state.active {
        return;
    }

    let view = InterfaceView {
        ifindex,
        ifname: &iface.name,
        primary_addr: iface.state.primary_addr.unwrap(),
        config: &iface.config,
    };
    iface
        .state
        .groups
        .process_source_timer_expiry(instance, &view, group, source);
}

pub fn process_group_query_interval<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    ifindex: u32,
    group: V::IpAddr,
) where
    V: Version,
{
    let Some((_, iface)) = interfaces.get_mut_by_ifindex(ifindex) else {
        return;
    };
    if !iface.state.active {
        return;
    }

    let view = InterfaceView {
        ifindex,
        ifname: &iface.name,
        primary_addr: iface.state.primary_addr.unwrap(),
        config: &iface.config,
    };
    iface
        .state
        .groups
        .process_group_query_interval(instance, &view, group);
}

pub fn process_host_present_timeout<V>(
    _instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    ifindex: u32,
    group: V::IpAddr,
    timer: OlderHostTimer,
) where
    V: Version,
{
    let Some((_, iface)) = interfaces.get_mut_by_ifindex(ifindex) else {
        return;
    };

    iface.state.groups.process_host_present_timeout(group, timer);
}

// ===== Finder events =====

// Handles finder connectivity and target liveness events. Returns the
// reason to shut the instance down, if any.
pub fn process_finder_event<V>(
    instance: &mut InstanceUpView<'_, V>,
    _interfaces: &mut Interfaces<V>,
    event: FinderEventMsg,
) -> Option<InstanceInactiveReason>
where
    V: Version,
{
    match event {
        FinderEventMsg::Connected => {
            instance.state.services.finder_alive = true;

            // Re-register interest in the service classes.
            if !instance.state.services.fea_registered {
                let target = instance.config.fea_target.clone();
                rpc::fea_task_push(
                    instance,
                    FeaTask::RegisterUnregisterInterest {
                        target,
                        is_register: true,
                    },
                );
            }
            if !instance.state.services.mfea_registered {
                let target = instance.config.mfea_target.clone();
                rpc::fea_task_push(
                    instance,
                    FeaTask::RegisterUnregisterInterest {
                        target,
                        is_register: true,
                    },
                );
            }
            None
        }
        FinderEventMsg::Disconnected => {
            // All registrations are void until the finder returns; no
            // further requests are dispatched in the meantime.
            instance.state.services.finder_alive = false;
            instance.state.services.fea_registered = false;
            instance.state.services.mfea_registered = false;
            None
        }
        FinderEventMsg::TargetBirth { class, .. } => {
            if class == instance.config.fea_target {
                instance.state.services.fea_alive = true;
            }
            if class == instance.config.mfea_target {
                instance.state.services.mfea_alive = true;
            }
            rpc::fea_dispatch(instance);
            rpc::membership_dispatch(instance);
            None
        }
        FinderEventMsg::TargetDeath { class, .. } => {
            if class == instance.config.fea_target
                || class == instance.config.mfea_target
            {
                Error::ServiceDeath(class).log();
                return Some(InstanceInactiveReason::ServiceDown);
            }
            None
        }
    }
}

// ===== Downstream protocol subscriptions =====

// Registers a downstream protocol for membership notifications on one
// interface and replays the currently forwarded ASM groups so a
// late-joining protocol resynchronizes.
pub fn process_protocol_subscribe<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    msg: ProtocolSubscribeMsg,
) where
    V: Version,
{
    let Some(tx) = msg.tx else {
        return;
    };

    instance
        .state
        .subscribers
        .insert(msg.module_name.clone(), tx);
    instance
        .state
        .subscriptions
        .insert((msg.module_name.clone(), msg.ifindex));

    let Some((_, iface)) = interfaces.get_by_ifindex(msg.ifindex) else {
        return;
    };
    let ifname = iface.name.clone();
    let groups: Vec<V::IpAddr> = iface
        .state
        .groups
        .iter()
        .filter(|(_, record)| {
            record.filter_mode == crate::group::FilterMode::Exclude
        })
        .map(|(group, _)| *group)
        .collect();
    for group in groups {
        rpc::membership_task_push(
            instance,
            msg.module_name.clone(),
            ifname.clone(),
            msg.ifindex,
            V::IpAddr::unspecified(),
            group,
            MembershipAction::Join,
        );
    }
}

pub fn process_protocol_unsubscribe<V>(
    instance: &mut InstanceUpView<'_, V>,
    msg: ProtocolUnsubscribeMsg,
) where
    V: Version,
{
    instance
        .state
        .subscriptions
        .remove(&(msg.module_name.clone(), msg.ifindex));

    // Drop the notification channel once the last subscription of the
    // module is gone.
    if !instance
        .state
        .subscriptions
        .iter()
        .any(|(module_name, _)| *module_name == msg.module_name)
    {
        instance.state.subscribers.remove(&msg.module_name);
    }
}
